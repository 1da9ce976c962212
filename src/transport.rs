//! Transport abstraction for delivering notifications
//!
//! The notification service hands named events with JSON payloads to a
//! [`Transport`]; the transport owns serialization and the actual wire. The
//! shipped [`BroadcastTransport`] delivers in-process over a tokio broadcast
//! channel, which is enough for embedding the engine behind an SSE or
//! websocket layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::TransportError;
use crate::types::ObserverId;

/// Trait for delivering named events to topic subscription groups
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a named event with a payload to everyone in a topic
    async fn send_to_topic(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Register an observer's membership in a topic
    async fn join_topic(&self, observer: &ObserverId, topic: &str) -> Result<(), TransportError>;

    /// Remove an observer's membership from a topic
    async fn leave_topic(&self, observer: &ObserverId, topic: &str) -> Result<(), TransportError>;

    /// Whether the transport can currently deliver events
    fn is_available(&self) -> bool;
}

/// One event as seen by in-process subscribers of [`BroadcastTransport`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicEvent {
    /// Topic the event was sent to
    pub topic: String,

    /// Logical event name
    pub event: String,

    /// Structured payload
    pub payload: serde_json::Value,
}

/// In-process transport backed by a tokio broadcast channel
///
/// Every delivered event is fanned out to all subscribers; membership calls
/// are accepted and recorded only through tracing (filtering by topic is the
/// subscriber's job). Availability can be toggled, which makes this transport
/// double as the outage fixture in tests.
pub struct BroadcastTransport {
    tx: tokio::sync::broadcast::Sender<TopicEvent>,
    available: AtomicBool,
}

impl BroadcastTransport {
    /// Create a transport with the given event buffer size
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(buffer);
        Self {
            tx,
            available: AtomicBool::new(true),
        }
    }

    /// Subscribe to every event delivered through this transport
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TopicEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, for bridging into SSE or websocket handlers
    pub fn event_stream(&self) -> tokio_stream::wrappers::BroadcastStream<TopicEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.tx.subscribe())
    }

    /// Toggle availability; while unavailable, sends fail and the
    /// notification service queues events instead
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn send_to_topic(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable(
                "broadcast transport marked unavailable".to_string(),
            ));
        }

        // send() errs only when there are no receivers, which is fine - the
        // event is simply dropped, matching a topic with no members
        self.tx
            .send(TopicEvent {
                topic: topic.to_string(),
                event: event.to_string(),
                payload,
            })
            .ok();
        Ok(())
    }

    async fn join_topic(&self, observer: &ObserverId, topic: &str) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable(
                "broadcast transport marked unavailable".to_string(),
            ));
        }
        tracing::debug!(observer = %observer, topic = %topic, "observer joined topic");
        Ok(())
    }

    async fn leave_topic(&self, observer: &ObserverId, topic: &str) -> Result<(), TransportError> {
        tracing::debug!(observer = %observer, topic = %topic, "observer left topic");
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
