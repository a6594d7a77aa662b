//! Pub/sub transport abstraction and its MQTT implementation
//!
//! `MessageTransport` is the narrow contract every component publishes
//! and subscribes through. `MqttTransport` is the only implementation:
//! it drives `rumqttc`'s event loop on a dedicated task and forwards
//! every incoming publish into a channel the event-loop owner drains on
//! its own thread, never invoking handlers directly from the I/O task.

mod mqtt;

pub use mqtt::MqttTransport;

use aiko_core::event_loop::QueueItem;
use async_trait::async_trait;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

impl From<TransportError> for aiko_core::Error {
    fn from(err: TransportError) -> Self {
        aiko_core::Error::Transport(err.to_string())
    }
}

/// The pub/sub contract every Aiko Services component publishes and
/// subscribes through. Incoming messages never reach a handler directly;
/// they are enqueued as a [`QueueItem`] with `type_tag` set to the topic
/// they arrived on.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, retain: bool, wait: bool) -> Result<()>;
    async fn subscribe(&self, topics: &[String]) -> Result<()>;
    async fn unsubscribe(&self, topics: &[String]) -> Result<()>;
    async fn set_last_will_and_testament(&self, topic: &str, payload: &str, retain: bool) -> Result<()>;
}

/// Topic tag used on every [`QueueItem`] produced from an incoming
/// publish, so event-loop handlers can register interest by literal
/// topic string.
pub fn topic_type_tag(topic: &str) -> String {
    topic.to_string()
}

pub(crate) fn incoming_queue_item(topic: &str, payload: &str) -> QueueItem {
    QueueItem {
        type_tag: topic_type_tag(topic),
        payload: payload.to_string(),
    }
}
