// Transport module: the pub/sub bus seen by directories and sessions
//
// Everything above this layer talks to `dyn Transport`. Two implementations
// live here: an in-process bus for tests and embedding, and a TCP broker with
// its matching client link.

pub mod broker;
pub mod link;
pub mod memory;
pub mod protocol;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use broker::{BrokerStats, TcpBroker};
pub use link::TcpLink;
pub use memory::{MemoryBus, MemoryLink};
pub use protocol::{Frame, ProtocolError, MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// A message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Receiving half handed out when a link is opened
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Publish/subscribe with at-most-once delivery and no retention.
///
/// Deliveries for every subscription arrive on the single
/// [`DeliveryReceiver`] returned when the link was opened.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start receiving messages whose topic matches `filter`
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Wait until everything published so far has left this process
    async fn flush(&self) -> Result<(), TransportError>;

    /// Close the link. The delivery receiver ends afterwards.
    async fn close(&self) -> Result<(), TransportError>;
}

/// MQTT-style matching: `+` matches one level, a trailing `#` matches the rest
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn validate_filter(filter: &str) -> Result<(), TransportError> {
    if filter.is_empty() {
        return Err(TransportError::InvalidFilter(filter.to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let wildcard_misused = (level.contains('#') && (*level != "#" || i + 1 != levels.len()))
            || (level.contains('+') && *level != "+");
        if wildcard_misused {
            return Err(TransportError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty() || topic.contains(|c: char| c == '+' || c == '#') {
        return Err(TransportError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}
