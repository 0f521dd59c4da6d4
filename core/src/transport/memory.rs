//! In-process bus: every link shares one routing table

use super::{
    topic_matches, validate_filter, validate_topic, Delivery, DeliveryReceiver, Transport,
    TransportError,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

struct LinkEntry {
    filters: HashSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    links: HashMap<u64, LinkEntry>,
}

/// A broker that lives inside the process.
///
/// Cloning gives another handle to the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<RwLock<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new link with no subscriptions
    pub fn connect(&self) -> (MemoryLink, DeliveryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;
        state.links.insert(
            id,
            LinkEntry {
                filters: HashSet::new(),
                tx,
            },
        );
        (
            MemoryLink {
                id,
                bus: self.clone(),
            },
            rx,
        )
    }

    pub fn link_count(&self) -> usize {
        self.state.read().links.len()
    }

    /// Drop every link, as if the broker went away. All receivers end.
    pub fn sever(&self) {
        self.state.write().links.clear();
    }

    /// Deliver to each link with at least one matching filter. Returns the
    /// number of links reached.
    fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let state = self.state.read();
        let mut reached = 0;
        for entry in state.links.values() {
            if !entry.filters.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if entry.tx.send(delivery).is_ok() {
                reached += 1;
            }
        }
        trace!("Routed {} to {} link(s)", topic, reached);
        reached
    }
}

/// One participant's connection to a [`MemoryBus`]
pub struct MemoryLink {
    id: u64,
    bus: MemoryBus,
}

impl MemoryLink {
    fn with_entry<T>(&self, f: impl FnOnce(&mut LinkEntry) -> T) -> Result<T, TransportError> {
        let mut state = self.bus.state.write();
        state
            .links
            .get_mut(&self.id)
            .map(f)
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for MemoryLink {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        validate_filter(filter)?;
        self.with_entry(|entry| {
            entry.filters.insert(filter.to_string());
        })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.with_entry(|entry| {
            entry.filters.remove(filter);
        })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        validate_topic(topic)?;
        if !self.bus.state.read().links.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        self.bus.route(topic, &payload);
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.with_entry(|_| ())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.bus.state.write().links.remove(&self.id);
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.bus.state.write().links.remove(&self.id);
    }
}
