//! Address cache owned by one client session
//!
//! Filled by resolution replies on the dispatcher task and read by the
//! foreground. Waiters are woken on every insert and also re-check on a poll
//! interval.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// A peer address learned from the directory. Never authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCacheEntry {
    pub inbox_address: String,
    pub resolved_at: SystemTime,
    /// Write order within the book; later replies carry larger values
    pub generation: u64,
}

#[derive(Default)]
pub struct AddressBook {
    entries: Mutex<HashMap<String, AddressCacheEntry>>,
    /// Generation of the most recent insert
    generation: AtomicU64,
    updated: Notify,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: &str, inbox_address: &str) {
        {
            let mut entries = self.entries.lock();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            entries.insert(
                peer.to_string(),
                AddressCacheEntry {
                    inbox_address: inbox_address.to_string(),
                    resolved_at: SystemTime::now(),
                    generation,
                },
            );
        }
        self.updated.notify_waiters();
    }

    /// Generation of the latest insert. Entries written after this call
    /// compare greater.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Drop a stale entry. Returns whether one existed.
    pub fn evict(&self, peer: &str) -> bool {
        self.entries.lock().remove(peer).is_some()
    }

    pub fn get(&self, peer: &str) -> Option<String> {
        self.entries
            .lock()
            .get(peer)
            .map(|entry| entry.inbox_address.clone())
    }

    fn get_newer(&self, peer: &str, newer_than: u64) -> Option<String> {
        self.entries
            .lock()
            .get(peer)
            .filter(|entry| entry.generation > newer_than)
            .map(|entry| entry.inbox_address.clone())
    }

    /// All cached peers, sorted by name
    pub fn snapshot(&self) -> Vec<(String, AddressCacheEntry)> {
        let mut peers: Vec<(String, AddressCacheEntry)> = self
            .entries
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    /// Wait until `peer` has an entry written after generation `newer_than`,
    /// `timeout` elapses, or `cancel` turns true. Older entries do not count.
    ///
    /// Each iteration re-checks the cache under its lock. A wake-up comes
    /// from an insert or from `poll_interval`, whichever is first.
    pub async fn wait_for(
        &self,
        peer: &str,
        newer_than: u64,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so an insert between the
            // check and the select is not missed.
            let notified = self.updated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *cancel.borrow() {
                return None;
            }
            if let Some(address) = self.get_newer(peer, newer_than) {
                return Some(address);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let nap = poll_interval.min(deadline - now);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
