//! Directory Service: the authoritative username -> inbox address map
//!
//! Every handler returns the envelopes it wants published instead of talking
//! to a transport, so the whole routing table can be exercised in memory.

use crate::identity::{ClientIdentity, SessionId, Username};
use crate::message::{
    Envelope, InboxMessage, RegisterOutcome, RejectReason, RelayStatus, Resolution, ResolveMode,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Directory configuration
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Registrations beyond this many connected users are rejected
    pub max_clients: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { max_clients: 1000 }
    }
}

/// Counters for directory activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Users currently registered
    pub connected: usize,
    pub registrations_accepted: u64,
    pub registrations_rejected: u64,
    pub resolutions: u64,
    pub relays_delivered: u64,
    pub relays_not_found: u64,
    pub disconnects: u64,
    /// Deliveries that could not be decoded or were not requests
    pub malformed_dropped: u64,
}

/// A connected user
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub username: Username,
    pub inbox_address: String,
    /// Session that won the registration
    pub session_id: SessionId,
    pub registered_at: SystemTime,
}

/// Result of one handler: the decision plus the replies to publish
#[derive(Debug, Clone)]
pub struct Handled<T> {
    pub outcome: T,
    pub replies: Vec<Envelope>,
}

pub struct DirectoryService {
    config: DirectoryConfig,
    /// username -> entry; an entry exists iff the user is connected
    entries: RwLock<HashMap<String, DirectoryEntry>>,
    stats: RwLock<DirectoryStats>,
}

impl DirectoryService {
    pub fn new() -> Self {
        Self::with_config(DirectoryConfig::default())
    }

    pub fn with_config(config: DirectoryConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(DirectoryStats::default()),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Route a decoded request to its handler.
    ///
    /// Envelopes the directory itself emits (results, replies, inbox
    /// messages, files) are not requests and are dropped.
    pub fn handle(&self, envelope: Envelope) -> Vec<Envelope> {
        match envelope {
            Envelope::Register {
                username,
                session_id,
            } => self.register(&username, &session_id).replies,
            Envelope::ResolveRequest {
                requester,
                target,
                mode,
            } => self.resolve(&requester, &target, mode).replies,
            Envelope::Relay {
                sender,
                target,
                text,
            } => self.relay(&sender, &target, &text).replies,
            Envelope::Disconnect { username } => {
                self.disconnect(&username);
                Vec::new()
            }
            other => {
                warn!("Ignoring {} envelope; not a directory request", other.kind());
                self.record_malformed();
                Vec::new()
            }
        }
    }

    /// Register `username` for the session `session_id`.
    ///
    /// A username already present is rejected and the existing entry is left
    /// untouched, whichever session asks.
    pub fn register(&self, username: &Username, session_id: &SessionId) -> Handled<RegisterOutcome> {
        let outcome = {
            let mut entries = self.entries.write();
            if entries.contains_key(username.as_str()) {
                RegisterOutcome::Rejected(RejectReason::AlreadyConnected)
            } else if entries.len() >= self.config.max_clients {
                RegisterOutcome::Rejected(RejectReason::DirectoryFull)
            } else {
                let identity = ClientIdentity::new(username.clone(), session_id.clone());
                entries.insert(
                    username.to_string(),
                    DirectoryEntry {
                        username: identity.username,
                        inbox_address: identity.inbox_address,
                        session_id: identity.session_id,
                        registered_at: SystemTime::now(),
                    },
                );
                RegisterOutcome::Accepted
            }
        };

        {
            let mut stats = self.stats.write();
            match &outcome {
                RegisterOutcome::Accepted => {
                    stats.registrations_accepted += 1;
                    stats.connected += 1;
                    info!("Registered {} (session {})", username, session_id);
                }
                RegisterOutcome::Rejected(reason) => {
                    stats.registrations_rejected += 1;
                    info!("Rejected registration of {}: {:?}", username, reason);
                }
            }
        }

        Handled {
            replies: vec![Envelope::RegisterResult {
                username: username.clone(),
                session_id: session_id.clone(),
                outcome: outcome.clone(),
            }],
            outcome,
        }
    }

    /// Look up `target` on behalf of `requester`.
    ///
    /// In broadcast mode a registered requester also receives its own
    /// address on the same reply channel.
    pub fn resolve(&self, requester: &Username, target: &str, mode: ResolveMode) -> Handled<Resolution> {
        let entries = self.entries.read();
        let resolution = match entries.get(target) {
            Some(entry) => Resolution::Found(entry.inbox_address.clone()),
            None => Resolution::NotFound,
        };

        let mut replies = vec![Envelope::ResolveReply {
            requester: requester.clone(),
            mode,
            name: target.to_string(),
            resolution: resolution.clone(),
        }];

        if mode == ResolveMode::Broadcast && target != requester.as_str() {
            if let Some(own) = entries.get(requester.as_str()) {
                replies.push(Envelope::ResolveReply {
                    requester: requester.clone(),
                    mode,
                    name: requester.to_string(),
                    resolution: Resolution::Found(own.inbox_address.clone()),
                });
            }
        }
        drop(entries);

        self.stats.write().resolutions += 1;
        debug!("{} resolved {}: {:?}", requester, target, resolution);

        Handled {
            outcome: resolution,
            replies,
        }
    }

    /// Deliver `text` to `target`'s inbox on behalf of `sender`
    pub fn relay(&self, sender: &Username, target: &str, text: &str) -> Handled<RelayStatus> {
        let inbox = self
            .entries
            .read()
            .get(target)
            .map(|entry| entry.inbox_address.clone());

        let mut replies = Vec::with_capacity(2);
        let status = match inbox {
            Some(address) => {
                replies.push(Envelope::Inbox {
                    address,
                    message: InboxMessage::ViaServer {
                        sender: sender.to_string(),
                        text: text.to_string(),
                    },
                });
                self.stats.write().relays_delivered += 1;
                debug!("Relayed message from {} to {}", sender, target);
                RelayStatus::Delivered {
                    target: target.to_string(),
                }
            }
            None => {
                self.stats.write().relays_not_found += 1;
                debug!("Relay from {} failed: {} not connected", sender, target);
                RelayStatus::NotFound {
                    target: target.to_string(),
                }
            }
        };

        replies.push(Envelope::RelayStatus {
            sender: sender.clone(),
            status: status.clone(),
        });

        Handled {
            outcome: status,
            replies,
        }
    }

    /// Remove `username`. Returns whether an entry existed.
    pub fn disconnect(&self, username: &Username) -> bool {
        let removed = self.entries.write().remove(username.as_str()).is_some();
        if removed {
            let mut stats = self.stats.write();
            stats.disconnects += 1;
            stats.connected = stats.connected.saturating_sub(1);
            info!("{} disconnected", username);
        } else {
            warn!("Disconnect for unknown user {}", username);
        }
        removed
    }

    pub fn lookup(&self, username: &str) -> Option<DirectoryEntry> {
        self.entries.read().get(username).cloned()
    }

    pub fn is_connected(&self, username: &str) -> bool {
        self.entries.read().contains_key(username)
    }

    /// Connected usernames, sorted
    pub fn connected_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.entries.read().keys().cloned().collect();
        users.sort();
        users
    }

    pub fn stats(&self) -> DirectoryStats {
        self.stats.read().clone()
    }

    pub fn record_malformed(&self) {
        self.stats.write().malformed_dropped += 1;
    }
}

impl Default for DirectoryService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> Username {
        Username::parse(name).unwrap()
    }

    fn session(id: &str) -> SessionId {
        SessionId::from_wire(id).unwrap()
    }

    #[test]
    fn test_register_accepts_new_user() {
        let service = DirectoryService::new();
        let handled = service.register(&user("alice"), &session("s1"));

        assert_eq!(handled.outcome, RegisterOutcome::Accepted);
        assert_eq!(
            service.lookup("alice").unwrap().inbox_address,
            "chat/alice/inbox"
        );
        assert!(matches!(
            &handled.replies[..],
            [Envelope::RegisterResult { outcome: RegisterOutcome::Accepted, session_id, .. }]
                if session_id.as_str() == "s1"
        ));
    }

    #[test]
    fn test_duplicate_username_is_rejected_without_change() {
        let service = DirectoryService::new();
        service.register(&user("alice"), &session("s1"));
        let second = service.register(&user("alice"), &session("s2"));

        assert_eq!(
            second.outcome,
            RegisterOutcome::Rejected(RejectReason::AlreadyConnected)
        );
        assert_eq!(service.lookup("alice").unwrap().session_id.as_str(), "s1");
        assert_eq!(service.stats().connected, 1);
        assert_eq!(service.stats().registrations_rejected, 1);
    }

    #[test]
    fn test_full_directory_rejects() {
        let service = DirectoryService::with_config(DirectoryConfig { max_clients: 1 });
        service.register(&user("alice"), &session("s1"));
        let handled = service.register(&user("bob"), &session("s2"));
        assert_eq!(
            handled.outcome,
            RegisterOutcome::Rejected(RejectReason::DirectoryFull)
        );
        assert!(!service.is_connected("bob"));
    }

    #[test]
    fn test_resolve_targeted_only_answers_target() {
        let service = DirectoryService::new();
        service.register(&user("alice"), &session("s1"));
        service.register(&user("bob"), &session("s2"));

        let handled = service.resolve(&user("alice"), "bob", ResolveMode::Targeted);
        assert_eq!(handled.outcome, Resolution::Found("chat/bob/inbox".into()));
        assert_eq!(handled.replies.len(), 1);
    }

    #[test]
    fn test_resolve_broadcast_includes_requester() {
        let service = DirectoryService::new();
        service.register(&user("alice"), &session("s1"));
        service.register(&user("bob"), &session("s2"));

        let handled = service.resolve(&user("alice"), "bob", ResolveMode::Broadcast);
        let names: Vec<&str> = handled
            .replies
            .iter()
            .filter_map(|r| match r {
                Envelope::ResolveReply { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["bob", "alice"]);
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let service = DirectoryService::new();
        let handled = service.resolve(&user("alice"), "carol", ResolveMode::Broadcast);
        assert_eq!(handled.outcome, Resolution::NotFound);
        // alice is not registered, so only the answer about carol goes out
        assert_eq!(handled.replies.len(), 1);
    }

    #[test]
    fn test_relay_to_connected_user() {
        let service = DirectoryService::new();
        service.register(&user("bob"), &session("s2"));

        let handled = service.relay(&user("alice"), "bob", "hello");
        assert_eq!(
            handled.outcome,
            RelayStatus::Delivered { target: "bob".into() }
        );
        assert_eq!(
            handled.replies[0],
            Envelope::Inbox {
                address: "chat/bob/inbox".into(),
                message: InboxMessage::ViaServer {
                    sender: "alice".into(),
                    text: "hello".into(),
                },
            }
        );
        assert!(matches!(handled.replies[1], Envelope::RelayStatus { .. }));
    }

    #[test]
    fn test_relay_to_missing_user_only_reports_back() {
        let service = DirectoryService::new();
        let handled = service.relay(&user("alice"), "carol", "hi");
        assert_eq!(handled.replies.len(), 1);
        assert_eq!(
            handled.replies[0],
            Envelope::RelayStatus {
                sender: user("alice"),
                status: RelayStatus::NotFound { target: "carol".into() },
            }
        );
    }

    #[test]
    fn test_disconnect_frees_username() {
        let service = DirectoryService::new();
        service.register(&user("alice"), &session("s1"));
        assert!(service.disconnect(&user("alice")));
        assert!(!service.disconnect(&user("alice")));
        assert_eq!(
            service.register(&user("alice"), &session("s3")).outcome,
            RegisterOutcome::Accepted
        );
    }

    #[test]
    fn test_handle_drops_non_requests() {
        let service = DirectoryService::new();
        let replies = service.handle(Envelope::Inbox {
            address: "chat/bob/inbox".into(),
            message: InboxMessage::Plain("hi".into()),
        });
        assert!(replies.is_empty());
        assert_eq!(service.stats().malformed_dropped, 1);
    }

    #[test]
    fn test_handle_dispatches_register() {
        let service = DirectoryService::new();
        let replies = service.handle(Envelope::Register {
            username: user("dave"),
            session_id: session("s9"),
        });
        assert_eq!(replies.len(), 1);
        assert_eq!(service.connected_users(), vec!["dave".to_string()]);
    }
}
