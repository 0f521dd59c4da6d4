// Envelope types: the tagged union every channel payload decodes into

use crate::identity::{SessionId, Username};
use std::fmt;

/// Which address-reply channel a resolution is answered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveMode {
    /// Reply on `address_reply`; the requester also learns its own address
    Broadcast,
    /// Reply on `address_reply_only`; only the requested name is answered
    Targeted,
}

/// Answer to an address query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(String),
    NotFound,
}

/// Why a registration was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Someone is already registered under that username
    AlreadyConnected,
    /// The directory reached its configured client limit
    DirectoryFull,
    /// A rejection text this client does not recognise
    Other(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AlreadyConnected => f.write_str("username already connected"),
            RejectReason::DirectoryFull => f.write_str("directory is full"),
            RejectReason::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// Status reported back to the sender of a server relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    Delivered { target: String },
    NotFound { target: String },
}

/// Something that lands in a user's inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxMessage {
    /// Relayed by the directory on the sender's behalf
    ViaServer { sender: String, text: String },
    /// Published straight to the inbox by a peer that resolved it
    Direct { sender: String, text: String },
    /// Untagged text
    Plain(String),
}

impl InboxMessage {
    pub fn sender(&self) -> Option<&str> {
        match self {
            InboxMessage::ViaServer { sender, .. } | InboxMessage::Direct { sender, .. } => {
                Some(sender)
            }
            InboxMessage::Plain(_) => None,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            InboxMessage::ViaServer { text, .. } | InboxMessage::Direct { text, .. } => text,
            InboxMessage::Plain(text) => text,
        }
    }
}

/// A message envelope.
///
/// Exists only for one publish/deliver cycle. Fields named after a user that
/// come from the topic (`username`, `requester`, `sender` on requests) are
/// validated usernames; names carried inside a payload are plain strings,
/// since a client may ask about a name that was never valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Client asks to be registered under `username`
    Register {
        username: Username,
        session_id: SessionId,
    },
    /// Directory answers a registration on the session-scoped channel
    RegisterResult {
        username: Username,
        session_id: SessionId,
        outcome: RegisterOutcome,
    },
    /// Client asks for the inbox address of `target`
    ResolveRequest {
        requester: Username,
        target: String,
        mode: ResolveMode,
    },
    /// Directory answers an address query about `name`
    ResolveReply {
        requester: Username,
        mode: ResolveMode,
        name: String,
        resolution: Resolution,
    },
    /// Client asks the directory to deliver `text` to `target`
    Relay {
        sender: Username,
        target: String,
        text: String,
    },
    /// Directory reports the outcome of a relay to its sender
    RelayStatus {
        sender: Username,
        status: RelayStatus,
    },
    /// A message published to an inbox address
    Inbox {
        address: String,
        message: InboxMessage,
    },
    /// A file for `recipient`; `encoded` is the base64 body
    File {
        recipient: Username,
        sender: String,
        filename: String,
        encoded: String,
    },
    /// Client is going away
    Disconnect { username: Username },
}

impl Envelope {
    /// Human-readable message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "Register",
            Envelope::RegisterResult { .. } => "RegisterResult",
            Envelope::ResolveRequest { .. } => "ResolveRequest",
            Envelope::ResolveReply { .. } => "ResolveReply",
            Envelope::Relay { .. } => "Relay",
            Envelope::RelayStatus { .. } => "RelayStatus",
            Envelope::Inbox { .. } => "Inbox",
            Envelope::File { .. } => "File",
            Envelope::Disconnect { .. } => "Disconnect",
        }
    }
}
