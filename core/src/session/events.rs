//! What a session reports to whoever is driving it

use crate::message::{InboxMessage, RelayStatus, Resolution, ResolveMode};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Something arrived in our inbox
    Message(InboxMessage),
    /// The directory reported on one of our relayed messages
    RelayStatus(RelayStatus),
    /// A resolution reply was applied to the address cache
    AddressResolved {
        name: String,
        mode: ResolveMode,
        resolution: Resolution,
    },
    FileReceived {
        sender: String,
        filename: String,
        saved_to: PathBuf,
        bytes: usize,
    },
    /// An incoming file could not be decoded or written
    FileFailed {
        sender: Option<String>,
        reason: String,
    },
    /// The broker link ended without us asking
    TransportLost,
}
