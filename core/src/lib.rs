// Parley Core: presence directory and message routing
//
// Clients register a username with the directory, resolve each other's inbox
// addresses, and exchange messages and files over a publish/subscribe bus.
// The directory is the only authority on who is connected.

pub mod directory;
pub mod identity;
pub mod message;
pub mod session;
pub mod topic;
pub mod transport;

pub use directory::{DirectoryConfig, DirectoryServer, DirectoryService, DirectoryStats};
pub use identity::{ClientIdentity, SessionId, Username, UsernameError};
pub use message::{
    decode_envelope, encode_envelope, CodecError, Envelope, InboxMessage, RegisterOutcome,
    RejectReason, RelayStatus, Resolution, ResolveMode,
};
pub use session::{
    CandidateList, ClientSession, FileError, RegisterFailure, SessionConfig, SessionError,
    SessionEvent, UsernameProvider,
};
pub use topic::{Topic, TopicError};
pub use transport::{
    Delivery, DeliveryReceiver, MemoryBus, TcpBroker, TcpLink, Transport, TransportError,
};
