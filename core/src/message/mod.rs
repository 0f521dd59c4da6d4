// Message module: envelope types and the text codec shared by every channel

pub mod codec;
pub mod types;

pub use codec::{
    decode_envelope, encode_envelope, escape_field, unescape_field, CodecError,
    DISCONNECT_NOTICE, MAX_PAYLOAD_SIZE, NOT_FOUND,
};
pub use types::{
    Envelope, InboxMessage, RegisterOutcome, RejectReason, RelayStatus, Resolution, ResolveMode,
};
