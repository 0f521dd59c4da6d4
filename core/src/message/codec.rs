// Envelope codec: channel payloads to envelopes and back
//
// Framing rule: a field that is followed by a delimiter (`:` or `,`) is
// percent-escaped (`%` -> %25, `:` -> %3A, `,` -> %2C). The last field of a
// payload is carried raw, and decoders split on the first delimiter, so message
// bodies may contain delimiters freely.

use super::types::{
    Envelope, InboxMessage, RegisterOutcome, RejectReason, RelayStatus, Resolution, ResolveMode,
};
use crate::identity::{SessionId, Username};
use crate::topic::{Topic, TopicError};
use thiserror::Error;

/// Maximum payload size accepted on any channel: 8 MB
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// Sentinel used by address and relay replies when the user is not connected
pub const NOT_FOUND: &str = "NOT_FOUND";

/// Body of a disconnect notice
pub const DISCONNECT_NOTICE: &str = "DISCONNECT";

const SUCCESS_PREFIX: &str = "SUCCESS:";
const ERROR_PREFIX: &str = "ERROR:";
const DIRECTORY_FULL: &str = "Directory is full.";
const VIA_SERVER_PREFIX: &str = "[Via server] ";
const DM_PREFIX: &str = "[DM from ";
const DM_SUFFIX: &str = "] ";
const ADDRESS_IS: &str = " address is: ";
const RELAY_OK_PREFIX: &str = "Message was sent to ";
const RELAY_OK_SUFFIX: &str = " via the server successfully.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),
    #[error("Payload is not valid UTF-8")]
    NotUtf8,
    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("Invalid escape sequence in field {0:?}")]
    InvalidEscape(String),
    #[error("Payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

fn malformed(kind: &'static str, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        kind,
        reason: reason.into(),
    }
}

/// Escape a field that precedes a delimiter
pub fn escape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            ',' => out.push_str("%2C"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape_field`]
pub fn unescape_field(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.to_ascii_uppercase().as_str() {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            "2C" => out.push(','),
            _ => return Err(CodecError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

fn request_topic(mode: ResolveMode, user: &Username) -> Topic {
    match mode {
        ResolveMode::Broadcast => Topic::GetAddress(user.clone()),
        ResolveMode::Targeted => Topic::GetAddressOnly(user.clone()),
    }
}

fn reply_topic(mode: ResolveMode, user: &Username) -> Topic {
    match mode {
        ResolveMode::Broadcast => Topic::AddressReply(user.clone()),
        ResolveMode::Targeted => Topic::AddressReplyOnly(user.clone()),
    }
}

/// Encode an envelope into the topic it is published on and its payload
pub fn encode_envelope(envelope: &Envelope) -> Result<(String, Vec<u8>), CodecError> {
    let (topic, payload) = match envelope {
        Envelope::Register {
            username,
            session_id,
        } => (
            Topic::Register(username.clone()).to_string(),
            session_id.to_string(),
        ),
        Envelope::RegisterResult {
            username,
            session_id,
            outcome,
        } => {
            let text = match outcome {
                RegisterOutcome::Accepted => {
                    format!("{SUCCESS_PREFIX} Registered as {username} with ID {session_id}")
                }
                RegisterOutcome::Rejected(RejectReason::AlreadyConnected) => {
                    format!("{ERROR_PREFIX} Username {username} already connected.")
                }
                RegisterOutcome::Rejected(RejectReason::DirectoryFull) => {
                    format!("{ERROR_PREFIX} {DIRECTORY_FULL}")
                }
                RegisterOutcome::Rejected(RejectReason::Other(reason)) => {
                    format!("{ERROR_PREFIX} {reason}")
                }
            };
            (
                Topic::RegisterResult(username.clone(), session_id.clone()).to_string(),
                text,
            )
        }
        Envelope::ResolveRequest {
            requester,
            target,
            mode,
        } => (request_topic(*mode, requester).to_string(), target.clone()),
        Envelope::ResolveReply {
            requester,
            mode,
            name,
            resolution,
        } => {
            let name = escape_field(name);
            let text = match (mode, resolution) {
                (_, Resolution::NotFound) => format!("{name}:{NOT_FOUND}"),
                (ResolveMode::Broadcast, Resolution::Found(address)) => {
                    format!("{name}:{address}")
                }
                (ResolveMode::Targeted, Resolution::Found(address)) => {
                    format!("{name}{ADDRESS_IS}{address}")
                }
            };
            (reply_topic(*mode, requester).to_string(), text)
        }
        Envelope::Relay {
            sender,
            target,
            text,
        } => (
            Topic::SendMessage(sender.clone()).to_string(),
            format!("{}:{}", escape_field(target), text),
        ),
        Envelope::RelayStatus { sender, status } => {
            let text = match status {
                RelayStatus::Delivered { target } => {
                    format!("{RELAY_OK_PREFIX}{}{RELAY_OK_SUFFIX}", escape_field(target))
                }
                RelayStatus::NotFound { target } => {
                    format!("{}:{NOT_FOUND}", escape_field(target))
                }
            };
            (Topic::GetMessage(sender.clone()).to_string(), text)
        }
        Envelope::Inbox { address, message } => {
            let text = match message {
                InboxMessage::ViaServer { sender, text } => {
                    format!("{VIA_SERVER_PREFIX}{}:{text}", escape_field(sender))
                }
                InboxMessage::Direct { sender, text } => {
                    format!("{DM_PREFIX}{}{DM_SUFFIX}{text}", escape_field(sender))
                }
                InboxMessage::Plain(text) => text.clone(),
            };
            (address.clone(), text)
        }
        Envelope::File {
            recipient,
            sender,
            filename,
            encoded,
        } => (
            Topic::File(recipient.clone()).to_string(),
            format!(
                "{},{}:{}",
                escape_field(sender),
                escape_field(filename),
                encoded
            ),
        ),
        Envelope::Disconnect { username } => (
            Topic::Disconnect(username.clone()).to_string(),
            DISCONNECT_NOTICE.to_string(),
        ),
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok((topic, payload.into_bytes()))
}

/// Decode a delivery on `topic` into an envelope
pub fn decode_envelope(topic: &str, payload: &[u8]) -> Result<Envelope, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let parsed = Topic::parse(topic)?;
    let text = std::str::from_utf8(payload).map_err(|_| CodecError::NotUtf8)?;

    match parsed {
        Topic::Register(username) => {
            let session_id = SessionId::from_wire(text.trim())
                .ok_or_else(|| malformed("Register", "invalid session id"))?;
            Ok(Envelope::Register {
                username,
                session_id,
            })
        }
        Topic::RegisterResult(username, session_id) => {
            let outcome = decode_register_outcome(&username, text)?;
            Ok(Envelope::RegisterResult {
                username,
                session_id,
                outcome,
            })
        }
        Topic::GetAddress(requester) => decode_resolve_request(requester, text, ResolveMode::Broadcast),
        Topic::GetAddressOnly(requester) => {
            decode_resolve_request(requester, text, ResolveMode::Targeted)
        }
        Topic::AddressReply(requester) => {
            let (name, resolution) = decode_broadcast_reply(text)?;
            Ok(Envelope::ResolveReply {
                requester,
                mode: ResolveMode::Broadcast,
                name,
                resolution,
            })
        }
        Topic::AddressReplyOnly(requester) => {
            let (name, resolution) = decode_targeted_reply(text)?;
            Ok(Envelope::ResolveReply {
                requester,
                mode: ResolveMode::Targeted,
                name,
                resolution,
            })
        }
        Topic::SendMessage(sender) => {
            let (target, body) = text
                .split_once(':')
                .ok_or_else(|| malformed("Relay", "expected <target>:<message>"))?;
            let target = unescape_field(target)?;
            if target.is_empty() {
                return Err(malformed("Relay", "empty target"));
            }
            Ok(Envelope::Relay {
                sender,
                target,
                text: body.to_string(),
            })
        }
        Topic::GetMessage(sender) => {
            let status = decode_relay_status(text)?;
            Ok(Envelope::RelayStatus { sender, status })
        }
        Topic::Inbox(_) => Ok(Envelope::Inbox {
            address: topic.to_string(),
            message: decode_inbox(text),
        }),
        Topic::File(recipient) => {
            let (header, encoded) = text
                .split_once(':')
                .ok_or_else(|| malformed("File", "expected <sender>,<filename>:<data>"))?;
            let (sender, filename) = header
                .split_once(',')
                .ok_or_else(|| malformed("File", "expected <sender>,<filename> header"))?;
            let sender = unescape_field(sender)?;
            let filename = unescape_field(filename)?;
            if sender.is_empty() || filename.is_empty() {
                return Err(malformed("File", "empty sender or filename"));
            }
            Ok(Envelope::File {
                recipient,
                sender,
                filename,
                encoded: encoded.to_string(),
            })
        }
        Topic::Disconnect(username) => {
            if text.trim() != DISCONNECT_NOTICE {
                return Err(malformed("Disconnect", format!("unexpected body {text:?}")));
            }
            Ok(Envelope::Disconnect { username })
        }
    }
}

fn decode_register_outcome(username: &Username, text: &str) -> Result<RegisterOutcome, CodecError> {
    if text.starts_with(SUCCESS_PREFIX) {
        return Ok(RegisterOutcome::Accepted);
    }
    let reason = text
        .strip_prefix(ERROR_PREFIX)
        .ok_or_else(|| malformed("RegisterResult", "expected SUCCESS: or ERROR: prefix"))?
        .trim();

    let reason = if reason == format!("Username {username} already connected.") {
        RejectReason::AlreadyConnected
    } else if reason == DIRECTORY_FULL {
        RejectReason::DirectoryFull
    } else {
        RejectReason::Other(reason.to_string())
    };
    Ok(RegisterOutcome::Rejected(reason))
}

fn decode_resolve_request(
    requester: Username,
    text: &str,
    mode: ResolveMode,
) -> Result<Envelope, CodecError> {
    if text.is_empty() {
        return Err(malformed("ResolveRequest", "empty target"));
    }
    Ok(Envelope::ResolveRequest {
        requester,
        target: text.to_string(),
        mode,
    })
}

fn decode_broadcast_reply(text: &str) -> Result<(String, Resolution), CodecError> {
    let (name, rest) = text
        .split_once(':')
        .ok_or_else(|| malformed("ResolveReply", "expected <name>:<address>"))?;
    let name = unescape_field(name)?;
    let resolution = match rest {
        NOT_FOUND => Resolution::NotFound,
        "" => return Err(malformed("ResolveReply", "empty address")),
        address => Resolution::Found(address.to_string()),
    };
    Ok((name, resolution))
}

fn decode_targeted_reply(text: &str) -> Result<(String, Resolution), CodecError> {
    if let Some(name) = text.strip_suffix(&format!(":{NOT_FOUND}")) {
        if !name.contains(':') {
            return Ok((unescape_field(name)?, Resolution::NotFound));
        }
    }
    match text.split_once(ADDRESS_IS) {
        Some((name, address)) if !address.is_empty() => {
            Ok((unescape_field(name)?, Resolution::Found(address.to_string())))
        }
        _ => Err(malformed(
            "ResolveReply",
            "expected <name> address is: <address>",
        )),
    }
}

fn decode_relay_status(text: &str) -> Result<RelayStatus, CodecError> {
    if let Some(target) = text
        .strip_prefix(RELAY_OK_PREFIX)
        .and_then(|rest| rest.strip_suffix(RELAY_OK_SUFFIX))
    {
        return Ok(RelayStatus::Delivered {
            target: unescape_field(target)?,
        });
    }
    if let Some(target) = text.strip_suffix(&format!(":{NOT_FOUND}")) {
        return Ok(RelayStatus::NotFound {
            target: unescape_field(target)?,
        });
    }
    Err(malformed("RelayStatus", format!("unrecognised status {text:?}")))
}

/// Inbox text is free-form; anything without a recognised tag is plain
fn decode_inbox(text: &str) -> InboxMessage {
    let tagged = |sender: &str, body: &str, direct: bool| {
        unescape_field(sender).ok().map(|sender| {
            let text = body.to_string();
            if direct {
                InboxMessage::Direct { sender, text }
            } else {
                InboxMessage::ViaServer { sender, text }
            }
        })
    };

    let decoded = if let Some(rest) = text.strip_prefix(VIA_SERVER_PREFIX) {
        rest.split_once(':')
            .and_then(|(sender, body)| tagged(sender, body, false))
    } else if let Some(rest) = text.strip_prefix(DM_PREFIX) {
        rest.split_once(DM_SUFFIX)
            .and_then(|(sender, body)| tagged(sender, body, true))
    } else {
        None
    };

    decoded.unwrap_or_else(|| InboxMessage::Plain(text.to_string()))
}
