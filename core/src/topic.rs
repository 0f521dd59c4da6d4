//! Topic grammar: every channel is `chat/<user>/<action>[/<session>]`

use crate::identity::{SessionId, Username, UsernameError};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// First level of every topic
pub const ROOT: &str = "chat";

pub const REGISTER: &str = "register";
pub const REGISTER_RESULT: &str = "register_result";
pub const INBOX: &str = "inbox";
pub const GET_ADDRESS: &str = "get_address";
pub const ADDRESS_REPLY: &str = "address_reply";
pub const GET_ADDRESS_ONLY: &str = "get_address_only";
pub const ADDRESS_REPLY_ONLY: &str = "address_reply_only";
pub const SEND_MESSAGE: &str = "send_message";
pub const GET_MESSAGE: &str = "get_message";
pub const FILE: &str = "file";
pub const DISCONNECT: &str = "disconnect";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic does not start with {root:?}: {0}", root = ROOT)]
    WrongRoot(String),
    #[error("Topic has the wrong number of levels: {0}")]
    WrongShape(String),
    #[error("Unknown topic action: {0}")]
    UnknownAction(String),
    #[error("Invalid username in topic: {0}")]
    InvalidUser(#[from] UsernameError),
    #[error("Invalid session id in topic: {0}")]
    InvalidSession(String),
}

/// A concrete (wildcard-free) channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Register(Username),
    RegisterResult(Username, SessionId),
    Inbox(Username),
    GetAddress(Username),
    AddressReply(Username),
    GetAddressOnly(Username),
    AddressReplyOnly(Username),
    SendMessage(Username),
    GetMessage(Username),
    File(Username),
    Disconnect(Username),
}

impl Topic {
    /// The user this channel belongs to (second topic level)
    pub fn user(&self) -> &Username {
        match self {
            Topic::Register(u)
            | Topic::RegisterResult(u, _)
            | Topic::Inbox(u)
            | Topic::GetAddress(u)
            | Topic::AddressReply(u)
            | Topic::GetAddressOnly(u)
            | Topic::AddressReplyOnly(u)
            | Topic::SendMessage(u)
            | Topic::GetMessage(u)
            | Topic::File(u)
            | Topic::Disconnect(u) => u,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Topic::Register(_) => REGISTER,
            Topic::RegisterResult(..) => REGISTER_RESULT,
            Topic::Inbox(_) => INBOX,
            Topic::GetAddress(_) => GET_ADDRESS,
            Topic::AddressReply(_) => ADDRESS_REPLY,
            Topic::GetAddressOnly(_) => GET_ADDRESS_ONLY,
            Topic::AddressReplyOnly(_) => ADDRESS_REPLY_ONLY,
            Topic::SendMessage(_) => SEND_MESSAGE,
            Topic::GetMessage(_) => GET_MESSAGE,
            Topic::File(_) => FILE,
            Topic::Disconnect(_) => DISCONNECT,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        let levels: Vec<&str> = raw.split('/').collect();
        if levels.first() != Some(&ROOT) {
            return Err(TopicError::WrongRoot(raw.to_string()));
        }
        if levels.len() < 3 {
            return Err(TopicError::WrongShape(raw.to_string()));
        }

        let user = Username::parse(levels[1])?;
        let action = levels[2];

        if action == REGISTER_RESULT {
            if levels.len() != 4 {
                return Err(TopicError::WrongShape(raw.to_string()));
            }
            let session = SessionId::from_wire(levels[3])
                .ok_or_else(|| TopicError::InvalidSession(levels[3].to_string()))?;
            return Ok(Topic::RegisterResult(user, session));
        }

        if levels.len() != 3 {
            return Err(TopicError::WrongShape(raw.to_string()));
        }

        let topic = match action {
            REGISTER => Topic::Register(user),
            INBOX => Topic::Inbox(user),
            GET_ADDRESS => Topic::GetAddress(user),
            ADDRESS_REPLY => Topic::AddressReply(user),
            GET_ADDRESS_ONLY => Topic::GetAddressOnly(user),
            ADDRESS_REPLY_ONLY => Topic::AddressReplyOnly(user),
            SEND_MESSAGE => Topic::SendMessage(user),
            GET_MESSAGE => Topic::GetMessage(user),
            FILE => Topic::File(user),
            DISCONNECT => Topic::Disconnect(user),
            other => return Err(TopicError::UnknownAction(other.to_string())),
        };
        Ok(topic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::RegisterResult(user, session) => {
                write!(f, "{ROOT}/{user}/{REGISTER_RESULT}/{session}")
            }
            other => write!(f, "{ROOT}/{}/{}", other.user(), other.action()),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Subscription filter matching `action` for every user: `chat/+/<action>`
pub fn any_user(action: &str) -> String {
    format!("{ROOT}/+/{action}")
}
