//! Usernames, session ids, and the identity a client holds while registered

use crate::topic::Topic;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest username the directory accepts, in bytes
pub const MAX_USERNAME_LEN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsernameError {
    #[error("Username is empty")]
    Empty,
    #[error("Username is longer than {max} bytes", max = MAX_USERNAME_LEN)]
    TooLong,
    #[error("Username contains invalid character {0:?}")]
    InvalidChar(char),
}

/// A validated username.
///
/// Usernames become a topic level (`chat/<user>/...`), so they are limited to
/// ASCII alphanumerics and `_ - .`. That keeps `/ + #` out of topic names and
/// keeps payload delimiters (`:` and `,`) out of sender fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
    pub fn parse(raw: &str) -> Result<Self, UsernameError> {
        if raw.is_empty() {
            return Err(UsernameError::Empty);
        }
        if raw.len() > MAX_USERNAME_LEN {
            return Err(UsernameError::TooLong);
        }
        if let Some(c) = raw.chars().find(|c| !is_username_char(*c)) {
            return Err(UsernameError::InvalidChar(c));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn is_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Username {
    type Err = UsernameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Opaque per-process token that scopes a registration result channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh UUID v4 session id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept a session id received on the wire.
    ///
    /// It ends up as a topic level, so it must be non-empty and free of
    /// separators, wildcards and whitespace.
    pub fn from_wire(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && !raw
                .chars()
                .any(|c| c == '/' || c == '+' || c == '#' || c.is_whitespace());
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a client is for the lifetime of one accepted registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub username: Username,
    pub session_id: SessionId,
    /// Channel other clients publish to when messaging this user
    pub inbox_address: String,
}

impl ClientIdentity {
    pub fn new(username: Username, session_id: SessionId) -> Self {
        let inbox_address = Topic::Inbox(username.clone()).to_string();
        Self {
            username,
            session_id,
            inbox_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_usernames() {
        for name in ["alice", "bob2", "carol_the-great", "d.e", "X"] {
            assert!(Username::parse(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_rejects_topic_and_payload_delimiters() {
        assert_eq!(Username::parse(""), Err(UsernameError::Empty));
        assert_eq!(
            Username::parse("a/b"),
            Err(UsernameError::InvalidChar('/'))
        );
        assert_eq!(Username::parse("a+"), Err(UsernameError::InvalidChar('+')));
        assert_eq!(Username::parse("#"), Err(UsernameError::InvalidChar('#')));
        assert_eq!(
            Username::parse("bob:hi"),
            Err(UsernameError::InvalidChar(':'))
        );
        assert_eq!(
            Username::parse("a b"),
            Err(UsernameError::InvalidChar(' '))
        );
    }

    #[test]
    fn test_username_length_limit() {
        let longest = "a".repeat(MAX_USERNAME_LEN);
        assert!(Username::parse(&longest).is_ok());
        assert_eq!(
            Username::parse(&format!("{longest}a")),
            Err(UsernameError::TooLong)
        );
    }

    #[test]
    fn test_session_ids_are_unique_and_topic_safe() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(SessionId::from_wire(a.as_str()).is_some());
        assert!(SessionId::from_wire("").is_none());
        assert!(SessionId::from_wire("x/y").is_none());
        assert!(SessionId::from_wire("x y").is_none());
    }

    #[test]
    fn test_identity_inbox_address() {
        let identity = ClientIdentity::new(Username::parse("alice").unwrap(), SessionId::generate());
        assert_eq!(identity.inbox_address, "chat/alice/inbox");
    }
}
