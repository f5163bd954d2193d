//! Matrix identifiers
//!
//! Call signaling needs to tell apart users, rooms and the individual devices
//! (parties) a user takes part in a call from. These newtypes keep the string
//! forms from being mixed up.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Identifier parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// Missing or wrong sigil
    #[error("Identifier {0:?} must start with '{1}'")]
    InvalidSigil(String, char),

    /// Missing server name
    #[error("Identifier {0:?} has no server name")]
    MissingServerName(String),
}

fn validate(s: &str, sigil: char) -> Result<(), IdentifierError> {
    if !s.starts_with(sigil) {
        return Err(IdentifierError::InvalidSigil(s.to_string(), sigil));
    }
    match s.split_once(':') {
        Some((local, server)) if local.len() > 1 && !server.is_empty() => Ok(()),
        _ => Err(IdentifierError::MissingServerName(s.to_string())),
    }
}

/// Matrix user id, e.g. `@alice:example.org`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Parse and validate a user id
    ///
    /// # Errors
    ///
    /// Returns error if the sigil or server name is missing
    pub fn parse(s: impl Into<String>) -> Result<Self, IdentifierError> {
        let s = s.into();
        validate(&s, '@')?;
        Ok(Self(s))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for UserId {
    type Error = IdentifierError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

/// Matrix room id, e.g. `!abcdef:example.org`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Parse and validate a room id
    ///
    /// # Errors
    ///
    /// Returns error if the sigil or server name is missing
    pub fn parse(s: impl Into<String>) -> Result<Self, IdentifierError> {
        let s = s.into();
        validate(&s, '!')?;
        Ok(Self(s))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for RoomId {
    type Error = IdentifierError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

/// Event id assigned by the homeserver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Create a new event id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque id of one device of one user taking part in a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(pub String);

impl PartyId {
    /// Generate a fresh random party id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing party id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a signaling message came from, relative to the local device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderOrigin {
    /// Echo of something this device sent
    ThisDevice,
    /// Another device logged in as the local user
    OtherOwnDevice,
    /// Another user
    Remote,
}

/// The local user and the party id this device uses for the current call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDevice {
    /// Local user id
    pub user_id: UserId,
    /// Party id for the current call, if one has been generated
    pub party_id: Option<PartyId>,
}

impl LocalDevice {
    /// Create a local device without a party id
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            party_id: None,
        }
    }

    /// Classify the sender of a message
    pub fn origin_of(&self, sender: &UserId, party_id: Option<&PartyId>) -> SenderOrigin {
        if sender != &self.user_id {
            return SenderOrigin::Remote;
        }
        match (&self.party_id, party_id) {
            (Some(ours), Some(theirs)) if ours != theirs => SenderOrigin::OtherOwnDevice,
            _ => SenderOrigin::ThisDevice,
        }
    }
}
