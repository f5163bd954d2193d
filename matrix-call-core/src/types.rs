//! Call signaling types and data structures

use crate::identity::{EventId, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a call attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Create a new call ID from the current time plus a random suffix
    pub fn generate() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            &suffix[..8]
        ))
    }

    /// Wrap an existing call ID
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ICE candidate exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// ICE candidate line; empty marks end-of-candidates
    pub candidate: String,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
    /// SDP media ID
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
}

impl Candidate {
    /// Create a new candidate
    pub fn new(candidate: impl Into<String>, sdp_mline_index: u32, sdp_mid: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
            sdp_mid: sdp_mid.into(),
        }
    }

    /// Whether this is the end-of-candidates marker
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Call-wide state visible to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalState {
    /// No call
    Idle,
    /// Ringing, waiting for the local user to accept
    Incoming,
    /// Invite sent, waiting for the remote answer
    Outgoing,
    /// Call established
    Active,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Negotiation progress of a single call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    /// No pipeline
    Disconnected,
    /// ICE connectivity failed
    IceFailed,
    /// Pipeline is being built
    Initiating,
    /// Pipeline is running
    Initiated,
    /// Local offer has been produced
    OfferSent,
    /// Local answer has been produced
    AnswerSent,
    /// ICE is checking
    Connecting,
    /// ICE connected
    Connected,
}

impl SessionState {
    /// Check if a transition follows the negotiation state machine
    ///
    /// # Valid Transitions
    ///
    /// - **Setup**: Disconnected → Initiating → Initiated
    /// - **Offer side**: Initiated → OfferSent → Connecting
    /// - **Answer side**: Initiated → AnswerSent → Connecting
    /// - **Established**: Connecting → Connected
    /// - **Failure**: any → IceFailed
    /// - **Teardown**: any → Disconnected
    #[must_use]
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Disconnected, Initiating)
                | (Initiating, Initiated)
                | (Initiated, OfferSent)
                | (Initiated, AnswerSent)
                | (OfferSent, Connecting)
                | (AnswerSent, Connecting)
                | (Connecting, Connected)
                | (_, IceFailed)
                | (_, Disconnected)
        ) && self != to
    }

    /// Whether a local description has gone out
    #[must_use]
    pub fn is_negotiated(self) -> bool {
        matches!(
            self,
            Self::OfferSent | Self::AnswerSent | Self::Connecting | Self::Connected
        )
    }
}

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

impl SdpType {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Kind of media carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

/// Why a hangup was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    /// The user ended the call
    UserHangup,
    /// ICE connectivity failed
    IceFailed,
    /// Nobody answered in time
    InviteTimeout,
    /// Local media could not be set up
    UserMediaFailed,
    /// Anything else
    UnknownError,
}

/// Why a call ended locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote party hung up
    RemoteHangup,
    /// Incoming call was never answered
    InviteExpired,
    /// Call was answered on another of our devices
    AnsweredElsewhere,
    /// ICE failed
    IceFailed,
    /// Media pipeline failed
    MediaFailed(String),
    /// Remote offer had no usable codec
    NoCompatibleCodec,
    /// Incoming call was silenced without answering
    Ignored,
}

/// Call event emitted to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Incoming call received
    IncomingCall {
        /// Caller
        remote_user: UserId,
        /// Room the call happens in
        room_id: RoomId,
        /// How long the invite stays valid
        lifetime: Duration,
        /// Call identifier
        call_id: CallId,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why the call ended
        reason: EndReason,
    },
    /// Call was answered on another device of the local user
    AnsweredElsewhere {
        /// Call identifier
        call_id: CallId,
    },
    /// Session negotiation state changed
    StateChanged(SessionState),
    /// Global call state changed
    GlobalStateChanged(GlobalState),
    /// Microphone mute changed
    MutedChanged(bool),
    /// Participant list or camera flags changed
    ParticipantsChanged,
    /// User-visible error
    Error(String),
}

/// A decoded room timeline event as delivered by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Event id
    pub event_id: EventId,
    /// Event type, e.g. `m.call.invite`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sender
    pub sender: UserId,
    /// Server timestamp
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub origin_server_ts: DateTime<Utc>,
    /// Event content
    pub content: serde_json::Value,
}

/// Room membership as seen by the call manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContext {
    /// Room id
    pub room_id: RoomId,
    /// Local user
    pub local_user: UserId,
    /// Joined members, local user included
    pub members: Vec<UserId>,
}

impl RoomContext {
    /// Create a new room context
    pub fn new(room_id: RoomId, local_user: UserId, members: Vec<UserId>) -> Self {
        Self {
            room_id,
            local_user,
            members,
        }
    }

    /// Whether this is a 1:1 room
    pub fn is_one_to_one(&self) -> bool {
        self.members.len() == 2
    }

    /// The member who is not the local user
    pub fn other_user(&self) -> Option<&UserId> {
        self.members.iter().find(|m| **m != self.local_user)
    }
}
