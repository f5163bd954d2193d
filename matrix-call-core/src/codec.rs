//! Call signaling codec
//!
//! Translates between `m.call.*` room event content and the decoded signaling
//! messages the call manager works with. Encoding also rewrites the media
//! engine's stream ids in outgoing SDP to fresh opaque ids, so nothing
//! engine-internal ends up in the room.

use crate::identity::{PartyId, UserId};
use crate::types::{CallId, Candidate, HangupReason, RoomEvent, SdpType};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Content key for the stream purpose sidecar (MSC3077)
pub const STREAM_METADATA_KEY: &str = "org.matrix.msc3077.sdp_stream_metadata";

/// Signaling codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// Content could not be decoded
    #[error("Malformed {kind} signal: {reason}")]
    MalformedSignal {
        /// Event type being decoded
        kind: &'static str,
        /// Decoder message
        reason: String,
    },

    /// Not a call event
    #[error("Unknown call event type: {0}")]
    UnknownEventType(String),
}

/// The five `m.call.*` event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// `m.call.invite`
    Invite,
    /// `m.call.candidates`
    Candidates,
    /// `m.call.answer`
    Answer,
    /// `m.call.negotiate`
    Negotiate,
    /// `m.call.hangup`
    Hangup,
}

impl SignalKind {
    /// Room event type for this kind
    #[must_use]
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Invite => "m.call.invite",
            Self::Candidates => "m.call.candidates",
            Self::Answer => "m.call.answer",
            Self::Negotiate => "m.call.negotiate",
            Self::Hangup => "m.call.hangup",
        }
    }

    /// Look up a kind by room event type
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "m.call.invite" => Some(Self::Invite),
            "m.call.candidates" => Some(Self::Candidates),
            "m.call.answer" => Some(Self::Answer),
            "m.call.negotiate" => Some(Self::Negotiate),
            "m.call.hangup" => Some(Self::Hangup),
            _ => None,
        }
    }
}

/// Call protocol version; v0 clients send an integer, v1 a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallVersion {
    /// Integer version
    Int(u64),
    /// String version
    Str(String),
}

impl Default for CallVersion {
    fn default() -> Self {
        Self::Int(0)
    }
}

/// Purpose attached to one opaque stream id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Stream purpose, e.g. `m.usermedia`
    pub purpose: String,
}

/// Opaque stream id to purpose table
pub type SdpStreamMetadata = BTreeMap<String, StreamMetadata>;

/// Session description as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP body
    pub sdp: String,
    /// `offer` or `answer`
    #[serde(rename = "type")]
    pub kind: SdpType,
}

/// `m.call.invite` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteContent {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    /// Milliseconds the invite stays valid
    pub lifetime: u64,
    /// The offer
    pub offer: SessionDescription,
    /// Capability flags
    #[serde(default)]
    pub capabilities: serde_json::Map<String, serde_json::Value>,
    /// Protocol version
    #[serde(default)]
    pub version: CallVersion,
    /// Stream purposes
    #[serde(rename = "org.matrix.msc3077.sdp_stream_metadata", default)]
    pub sdp_stream_metadata: SdpStreamMetadata,
}

/// `m.call.candidates` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatesContent {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    /// Candidates, possibly empty
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Protocol version
    #[serde(default)]
    pub version: CallVersion,
}

/// `m.call.answer` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerContent {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    /// The answer
    pub answer: SessionDescription,
    /// Capability flags
    #[serde(default)]
    pub capabilities: serde_json::Map<String, serde_json::Value>,
    /// Protocol version
    #[serde(default)]
    pub version: CallVersion,
    /// Stream purposes
    #[serde(rename = "org.matrix.msc3077.sdp_stream_metadata", default)]
    pub sdp_stream_metadata: SdpStreamMetadata,
}

/// `m.call.negotiate` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiateContent {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    /// Milliseconds the description stays valid
    #[serde(default)]
    pub lifetime: u64,
    /// New offer or answer
    pub description: SessionDescription,
    /// Protocol version
    #[serde(default)]
    pub version: CallVersion,
    /// Stream purposes
    #[serde(rename = "org.matrix.msc3077.sdp_stream_metadata", default)]
    pub sdp_stream_metadata: SdpStreamMetadata,
}

/// `m.call.hangup` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupContent {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    /// Protocol version
    #[serde(default)]
    pub version: CallVersion,
    /// Why the call was ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<HangupReason>,
}

/// Decoded invite
#[derive(Debug, Clone, PartialEq)]
pub struct Invite {
    /// Call identifier
    pub call_id: CallId,
    /// Caller's party
    pub party_id: Option<PartyId>,
    /// Remote offer
    pub sdp: String,
    /// Invite lifetime
    pub lifetime: Duration,
    /// Stream purposes
    pub metadata: SdpStreamMetadata,
}

/// Decoded candidates
#[derive(Debug, Clone, PartialEq)]
pub struct Candidates {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    pub party_id: Option<PartyId>,
    /// Candidates in arrival order
    pub candidates: Vec<Candidate>,
}

/// Decoded answer
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// Call identifier
    pub call_id: CallId,
    /// Answering party
    pub party_id: Option<PartyId>,
    /// Remote answer
    pub sdp: String,
    /// Stream purposes
    pub metadata: SdpStreamMetadata,
}

/// Decoded negotiate
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiate {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    pub party_id: Option<PartyId>,
    /// New description
    pub sdp: String,
    /// Whether the description is an answer to our renegotiation
    pub is_answer: bool,
    /// Stream purposes
    pub metadata: SdpStreamMetadata,
}

/// Decoded hangup
#[derive(Debug, Clone, PartialEq)]
pub struct Hangup {
    /// Call identifier
    pub call_id: CallId,
    /// Sending party
    pub party_id: Option<PartyId>,
    /// Reason, if given
    pub reason: Option<HangupReason>,
}

/// Decoded signaling message
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    /// Call offer
    Invite(Invite),
    /// ICE candidates
    Candidates(Candidates),
    /// Call answer
    Answer(Answer),
    /// Mid-call renegotiation
    Negotiate(Negotiate),
    /// End call
    Hangup(Hangup),
}

impl SignalMessage {
    /// Call this message belongs to
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Invite(m) => &m.call_id,
            Self::Candidates(m) => &m.call_id,
            Self::Answer(m) => &m.call_id,
            Self::Negotiate(m) => &m.call_id,
            Self::Hangup(m) => &m.call_id,
        }
    }

    /// Party that sent this message
    #[must_use]
    pub fn party_id(&self) -> Option<&PartyId> {
        match self {
            Self::Invite(m) => m.party_id.as_ref(),
            Self::Candidates(m) => m.party_id.as_ref(),
            Self::Answer(m) => m.party_id.as_ref(),
            Self::Negotiate(m) => m.party_id.as_ref(),
            Self::Hangup(m) => m.party_id.as_ref(),
        }
    }

    /// Wire kind of this message
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Invite(_) => SignalKind::Invite,
            Self::Candidates(_) => SignalKind::Candidates,
            Self::Answer(_) => SignalKind::Answer,
            Self::Negotiate(_) => SignalKind::Negotiate,
            Self::Hangup(_) => SignalKind::Hangup,
        }
    }
}

/// A decoded message together with the event envelope it came in
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Sender of the room event
    pub sender: UserId,
    /// Server timestamp of the room event
    pub origin_server_ts: DateTime<Utc>,
    /// Decoded content
    pub message: SignalMessage,
}

fn content<T: for<'de> Deserialize<'de>>(
    event: &RoomEvent,
    kind: SignalKind,
) -> Result<T, SignalError> {
    serde_json::from_value(event.content.clone()).map_err(|e| SignalError::MalformedSignal {
        kind: kind.event_type(),
        reason: e.to_string(),
    })
}

fn require_sdp(sdp: &str, kind: SignalKind) -> Result<(), SignalError> {
    if sdp.trim().is_empty() {
        return Err(SignalError::MalformedSignal {
            kind: kind.event_type(),
            reason: "empty sdp".to_string(),
        });
    }
    Ok(())
}

fn require_call_id(call_id: &CallId, kind: SignalKind) -> Result<(), SignalError> {
    if call_id.as_str().is_empty() {
        return Err(SignalError::MalformedSignal {
            kind: kind.event_type(),
            reason: "empty call_id".to_string(),
        });
    }
    Ok(())
}

/// Decode an `m.call.invite` event
///
/// # Errors
///
/// Returns `MalformedSignal` if `call_id` or the offer SDP is missing
pub fn decode_invite(event: &RoomEvent) -> Result<Invite, SignalError> {
    let c: InviteContent = content(event, SignalKind::Invite)?;
    require_call_id(&c.call_id, SignalKind::Invite)?;
    require_sdp(&c.offer.sdp, SignalKind::Invite)?;
    Ok(Invite {
        call_id: c.call_id,
        party_id: c.party_id,
        sdp: c.offer.sdp,
        lifetime: Duration::from_millis(c.lifetime),
        metadata: c.sdp_stream_metadata,
    })
}

/// Decode an `m.call.candidates` event
///
/// # Errors
///
/// Returns `MalformedSignal` if `call_id` is missing or a candidate is malformed
pub fn decode_candidates(event: &RoomEvent) -> Result<Candidates, SignalError> {
    let c: CandidatesContent = content(event, SignalKind::Candidates)?;
    require_call_id(&c.call_id, SignalKind::Candidates)?;
    Ok(Candidates {
        call_id: c.call_id,
        party_id: c.party_id,
        candidates: c.candidates,
    })
}

/// Decode an `m.call.answer` event
///
/// # Errors
///
/// Returns `MalformedSignal` if `call_id` or the answer SDP is missing
pub fn decode_answer(event: &RoomEvent) -> Result<Answer, SignalError> {
    let c: AnswerContent = content(event, SignalKind::Answer)?;
    require_call_id(&c.call_id, SignalKind::Answer)?;
    require_sdp(&c.answer.sdp, SignalKind::Answer)?;
    Ok(Answer {
        call_id: c.call_id,
        party_id: c.party_id,
        sdp: c.answer.sdp,
        metadata: c.sdp_stream_metadata,
    })
}

/// Decode an `m.call.negotiate` event
///
/// # Errors
///
/// Returns `MalformedSignal` if `call_id` or the description is missing
pub fn decode_negotiate(event: &RoomEvent) -> Result<Negotiate, SignalError> {
    let c: NegotiateContent = content(event, SignalKind::Negotiate)?;
    require_call_id(&c.call_id, SignalKind::Negotiate)?;
    require_sdp(&c.description.sdp, SignalKind::Negotiate)?;
    Ok(Negotiate {
        call_id: c.call_id,
        party_id: c.party_id,
        sdp: c.description.sdp,
        is_answer: c.description.kind == SdpType::Answer,
        metadata: c.sdp_stream_metadata,
    })
}

/// Decode an `m.call.hangup` event
///
/// # Errors
///
/// Returns `MalformedSignal` if `call_id` is missing
pub fn decode_hangup(event: &RoomEvent) -> Result<Hangup, SignalError> {
    let c: HangupContent = content(event, SignalKind::Hangup)?;
    require_call_id(&c.call_id, SignalKind::Hangup)?;
    Ok(Hangup {
        call_id: c.call_id,
        party_id: c.party_id,
        reason: c.reason,
    })
}

/// Decode any call event
///
/// # Errors
///
/// Returns `UnknownEventType` for non-call events and `MalformedSignal` for
/// call events whose content does not decode
pub fn decode(event: &RoomEvent) -> Result<Signal, SignalError> {
    let kind = SignalKind::from_event_type(&event.event_type)
        .ok_or_else(|| SignalError::UnknownEventType(event.event_type.clone()))?;

    let message = match kind {
        SignalKind::Invite => SignalMessage::Invite(decode_invite(event)?),
        SignalKind::Candidates => SignalMessage::Candidates(decode_candidates(event)?),
        SignalKind::Answer => SignalMessage::Answer(decode_answer(event)?),
        SignalKind::Negotiate => SignalMessage::Negotiate(decode_negotiate(event)?),
        SignalKind::Hangup => SignalMessage::Hangup(decode_hangup(event)?),
    };

    Ok(Signal {
        sender: event.sender.clone(),
        origin_server_ts: event.origin_server_ts,
        message,
    })
}

#[allow(clippy::unwrap_used)]
static MSID: Lazy<Regex> = Lazy::new(|| Regex::new(r"msid:(\S+) (\S+)").unwrap());

fn opaque_for(engine: &str, replacements: &mut Vec<(String, String)>) -> (String, bool) {
    if let Some((_, opaque)) = replacements.iter().find(|(e, _)| e == engine) {
        return (opaque.clone(), false);
    }
    let opaque = uuid::Uuid::new_v4().to_string();
    replacements.push((engine.to_string(), opaque.clone()));
    (opaque, true)
}

/// SDP with engine stream ids replaced by opaque ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MangledSdp {
    /// Rewritten SDP
    pub sdp: String,
    /// Opaque stream ids, in order of first appearance
    pub stream_ids: Vec<String>,
    /// Engine id to opaque id, for streams and tracks
    replacements: Vec<(String, String)>,
}

impl MangledSdp {
    /// Undo the rewrite on an SDP produced from this table
    #[must_use]
    pub fn restore(&self, sdp: &str) -> String {
        let reverse: HashMap<&str, &str> = self
            .replacements
            .iter()
            .map(|(engine, opaque)| (opaque.as_str(), engine.as_str()))
            .collect();
        MSID.replace_all(sdp, |caps: &Captures<'_>| {
            let stream = reverse.get(&caps[1]).copied().unwrap_or(&caps[1]);
            let track = reverse.get(&caps[2]).copied().unwrap_or(&caps[2]);
            format!("msid:{stream} {track}")
        })
        .into_owned()
    }
}

/// Replace every engine stream and track id in `sdp` with a fresh opaque id
///
/// The same engine id always maps to the same opaque id within one call, so
/// audio and video of one stream stay grouped.
#[must_use]
pub fn mangle_stream_ids(sdp: &str) -> MangledSdp {
    let mut replacements: Vec<(String, String)> = Vec::new();
    let mut stream_ids = Vec::new();

    let rewritten = MSID
        .replace_all(sdp, |caps: &Captures<'_>| {
            let (stream, fresh) = opaque_for(&caps[1], &mut replacements);
            if fresh {
                stream_ids.push(stream.clone());
            }
            let (track, _) = opaque_for(&caps[2], &mut replacements);
            format!("msid:{stream} {track}")
        })
        .into_owned();

    MangledSdp {
        sdp: rewritten,
        stream_ids,
        replacements,
    }
}

/// Encoded event ready to be sent into the room
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingSignal {
    /// Event kind
    pub kind: SignalKind,
    /// Event content
    pub content: serde_json::Value,
    /// Opaque stream ids announced by this event
    pub stream_ids: Vec<String>,
}

impl OutgoingSignal {
    /// Room event type
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// Encodes outgoing call events
#[derive(Debug, Clone)]
pub struct SignalEncoder {
    version: String,
    purpose: String,
}

impl SignalEncoder {
    /// Create an encoder for a protocol version and stream purpose
    pub fn new(version: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            purpose: purpose.into(),
        }
    }

    fn version(&self) -> CallVersion {
        CallVersion::Str(self.version.clone())
    }

    fn mangle(&self, sdp: &str) -> (MangledSdp, SdpStreamMetadata) {
        let mangled = mangle_stream_ids(sdp);
        let metadata = mangled
            .stream_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    StreamMetadata {
                        purpose: self.purpose.clone(),
                    },
                )
            })
            .collect();
        (mangled, metadata)
    }

    fn outgoing<T: Serialize>(kind: SignalKind, content: &T, stream_ids: Vec<String>) -> OutgoingSignal {
        OutgoingSignal {
            kind,
            // Plain derived structs with string keys always serialize
            content: serde_json::to_value(content).unwrap_or_default(),
            stream_ids,
        }
    }

    fn capabilities() -> serde_json::Map<String, serde_json::Value> {
        let mut caps = serde_json::Map::new();
        caps.insert("m.call.transferee".to_string(), serde_json::Value::Bool(false));
        caps
    }

    /// Encode an invite carrying the local offer
    #[must_use]
    pub fn invite(&self, call_id: &CallId, party_id: &PartyId, lifetime: Duration, sdp: &str) -> OutgoingSignal {
        let (mangled, metadata) = self.mangle(sdp);
        let content = InviteContent {
            call_id: call_id.clone(),
            party_id: Some(party_id.clone()),
            lifetime: u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX),
            offer: SessionDescription {
                sdp: mangled.sdp,
                kind: SdpType::Offer,
            },
            capabilities: Self::capabilities(),
            version: self.version(),
            sdp_stream_metadata: metadata,
        };
        Self::outgoing(SignalKind::Invite, &content, mangled.stream_ids)
    }

    /// Encode an answer carrying the local answer
    #[must_use]
    pub fn answer(&self, call_id: &CallId, party_id: &PartyId, sdp: &str) -> OutgoingSignal {
        let (mangled, metadata) = self.mangle(sdp);
        let content = AnswerContent {
            call_id: call_id.clone(),
            party_id: Some(party_id.clone()),
            answer: SessionDescription {
                sdp: mangled.sdp,
                kind: SdpType::Answer,
            },
            capabilities: Self::capabilities(),
            version: self.version(),
            sdp_stream_metadata: metadata,
        };
        Self::outgoing(SignalKind::Answer, &content, mangled.stream_ids)
    }

    /// Encode a renegotiation offer or answer
    #[must_use]
    pub fn negotiate(
        &self,
        call_id: &CallId,
        party_id: &PartyId,
        lifetime: Duration,
        sdp: &str,
        kind: SdpType,
    ) -> OutgoingSignal {
        let (mangled, metadata) = self.mangle(sdp);
        let content = NegotiateContent {
            call_id: call_id.clone(),
            party_id: Some(party_id.clone()),
            lifetime: u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX),
            description: SessionDescription {
                sdp: mangled.sdp,
                kind,
            },
            version: self.version(),
            sdp_stream_metadata: metadata,
        };
        Self::outgoing(SignalKind::Negotiate, &content, mangled.stream_ids)
    }

    /// Encode a batch of local candidates; an empty batch is allowed
    #[must_use]
    pub fn candidates(&self, call_id: &CallId, party_id: &PartyId, candidates: &[Candidate]) -> OutgoingSignal {
        let content = CandidatesContent {
            call_id: call_id.clone(),
            party_id: Some(party_id.clone()),
            candidates: candidates.to_vec(),
            version: self.version(),
        };
        Self::outgoing(SignalKind::Candidates, &content, Vec::new())
    }

    /// Encode a hangup
    #[must_use]
    pub fn hangup(&self, call_id: &CallId, party_id: &PartyId, reason: Option<HangupReason>) -> OutgoingSignal {
        let content = HangupContent {
            call_id: call_id.clone(),
            party_id: Some(party_id.clone()),
            version: self.version(),
            reason,
        };
        Self::outgoing(SignalKind::Hangup, &content, Vec::new())
    }
}

impl Default for SignalEncoder {
    fn default() -> Self {
        Self::new("1", "m.usermedia")
    }
}
