//! Call management
//!
//! [`CallManager`] is the single arbiter for call signaling. Every decoded
//! `m.call.*` event for the local user passes through
//! [`CallManager::handle_signal`], which decides whether it belongs to the
//! current call and how it advances it.
//!
//! The manager never blocks and never awaits. Work that has to happen outside
//! it (sending events, fetching TURN credentials, arming the invite timer) is
//! queued as [`CallEffect`]s for the owner to carry out, and the results come
//! back through [`CallManager::handle_turn_refreshed`] and
//! [`CallManager::handle_invite_expired`]. UI-facing notifications go out on a
//! broadcast channel of [`CallEvent`]s.
//!
//! # Call Flow
//!
//! ```text
//!            start_call                 answer + candidates
//!   Idle ───────────────▶ Outgoing ─────────────────────────▶ Active
//!    │ ▲                      │                                  │
//!    │ └──── hangup / ICE failure / invite timeout ◀─────────────┘
//!    │ invite                                                    ▲
//!    ▼                                                           │
//! Incoming ──────────────── accept_call + answer sent ───────────┘
//! ```

use crate::codec::{self, OutgoingSignal, Signal, SignalEncoder, SignalKind, SignalMessage};
use crate::devices::CallDevices;
use crate::identity::{LocalDevice, PartyId, RoomId, SenderOrigin, UserId};
use crate::media::{MediaEngineFactory, MediaEvent, MediaEventSender, PipelineConfig, SessionId};
use crate::participants::CallParticipants;
use crate::sdp;
use crate::session::{CallSession, SessionError, SessionNotice};
use crate::turn::{TurnCache, TurnServers};
use crate::types::{
    CallEvent, CallId, Candidate, EndReason, GlobalState, HangupReason, RoomContext, RoomEvent, SessionState,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Capacity of the call event channel unless configured otherwise
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call is already in progress
    #[error("A call is already in progress")]
    Busy,

    /// Calls need exactly two room members
    #[error("Calls are only supported in rooms with two members, this one has {0}")]
    NotOneToOne(usize),

    /// The media engine or host lacks something calls need
    #[error("Missing capabilities: {}", .0.join(", "))]
    MissingCapabilities(Vec<String>),

    /// The remote offer has no usable audio codec
    #[error("Remote offer has no compatible codec")]
    NoCompatibleCodec,

    /// Operation not allowed in the current state
    #[error("Operation not allowed while {0:?}")]
    InvalidState(GlobalState),

    /// No call to act on
    #[error("No active call")]
    NoActiveCall,

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Lifetime advertised in outgoing invites and negotiates, in milliseconds
    pub invite_lifetime_ms: u64,
    /// Invites older than this are ignored, in milliseconds
    pub stale_invite_age_ms: u64,
    /// Protocol version sent in outgoing events
    pub call_version: String,
    /// Purpose announced for local streams
    pub stream_purpose: String,
    /// Refuse to start calls without a microphone
    pub require_microphone: bool,
    /// Preferred microphone name
    pub microphone: Option<String>,
    /// Preferred camera name; calls send video only when this is set
    pub camera: Option<String>,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            invite_lifetime_ms: 60_000,
            stale_invite_age_ms: 60_000,
            call_version: "1".to_string(),
            stream_purpose: "m.usermedia".to_string(),
            require_microphone: true,
            microphone: None,
            camera: None,
        }
    }
}

impl CallManagerConfig {
    /// Lifetime advertised in outgoing invites
    #[must_use]
    pub fn invite_lifetime(&self) -> Duration {
        Duration::from_millis(self.invite_lifetime_ms)
    }

    /// Age past which incoming invites are ignored
    #[must_use]
    pub fn stale_invite_age(&self) -> Duration {
        Duration::from_millis(self.stale_invite_age_ms)
    }
}

/// Work the manager's owner has to carry out
#[derive(Debug, Clone, PartialEq)]
pub enum CallEffect {
    /// Send an event into a room, in queue order
    Send {
        /// Target room
        room_id: RoomId,
        /// Encoded event
        signal: OutgoingSignal,
    },
    /// Fetch TURN credentials and report back through `handle_turn_refreshed`
    RefreshTurn,
    /// Call `handle_invite_expired` after `lifetime` unless cancelled
    ArmInviteTimer {
        /// Call the timer belongs to
        call_id: CallId,
        /// Delay
        lifetime: Duration,
    },
    /// Cancel the invite timer
    CancelInviteTimer,
}

/// Why a signaling message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    ForeignCall,
    ForeignRoom,
    SelfEcho,
    OwnDevice,
    ForeignSender,
    ForeignParty,
    Busy,
    Stale,
    UnexpectedState,
}

/// What to do once TURN credentials are available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferredStart {
    Offer,
    Answer,
}

#[derive(Debug, Default)]
struct PendingSignal {
    sdp: Option<String>,
    candidates: Vec<(Option<PartyId>, Candidate)>,
}

impl PendingSignal {
    fn take(&mut self) -> (Option<String>, Vec<Candidate>) {
        let candidates = self.candidates.drain(..).map(|(_, c)| c).collect();
        (self.sdp.take(), candidates)
    }
}

#[derive(Debug)]
struct ActiveCall {
    call_id: CallId,
    room_id: RoomId,
    local: LocalDevice,
    remote_user: UserId,
    remote_party: Option<PartyId>,
    members: Vec<UserId>,
    lifetime: Duration,
    pending: PendingSignal,
    session: Option<CallSession>,
    accepted: bool,
    deferred: Option<DeferredStart>,
}

impl ActiveCall {
    fn party_id(&self) -> PartyId {
        self.local
            .party_id
            .clone()
            .unwrap_or_else(|| PartyId::new(String::new()))
    }
}

/// Call manager
///
/// Owns at most one call and its [`CallSession`]. Construct one per account
/// and drive it from a single task.
pub struct CallManager {
    config: CallManagerConfig,
    encoder: SignalEncoder,
    factory: Arc<dyn MediaEngineFactory>,
    devices: CallDevices,
    media_tx: mpsc::UnboundedSender<(SessionId, MediaEvent)>,
    event_sender: broadcast::Sender<CallEvent>,
    effects: VecDeque<CallEffect>,
    turn: TurnCache,
    turn_refreshing: bool,
    state: GlobalState,
    call: Option<ActiveCall>,
    participants: CallParticipants,
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("state", &self.state)
            .field("call", &self.call)
            .field("effects", &self.effects.len())
            .finish_non_exhaustive()
    }
}

impl CallManager {
    /// Create new call manager
    ///
    /// Returns the receiver that engine callbacks arrive on; feed each one to
    /// [`CallManager::handle_media_event`].
    pub fn new(
        config: CallManagerConfig,
        factory: Arc<dyn MediaEngineFactory>,
        devices: CallDevices,
    ) -> (Self, mpsc::UnboundedReceiver<(SessionId, MediaEvent)>) {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (event_sender, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let encoder = SignalEncoder::new(config.call_version.clone(), config.stream_purpose.clone());
        let manager = Self {
            config,
            encoder,
            factory,
            devices,
            media_tx,
            event_sender,
            effects: VecDeque::new(),
            turn: TurnCache::new(),
            turn_refreshing: false,
            state: GlobalState::Idle,
            call: None,
            participants: CallParticipants::new(),
        };
        (manager, media_rx)
    }

    /// Use an event channel of the given capacity
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (event_sender, _) = broadcast::channel(capacity.max(1));
        self.event_sender = event_sender;
        self
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Sender side of the event channel, for handing out more subscriptions
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<CallEvent> {
        self.event_sender.clone()
    }

    /// Take the next queued effect
    pub fn poll_effect(&mut self) -> Option<CallEffect> {
        self.effects.pop_front()
    }

    /// Configuration
    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    /// Global call state
    pub fn state(&self) -> GlobalState {
        self.state
    }

    /// Current call id
    pub fn call_id(&self) -> Option<&CallId> {
        self.call.as_ref().map(|c| &c.call_id)
    }

    /// Room of the current call
    pub fn room_id(&self) -> Option<&RoomId> {
        self.call.as_ref().map(|c| &c.room_id)
    }

    /// Other user in the current call
    pub fn remote_user(&self) -> Option<&UserId> {
        self.call.as_ref().map(|c| &c.remote_user)
    }

    /// Party id of the answering remote device, once known
    pub fn remote_party(&self) -> Option<&PartyId> {
        self.call.as_ref().and_then(|c| c.remote_party.as_ref())
    }

    /// Party id this device uses in the current call
    pub fn local_party(&self) -> Option<&PartyId> {
        self.call.as_ref().and_then(|c| c.local.party_id.as_ref())
    }

    /// Lifetime of the current call's invite
    pub fn lifetime(&self) -> Option<Duration> {
        self.call.as_ref().map(|c| c.lifetime)
    }

    /// Negotiation state of the current session
    pub fn session_state(&self) -> SessionState {
        self.call
            .as_ref()
            .and_then(|c| c.session.as_ref())
            .map_or(SessionState::Disconnected, CallSession::state)
    }

    /// Whether a session exists
    pub fn has_session(&self) -> bool {
        self.call.as_ref().is_some_and(|c| c.session.is_some())
    }

    /// Whether a remote description is waiting to be applied
    pub fn has_pending_sdp(&self) -> bool {
        self.call.as_ref().is_some_and(|c| c.pending.sdp.is_some())
    }

    /// Number of remote candidates waiting to be applied
    pub fn pending_candidates(&self) -> usize {
        self.call.as_ref().map_or(0, |c| c.pending.candidates.len())
    }

    /// People in the current call
    pub fn participants(&self) -> &CallParticipants {
        &self.participants
    }

    /// Device inventory
    pub fn devices(&self) -> &CallDevices {
        &self.devices
    }

    /// Cached TURN URIs
    pub fn turn_uris(&self) -> &[String] {
        self.turn.uris()
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    fn set_state(&mut self, state: GlobalState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = ?self.state, to = ?state, "Call state changed");
        self.state = state;
        self.emit(CallEvent::GlobalStateChanged(state));
    }

    fn send(&mut self, room_id: RoomId, signal: OutgoingSignal) {
        self.effects.push_back(CallEffect::Send { room_id, signal });
    }

    fn request_turn(&mut self) {
        if !self.turn_refreshing {
            self.turn_refreshing = true;
            self.effects.push_back(CallEffect::RefreshTurn);
        }
    }

    fn dropped(reason: DropReason, kind: SignalKind, call_id: &CallId) {
        tracing::debug!(?reason, event_type = kind.event_type(), call_id = %call_id, "Dropping call event");
    }

    /// Decode and handle a room event; anything that is not a call event is ignored
    #[tracing::instrument(skip(self, room, event), fields(room = %room.room_id, event_id = %event.event_id))]
    pub fn handle_room_event(&mut self, room: &RoomContext, event: &RoomEvent) {
        if SignalKind::from_event_type(&event.event_type).is_none() {
            return;
        }
        match codec::decode(event) {
            Ok(signal) => self.handle_signal(room, signal),
            Err(e) => tracing::debug!(error = %e, "Dropping malformed call event"),
        }
    }

    /// Handle a decoded signaling message
    pub fn handle_signal(&mut self, room: &RoomContext, signal: Signal) {
        let kind = signal.message.kind();
        let call_id = signal.message.call_id().clone();

        let Some(call) = self.call.as_ref() else {
            if let SignalMessage::Invite(invite) = signal.message {
                self.on_invite(room, &signal.sender, signal.origin_server_ts, invite);
            } else {
                Self::dropped(DropReason::ForeignCall, kind, &call_id);
            }
            return;
        };

        if call.call_id != call_id {
            let reason = if kind == SignalKind::Invite {
                DropReason::Busy
            } else {
                DropReason::ForeignCall
            };
            Self::dropped(reason, kind, &call_id);
            return;
        }
        if call.room_id != room.room_id {
            Self::dropped(DropReason::ForeignRoom, kind, &call_id);
            return;
        }

        match call.local.origin_of(&signal.sender, signal.message.party_id()) {
            SenderOrigin::ThisDevice => {
                Self::dropped(DropReason::SelfEcho, kind, &call_id);
                return;
            }
            SenderOrigin::OtherOwnDevice => {
                self.on_other_own_device(signal.message);
                return;
            }
            SenderOrigin::Remote => {}
        }

        if signal.sender != call.remote_user {
            Self::dropped(DropReason::ForeignSender, kind, &call_id);
            return;
        }
        // Any of the remote user's devices may hang up
        let hangup = matches!(signal.message, SignalMessage::Hangup(_));
        if let (false, Some(expected), Some(party)) = (hangup, &call.remote_party, signal.message.party_id()) {
            if expected != party {
                Self::dropped(DropReason::ForeignParty, kind, &call_id);
                return;
            }
        }

        match signal.message {
            SignalMessage::Invite(_) => Self::dropped(DropReason::Busy, kind, &call_id),
            SignalMessage::Candidates(c) => self.on_candidates(c.party_id, c.candidates),
            SignalMessage::Answer(a) => self.on_answer(a.party_id, a.sdp),
            SignalMessage::Negotiate(n) => self.on_negotiate(&n.sdp, n.is_answer),
            SignalMessage::Hangup(h) => {
                tracing::info!(call_id = %call_id, reason = ?h.reason, "Remote hangup");
                self.end_call(EndReason::RemoteHangup, None);
            }
        }
    }

    fn on_invite(
        &mut self,
        room: &RoomContext,
        sender: &UserId,
        sent_at: chrono::DateTime<Utc>,
        invite: codec::Invite,
    ) {
        if sender == &room.local_user {
            Self::dropped(DropReason::OwnDevice, SignalKind::Invite, &invite.call_id);
            return;
        }

        let age = (Utc::now() - sent_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.config.stale_invite_age() || age > invite.lifetime {
            tracing::debug!(age_ms = age.as_millis(), "Invite is stale");
            Self::dropped(DropReason::Stale, SignalKind::Invite, &invite.call_id);
            return;
        }

        tracing::info!(call_id = %invite.call_id, caller = %sender, "Incoming call");
        let mut local = LocalDevice::new(room.local_user.clone());
        local.party_id = Some(PartyId::generate());
        let call_id = invite.call_id.clone();
        let lifetime = invite.lifetime;

        self.call = Some(ActiveCall {
            call_id: call_id.clone(),
            room_id: room.room_id.clone(),
            local,
            remote_user: sender.clone(),
            remote_party: invite.party_id,
            members: room.members.clone(),
            lifetime,
            pending: PendingSignal {
                sdp: Some(invite.sdp),
                candidates: Vec::new(),
            },
            session: None,
            accepted: false,
            deferred: None,
        });

        self.set_state(GlobalState::Incoming);
        self.effects.push_back(CallEffect::ArmInviteTimer {
            call_id: call_id.clone(),
            lifetime,
        });
        self.emit(CallEvent::IncomingCall {
            remote_user: sender.clone(),
            room_id: room.room_id.clone(),
            lifetime,
            call_id,
        });
        // Refresh early so accepting does not wait on the homeserver
        if !self.turn.is_fresh(Utc::now()) {
            self.request_turn();
        }
    }

    fn on_other_own_device(&mut self, message: SignalMessage) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let call_id = call.call_id.clone();
        match message {
            SignalMessage::Answer(_) if self.state == GlobalState::Incoming => {
                tracing::info!(call_id = %call_id, "Call answered on another device");
                self.emit(CallEvent::AnsweredElsewhere {
                    call_id: call_id.clone(),
                });
                self.end_call(EndReason::AnsweredElsewhere, None);
            }
            SignalMessage::Hangup(_) => {
                tracing::info!(call_id = %call_id, "Call ended on another device");
                self.end_call(EndReason::RemoteHangup, None);
            }
            other => Self::dropped(DropReason::OwnDevice, other.kind(), &call_id),
        }
    }

    fn on_candidates(&mut self, party: Option<PartyId>, candidates: Vec<Candidate>) {
        let state = self.state;
        let Some(call) = self.call.as_mut() else {
            return;
        };

        let accepted = call.accepted;
        let live_session = call
            .session
            .as_mut()
            .filter(|s| s.has_pipeline() && (state == GlobalState::Active || accepted));
        if let Some(session) = live_session {
            tracing::debug!(count = candidates.len(), "Applying remote candidates");
            session.accept_candidates(&candidates);
            return;
        }

        tracing::debug!(count = candidates.len(), "Buffering remote candidates");
        call.pending
            .candidates
            .extend(candidates.into_iter().map(|c| (party.clone(), c)));
        if state == GlobalState::Outgoing {
            self.try_accept_answer();
        }
    }

    fn on_answer(&mut self, party: Option<PartyId>, answer: String) {
        if self.state != GlobalState::Outgoing {
            if let Some(call) = self.call.as_ref() {
                Self::dropped(DropReason::UnexpectedState, SignalKind::Answer, &call.call_id);
            }
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.pending.sdp.is_some() {
            Self::dropped(DropReason::UnexpectedState, SignalKind::Answer, &call.call_id);
            return;
        }

        tracing::debug!(call_id = %call.call_id, party = ?party, "Answer received");
        if let Some(party) = party {
            call.pending
                .candidates
                .retain(|(from, _)| from.as_ref().map_or(true, |f| f == &party));
            call.remote_party = Some(party);
        }
        call.pending.sdp = Some(answer);
        self.try_accept_answer();
    }

    /// Apply the buffered answer once candidates for it have arrived
    fn try_accept_answer(&mut self) {
        if self.state != GlobalState::Outgoing {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(answer) = call.pending.sdp.as_deref() else {
            return;
        };
        let ready = !call.pending.candidates.is_empty() || sdp::has_inline_candidates(answer);
        if !ready {
            tracing::debug!(call_id = %call.call_id, "Answer buffered until candidates arrive");
            return;
        }
        let Some(session) = call.session.as_mut() else {
            return;
        };
        if session.state() != SessionState::OfferSent {
            tracing::debug!(state = ?session.state(), "Answer buffered until the offer is out");
            return;
        }

        let (sdp, candidates) = call.pending.take();
        let Some(sdp) = sdp else {
            return;
        };
        tracing::info!(call_id = %call.call_id, candidates = candidates.len(), "Applying answer");
        match session.accept_answer(&sdp, &candidates, &call.remote_user) {
            Ok(()) => {
                self.effects.push_back(CallEffect::CancelInviteTimer);
                self.set_state(GlobalState::Active);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to apply answer");
                self.end_call(EndReason::MediaFailed(e.to_string()), Some(HangupReason::UnknownError));
            }
        }
    }

    fn on_negotiate(&mut self, description: &str, is_answer: bool) {
        if self.state != GlobalState::Active {
            if let Some(call) = self.call.as_ref() {
                Self::dropped(DropReason::UnexpectedState, SignalKind::Negotiate, &call.call_id);
            }
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(session) = call.session.as_mut() else {
            return;
        };
        if let Err(e) = session.renegotiate_offer(description, &call.remote_user, is_answer) {
            tracing::debug!(error = %e, "Dropping negotiate");
        }
    }

    /// Start a call in a 1:1 room
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a call is in progress, `NotOneToOne` unless the room
    /// has exactly two members, `MissingCapabilities` if calls are not possible
    #[tracing::instrument(skip(self, room), fields(room = %room.room_id))]
    pub fn start_call(&mut self, room: &RoomContext) -> Result<CallId, CallError> {
        if self.state != GlobalState::Idle {
            tracing::warn!(state = ?self.state, "Cannot start call: busy");
            return Err(CallError::Busy);
        }
        let remote_user = match room.other_user() {
            Some(user) if room.is_one_to_one() => user.clone(),
            _ => {
                tracing::warn!(members = room.members.len(), "Cannot start call: not a 1:1 room");
                return Err(CallError::NotOneToOne(room.members.len()));
            }
        };
        let mut missing = self.factory.missing_capabilities();
        if self.config.require_microphone && !self.devices.has_microphone() {
            missing.push("microphone".to_string());
        }
        if !missing.is_empty() {
            tracing::warn!(?missing, "Cannot start call: missing capabilities");
            return Err(CallError::MissingCapabilities(missing));
        }

        let call_id = CallId::generate();
        let mut local = LocalDevice::new(room.local_user.clone());
        local.party_id = Some(PartyId::generate());
        tracing::info!(call_id = %call_id, callee = %remote_user, "Starting call");

        self.call = Some(ActiveCall {
            call_id: call_id.clone(),
            room_id: room.room_id.clone(),
            local,
            remote_user,
            remote_party: None,
            members: room.members.clone(),
            lifetime: self.config.invite_lifetime(),
            pending: PendingSignal::default(),
            session: None,
            accepted: false,
            deferred: None,
        });
        self.set_state(GlobalState::Outgoing);

        if self.turn.is_fresh(Utc::now()) {
            self.open_session(DeferredStart::Offer);
        } else {
            if let Some(call) = self.call.as_mut() {
                call.deferred = Some(DeferredStart::Offer);
            }
            self.request_turn();
        }
        Ok(call_id)
    }

    /// Accept the incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a call is ringing, `NoCompatibleCodec`
    /// if the offer cannot be answered (the call is then rejected)
    #[tracing::instrument(skip(self))]
    pub fn accept_call(&mut self) -> Result<(), CallError> {
        let state = self.state;
        let Some(call) = self.call.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        if state != GlobalState::Incoming || call.accepted {
            return Err(CallError::InvalidState(state));
        }

        let compatible = call
            .pending
            .sdp
            .as_deref()
            .is_some_and(sdp::has_compatible_audio);
        if !compatible {
            tracing::warn!(call_id = %call.call_id, "Rejecting call without a compatible codec");
            self.end_call(EndReason::NoCompatibleCodec, Some(HangupReason::UnknownError));
            return Err(CallError::NoCompatibleCodec);
        }

        tracing::info!(call_id = %call.call_id, "Accepting call");
        call.accepted = true;
        self.effects.push_back(CallEffect::CancelInviteTimer);

        if self.turn.is_fresh(Utc::now()) {
            self.open_session(DeferredStart::Answer);
        } else {
            if let Some(call) = self.call.as_mut() {
                call.deferred = Some(DeferredStart::Answer);
            }
            self.request_turn();
        }
        Ok(())
    }

    /// Hang up the current call; without a call this does nothing
    #[tracing::instrument(skip(self))]
    pub fn hangup_call(&mut self) {
        if self.call.is_none() {
            tracing::debug!("No call to hang up");
            return;
        }
        self.end_call(EndReason::LocalHangup, Some(HangupReason::UserHangup));
    }

    /// Stop ringing locally without telling the caller
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a call is ringing
    pub fn ignore_call(&mut self) -> Result<(), CallError> {
        if self.state != GlobalState::Incoming || self.call.as_ref().is_some_and(|c| c.accepted) {
            return Err(CallError::InvalidState(self.state));
        }
        self.end_call(EndReason::Ignored, None);
        Ok(())
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` without a session, or the session's error
    pub fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        let session = self
            .call
            .as_mut()
            .and_then(|c| c.session.as_mut())
            .ok_or(CallError::NoActiveCall)?;
        session.set_muted(muted)?;
        self.emit(CallEvent::MutedChanged(muted));
        Ok(())
    }

    /// Whether the microphone is muted
    pub fn muted(&self) -> bool {
        self.call
            .as_ref()
            .and_then(|c| c.session.as_ref())
            .is_some_and(CallSession::muted)
    }

    /// Toggle the camera; returns whether it is now on
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` without a session, or the session's error
    pub fn toggle_camera(&mut self) -> Result<bool, CallError> {
        let session = self
            .call
            .as_mut()
            .and_then(|c| c.session.as_mut())
            .ok_or(CallError::NoActiveCall)?;
        Ok(session.toggle_camera()?)
    }

    /// Record a TURN refresh result and continue a start or accept waiting on it
    pub fn handle_turn_refreshed(&mut self, result: Result<TurnServers, String>) {
        self.turn_refreshing = false;
        match result {
            Ok(servers) => self.turn.update(&servers, Utc::now()),
            Err(e) => tracing::warn!(error = %e, "TURN refresh failed, continuing without TURN"),
        }

        let deferred = self.call.as_mut().and_then(|c| c.deferred.take());
        match deferred {
            Some(DeferredStart::Offer) if self.state == GlobalState::Outgoing => {
                self.open_session(DeferredStart::Offer);
            }
            Some(DeferredStart::Answer) if self.state == GlobalState::Incoming => {
                self.open_session(DeferredStart::Answer);
            }
            Some(start) => tracing::debug!(?start, state = ?self.state, "Call moved on while waiting for TURN"),
            None => {}
        }
    }

    /// Invite timer fired
    #[tracing::instrument(skip(self))]
    pub fn handle_invite_expired(&mut self, call_id: &CallId) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        if &call.call_id != call_id {
            return;
        }
        match self.state {
            GlobalState::Incoming if !call.accepted => {
                tracing::info!(call_id = %call_id, "Incoming call expired");
                self.end_call(EndReason::InviteExpired, None);
            }
            GlobalState::Outgoing => {
                tracing::info!(call_id = %call_id, "Outgoing call was not answered");
                self.end_call(EndReason::InviteExpired, Some(HangupReason::InviteTimeout));
            }
            _ => {}
        }
    }

    /// Feed an engine callback; callbacks from a session that is gone are dropped
    pub fn handle_media_event(&mut self, session_id: SessionId, event: MediaEvent) {
        let session = self
            .call
            .as_mut()
            .and_then(|c| c.session.as_mut())
            .filter(|s| s.id() == session_id);
        let Some(session) = session else {
            tracing::trace!(session = %session_id, "Dropping media event for stale session");
            return;
        };
        let notices = session.handle_media_event(event);
        self.apply_notices(notices);
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            turn_uris: self.turn.uris().to_vec(),
            audio_device: self.devices.microphone(self.config.microphone.as_deref()),
            video_device: self
                .config
                .camera
                .as_deref()
                .and_then(|c| self.devices.camera(Some(c))),
        }
    }

    fn open_session(&mut self, start: DeferredStart) {
        let config = self.pipeline_config();
        let id = SessionId::next();
        let engine = self
            .factory
            .create(MediaEventSender::new(id, self.media_tx.clone()));
        let mut session = CallSession::new(id, engine);

        let Some(call) = self.call.as_mut() else {
            return;
        };
        let result = match start {
            DeferredStart::Offer => session.start_call(&config),
            DeferredStart::Answer => {
                let (offer, candidates) = call.pending.take();
                let offer = offer.unwrap_or_default();
                session.accept_offer(&config, &offer, &candidates, &call.remote_user)
            }
        };
        call.session = Some(session);

        match result {
            Ok(notices) => self.apply_notices(notices),
            Err(e) => {
                tracing::error!(error = %e, "Failed to start media session");
                let message = e.to_string();
                let reason = match e {
                    SessionError::NoCompatibleCodec => EndReason::NoCompatibleCodec,
                    _ => EndReason::MediaFailed(message.clone()),
                };
                self.emit(CallEvent::Error(message));
                self.end_call(reason, Some(HangupReason::UserMediaFailed));
            }
        }
    }

    fn register_participants(&mut self) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let mut changed = false;
        for member in &call.members {
            changed |= self.participants.add(member.clone());
        }
        if changed {
            self.emit(CallEvent::ParticipantsChanged);
        }
    }

    fn apply_notices(&mut self, notices: Vec<SessionNotice>) {
        for notice in notices {
            if self.call.is_none() {
                return;
            }
            self.apply_notice(notice);
        }
    }

    fn apply_notice(&mut self, notice: SessionNotice) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let room_id = call.room_id.clone();
        let call_id = call.call_id.clone();
        let party_id = call.party_id();

        match notice {
            SessionNotice::StateChanged(state) => self.emit(CallEvent::StateChanged(state)),
            SessionNotice::OfferCreated { sdp, candidates } => {
                tracing::info!(call_id = %call_id, candidates = candidates.len(), "Sending invite");
                let lifetime = self.config.invite_lifetime();
                let invite = self.encoder.invite(&call_id, &party_id, lifetime, &sdp);
                let candidates = self.encoder.candidates(&call_id, &party_id, &candidates);
                self.send(room_id.clone(), invite);
                self.send(room_id, candidates);
                self.effects.push_back(CallEffect::ArmInviteTimer { call_id, lifetime });
                self.register_participants();
            }
            SessionNotice::AnswerCreated { sdp, candidates } => {
                tracing::info!(call_id = %call_id, candidates = candidates.len(), "Sending answer");
                let answer = self.encoder.answer(&call_id, &party_id, &sdp);
                let candidates = self.encoder.candidates(&call_id, &party_id, &candidates);
                self.send(room_id.clone(), answer);
                self.send(room_id, candidates);
                self.set_state(GlobalState::Active);
                self.register_participants();
            }
            SessionNotice::Renegotiate { sdp, kind } => {
                tracing::info!(call_id = %call_id, kind = kind.as_str(), "Sending negotiate");
                let negotiate =
                    self.encoder
                        .negotiate(&call_id, &party_id, self.config.invite_lifetime(), &sdp, kind);
                self.send(room_id, negotiate);
            }
            SessionNotice::RemoteVideo { user } => {
                self.participants.add(user.clone());
                if self.participants.set_has_camera(&user, true) {
                    self.emit(CallEvent::ParticipantsChanged);
                }
            }
            SessionNotice::Failed(reason) => {
                let hangup = match reason {
                    EndReason::IceFailed => HangupReason::IceFailed,
                    EndReason::MediaFailed(_) => HangupReason::UserMediaFailed,
                    _ => HangupReason::UnknownError,
                };
                self.end_call(reason, Some(hangup));
            }
        }
    }

    fn end_call(&mut self, reason: EndReason, hangup: Option<HangupReason>) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        tracing::info!(call_id = %call.call_id, ?reason, "Call ended");

        if let Some(hangup) = hangup {
            let signal = self.encoder.hangup(&call.call_id, &call.party_id(), Some(hangup));
            self.send(call.room_id.clone(), signal);
        }
        self.effects.push_back(CallEffect::CancelInviteTimer);

        if let Some(session) = call.session.as_mut() {
            for notice in session.end() {
                if let SessionNotice::StateChanged(state) = notice {
                    self.emit(CallEvent::StateChanged(state));
                }
            }
        }
        if !self.participants.is_empty() {
            self.participants.clear();
            self.emit(CallEvent::ParticipantsChanged);
        }
        self.set_state(GlobalState::Idle);
        self.emit(CallEvent::CallEnded {
            call_id: call.call_id,
            reason,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::devices::AudioDevice;
    use crate::media::ScriptedEngineFactory;

    fn user(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn room(members: &[&str]) -> RoomContext {
        RoomContext::new(
            RoomId::parse("!room:example.org").unwrap(),
            user("@alice:example.org"),
            members.iter().map(|m| user(m)).collect(),
        )
    }

    fn manager() -> (CallManager, mpsc::UnboundedReceiver<(SessionId, MediaEvent)>) {
        let devices = CallDevices::with_devices(
            vec![AudioDevice {
                id: "mic".to_string(),
                name: "Microphone".to_string(),
            }],
            Vec::new(),
        );
        CallManager::new(
            CallManagerConfig::default(),
            Arc::new(ScriptedEngineFactory::default()),
            devices,
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = CallManagerConfig::default();
        assert_eq!(config.invite_lifetime(), Duration::from_secs(60));
        assert_eq!(config.stale_invite_age(), Duration::from_secs(60));
        assert_eq!(config.call_version, "1");

        let parsed: CallManagerConfig = serde_json::from_str(r#"{"invite_lifetime_ms": 30000}"#).unwrap();
        assert_eq!(parsed.invite_lifetime(), Duration::from_secs(30));
        assert!(parsed.require_microphone);
    }

    #[test]
    fn test_start_call_waits_for_turn() {
        let (mut m, _rx) = manager();
        let room = room(&["@alice:example.org", "@bob:example.org"]);
        m.start_call(&room).unwrap();

        assert_eq!(m.state(), GlobalState::Outgoing);
        assert!(!m.has_session());
        assert_eq!(m.poll_effect(), Some(CallEffect::RefreshTurn));
        assert_eq!(m.poll_effect(), None);

        m.handle_turn_refreshed(Err("offline".to_string()));
        assert!(m.has_session());
        assert_eq!(m.session_state(), SessionState::Initiated);
    }

    #[test]
    fn test_second_start_is_busy() {
        let (mut m, _rx) = manager();
        let room = room(&["@alice:example.org", "@bob:example.org"]);
        m.start_call(&room).unwrap();
        assert_eq!(m.start_call(&room), Err(CallError::Busy));
        assert_eq!(m.state(), GlobalState::Outgoing);
    }

    #[test]
    fn test_start_call_requires_microphone() {
        let (mut m, _rx) = CallManager::new(
            CallManagerConfig::default(),
            Arc::new(ScriptedEngineFactory::default()),
            CallDevices::new(),
        );
        let room = room(&["@alice:example.org", "@bob:example.org"]);
        assert_eq!(
            m.start_call(&room),
            Err(CallError::MissingCapabilities(vec!["microphone".to_string()]))
        );
        assert_eq!(m.state(), GlobalState::Idle);
    }

    #[test]
    fn test_hangup_without_call_is_noop() {
        let (mut m, _rx) = manager();
        m.hangup_call();
        assert_eq!(m.poll_effect(), None);
        assert_eq!(m.ignore_call(), Err(CallError::InvalidState(GlobalState::Idle)));
        assert_eq!(m.accept_call(), Err(CallError::NoActiveCall));
        assert_eq!(m.set_muted(true), Err(CallError::NoActiveCall));
        assert!(!m.muted());
    }
}
