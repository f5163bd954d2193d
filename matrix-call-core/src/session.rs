//! Call session state machine
//!
//! A [`CallSession`] owns one media engine pipeline and tracks how far
//! negotiation has progressed. It is driven from two directions: the call
//! manager calls its operations when signaling arrives, and the engine's
//! [`MediaEvent`]s are fed back through [`CallSession::handle_media_event`].
//! Both return [`SessionNotice`]s for the manager to act on.
//!
//! # State machine
//!
//! ```text
//! Disconnected → Initiating → Initiated → OfferSent  ┐
//!                                       → AnswerSent ┴→ Connecting → Connected
//! any → IceFailed (ICE failure)
//! any → Disconnected (end)
//! ```

use crate::identity::UserId;
use crate::media::{IceConnectionState, MediaEngine, MediaError, MediaEvent, PipelineConfig, SessionId};
use crate::sdp;
use crate::types::{Candidate, EndReason, MediaKind, SdpType, SessionState};
use std::collections::HashMap;
use thiserror::Error;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The remote offer has no audio codec we can use
    #[error("Remote offer has no compatible audio codec")]
    NoCompatibleCodec,

    /// Operation not allowed in the current state
    #[error("Operation not allowed in state {0:?}")]
    InvalidState(SessionState),

    /// Engine error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Which side of the offer/answer exchange this session is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Created the offer
    Offering,
    /// Answers a remote offer
    Answering,
}

/// Something the call manager has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// Local offer and its candidates are ready to be sent
    OfferCreated {
        /// Offer SDP
        sdp: String,
        /// Candidates gathered for it
        candidates: Vec<Candidate>,
    },
    /// Local answer and its candidates are ready to be sent
    AnswerCreated {
        /// Answer SDP
        sdp: String,
        /// Candidates gathered for it
        candidates: Vec<Candidate>,
    },
    /// A mid-call description is ready to be sent
    Renegotiate {
        /// SDP
        sdp: String,
        /// Offer or answer
        kind: SdpType,
    },
    /// Negotiation state changed
    StateChanged(SessionState),
    /// Video started arriving from a user
    RemoteVideo {
        /// Attributed user
        user: UserId,
    },
    /// The session cannot continue
    Failed(EndReason),
}

/// One call's negotiation state and media pipeline
pub struct CallSession {
    id: SessionId,
    engine: Box<dyn MediaEngine>,
    role: Option<SessionRole>,
    state: SessionState,
    pipeline: bool,
    ice: IceConnectionState,
    local_sdp: Option<String>,
    local_candidates: Vec<Candidate>,
    gathering_complete: bool,
    description_sent: bool,
    remote_user: Option<UserId>,
    remote_streams: HashMap<String, UserId>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    /// Create a session around a fresh engine
    pub fn new(id: SessionId, engine: Box<dyn MediaEngine>) -> Self {
        Self {
            id,
            engine,
            role: None,
            state: SessionState::Disconnected,
            pipeline: false,
            ice: IceConnectionState::New,
            local_sdp: None,
            local_candidates: Vec::new(),
            gathering_complete: false,
            description_sent: false,
            remote_user: None,
            remote_streams: HashMap::new(),
        }
    }

    /// Session id its engine tags events with
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Offering or answering, once decided
    pub fn role(&self) -> Option<SessionRole> {
        self.role
    }

    /// Whether the engine pipeline exists
    pub fn has_pipeline(&self) -> bool {
        self.pipeline
    }

    /// Local candidates gathered so far
    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    /// User a remote stream id was announced by
    pub fn user_for_stream(&self, msid: &str) -> Option<&UserId> {
        self.remote_streams.get(msid)
    }

    fn set_state(&mut self, to: SessionState, notices: &mut Vec<SessionNotice>) {
        if !self.state.can_transition_to(to) {
            tracing::debug!(session = %self.id, from = ?self.state, to = ?to, "Ignoring invalid transition");
            return;
        }
        tracing::debug!(session = %self.id, from = ?self.state, to = ?to, "Session state changed");
        self.state = to;
        notices.push(SessionNotice::StateChanged(to));
    }

    fn build(&mut self, config: &PipelineConfig, notices: &mut Vec<SessionNotice>) -> Result<(), SessionError> {
        self.set_state(SessionState::Initiating, notices);
        if let Err(e) = self.engine.build_pipeline(config) {
            tracing::error!(session = %self.id, error = %e, "Failed to build pipeline");
            self.set_state(SessionState::Disconnected, notices);
            return Err(e.into());
        }
        self.pipeline = true;
        self.set_state(SessionState::Initiated, notices);
        Ok(())
    }

    fn remember_streams(&mut self, remote_sdp: &str, user: &UserId) {
        for section in sdp::media_sections(remote_sdp) {
            if let Some(msid) = section.msid {
                self.remote_streams.insert(msid, user.clone());
            }
        }
    }

    fn apply_remote(&mut self, remote_sdp: &str, kind: SdpType, user: &UserId) -> Result<(), SessionError> {
        self.remote_user = Some(user.clone());
        self.remember_streams(remote_sdp, user);
        self.engine.apply_remote_description(remote_sdp, kind)?;
        Ok(())
    }

    fn add_remote_candidates(&mut self, candidates: &[Candidate]) {
        let usable: Vec<Candidate> = candidates
            .iter()
            .filter(|c| !c.is_end_of_candidates())
            .cloned()
            .collect();
        if !usable.is_empty() {
            self.engine.add_candidates(&usable);
        }
    }

    /// Start the offering side: build the pipeline and ask for an offer
    ///
    /// Does nothing once the session has left `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline cannot be built
    #[tracing::instrument(skip(self, config), fields(session = %self.id))]
    pub fn start_call(&mut self, config: &PipelineConfig) -> Result<Vec<SessionNotice>, SessionError> {
        let mut notices = Vec::new();
        if self.state != SessionState::Disconnected {
            return Ok(notices);
        }
        self.role = Some(SessionRole::Offering);
        self.build(config, &mut notices)?;
        self.engine.request_offer();
        Ok(notices)
    }

    /// Start the answering side for a remote offer
    ///
    /// # Errors
    ///
    /// Returns `NoCompatibleCodec` if the offer has no usable audio,
    /// `InvalidState` outside `Disconnected`, or the engine's error
    #[tracing::instrument(skip(self, config, offer, candidates), fields(session = %self.id))]
    pub fn accept_offer(
        &mut self,
        config: &PipelineConfig,
        offer: &str,
        candidates: &[Candidate],
        remote_user: &UserId,
    ) -> Result<Vec<SessionNotice>, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState(self.state));
        }
        if !sdp::has_compatible_audio(offer) {
            tracing::warn!(codec = sdp::REQUIRED_AUDIO_CODEC, "Remote offer lacks required codec");
            return Err(SessionError::NoCompatibleCodec);
        }

        let mut notices = Vec::new();
        self.role = Some(SessionRole::Answering);
        self.build(config, &mut notices)?;
        self.apply_remote(offer, SdpType::Offer, remote_user)?;
        self.add_remote_candidates(candidates);
        self.engine.request_answer();
        Ok(notices)
    }

    /// Apply the remote answer and its candidates
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the offer has been sent
    #[tracing::instrument(skip(self, answer, candidates), fields(session = %self.id))]
    pub fn accept_answer(
        &mut self,
        answer: &str,
        candidates: &[Candidate],
        remote_user: &UserId,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::OfferSent {
            return Err(SessionError::InvalidState(self.state));
        }
        self.apply_remote(answer, SdpType::Answer, remote_user)?;
        self.add_remote_candidates(candidates);
        Ok(())
    }

    /// Apply a mid-call description; a remote offer is answered without a new pipeline
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before the first local description went out
    #[tracing::instrument(skip(self, description), fields(session = %self.id))]
    pub fn renegotiate_offer(
        &mut self,
        description: &str,
        remote_user: &UserId,
        is_answer: bool,
    ) -> Result<(), SessionError> {
        if !self.pipeline || !self.state.is_negotiated() {
            return Err(SessionError::InvalidState(self.state));
        }
        if is_answer {
            self.apply_remote(description, SdpType::Answer, remote_user)?;
        } else {
            self.apply_remote(description, SdpType::Offer, remote_user)?;
            self.engine.request_answer();
        }
        Ok(())
    }

    /// Hand remote candidates to the engine; without a pipeline this does nothing
    pub fn accept_candidates(&mut self, candidates: &[Candidate]) {
        if !self.pipeline {
            tracing::debug!(session = %self.id, "No pipeline, candidates not applied");
            return;
        }
        self.add_remote_candidates(candidates);
    }

    /// Tear the pipeline down; calling it again does nothing
    pub fn end(&mut self) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        if self.pipeline {
            self.engine.end();
            self.pipeline = false;
        }
        if self.state != SessionState::Disconnected {
            self.set_state(SessionState::Disconnected, &mut notices);
        }
        notices
    }

    /// Whether the microphone is muted; always false before ICE starts
    pub fn muted(&self) -> bool {
        if !self.pipeline || self.state < SessionState::Connecting {
            return false;
        }
        self.engine.muted()
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before ICE starts
    pub fn set_muted(&mut self, muted: bool) -> Result<(), SessionError> {
        if !self.pipeline || self.state < SessionState::Connecting {
            return Err(SessionError::InvalidState(self.state));
        }
        self.engine.set_muted(muted)?;
        Ok(())
    }

    /// Toggle the camera; returns whether it is now on
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without a pipeline
    pub fn toggle_camera(&mut self) -> Result<bool, SessionError> {
        if !self.pipeline {
            return Err(SessionError::InvalidState(self.state));
        }
        Ok(self.engine.toggle_camera()?)
    }

    /// Process a callback from this session's engine
    #[tracing::instrument(skip(self), fields(session = %self.id, state = ?self.state))]
    pub fn handle_media_event(&mut self, event: MediaEvent) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        if !self.pipeline {
            tracing::debug!("Media event after teardown");
            return notices;
        }

        match event {
            MediaEvent::NegotiationNeeded => {
                // Before the first description the offer is already on its way
                if self.description_sent && self.state.is_negotiated() {
                    self.engine.request_offer();
                }
            }
            MediaEvent::LocalDescriptionReady { sdp, kind } => {
                if self.description_sent {
                    notices.push(SessionNotice::Renegotiate { sdp, kind });
                } else {
                    self.local_sdp = Some(sdp);
                    // Engines may finish gathering before the description is ready
                    if self.gathering_complete {
                        self.report_description(&mut notices);
                        self.follow_ice(&mut notices);
                    }
                }
            }
            MediaEvent::LocalCandidateGathered(candidate) => {
                self.local_candidates.push(candidate);
            }
            MediaEvent::IceGatheringComplete => {
                self.gathering_complete = true;
                self.report_description(&mut notices);
                self.follow_ice(&mut notices);
            }
            MediaEvent::IceConnectionStateChanged(ice) => {
                tracing::debug!(?ice, "ICE connection state");
                self.ice = ice;
                self.follow_ice(&mut notices);
            }
            MediaEvent::RemoteStreamAdded { msid, kind } => {
                let user = msid
                    .as_deref()
                    .and_then(|m| self.remote_streams.get(m))
                    .or(self.remote_user.as_ref())
                    .cloned();
                match (kind, user) {
                    (MediaKind::Video, Some(user)) => notices.push(SessionNotice::RemoteVideo { user }),
                    (MediaKind::Video, None) => tracing::warn!(?msid, "Unattributed remote video"),
                    (MediaKind::Audio, _) => tracing::debug!(?msid, "Remote audio started"),
                }
            }
            MediaEvent::PipelineError(message) => {
                tracing::error!(%message, "Pipeline error");
                notices.push(SessionNotice::Failed(EndReason::MediaFailed(message)));
            }
            MediaEvent::EndOfStream => {
                tracing::error!("Pipeline reached end of stream");
                notices.push(SessionNotice::Failed(EndReason::MediaFailed(
                    "end of stream".to_string(),
                )));
            }
        }
        notices
    }

    fn report_description(&mut self, notices: &mut Vec<SessionNotice>) {
        if self.description_sent || self.state != SessionState::Initiated {
            return;
        }
        let Some(sdp) = self.local_sdp.clone() else {
            return;
        };
        let candidates = self.local_candidates.clone();
        self.description_sent = true;

        match self.role {
            Some(SessionRole::Offering) => {
                tracing::debug!(candidates = candidates.len(), "Offer created");
                notices.push(SessionNotice::OfferCreated { sdp, candidates });
                self.set_state(SessionState::OfferSent, notices);
            }
            Some(SessionRole::Answering) => {
                tracing::debug!(candidates = candidates.len(), "Answer created");
                notices.push(SessionNotice::AnswerCreated { sdp, candidates });
                self.set_state(SessionState::AnswerSent, notices);
            }
            None => {}
        }
    }

    fn follow_ice(&mut self, notices: &mut Vec<SessionNotice>) {
        match self.ice {
            IceConnectionState::Checking => {
                if matches!(self.state, SessionState::OfferSent | SessionState::AnswerSent) {
                    self.set_state(SessionState::Connecting, notices);
                }
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if matches!(self.state, SessionState::OfferSent | SessionState::AnswerSent) {
                    self.set_state(SessionState::Connecting, notices);
                }
                if self.state == SessionState::Connecting {
                    self.set_state(SessionState::Connected, notices);
                }
            }
            IceConnectionState::Failed => {
                if self.state != SessionState::IceFailed {
                    tracing::warn!(session = %self.id, "ICE failed");
                    self.set_state(SessionState::IceFailed, notices);
                    notices.push(SessionNotice::Failed(EndReason::IceFailed));
                }
            }
            IceConnectionState::New | IceConnectionState::Disconnected | IceConnectionState::Closed => {}
        }
    }
}
