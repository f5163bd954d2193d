//! Media engine seam
//!
//! The signaling core never touches audio or video itself. It drives a
//! [`MediaEngine`] (one per call session) and receives the engine's
//! asynchronous notifications as [`MediaEvent`]s tagged with the session
//! they belong to.
//!
//! # Architecture
//!
//! - [`MediaEngineFactory`] creates engines and reports missing capabilities
//! - [`MediaEngine`] builds the pipeline and produces local descriptions
//! - [`MediaEventSender`] carries engine callbacks back to the call manager
//!
//! [`ScriptedMediaEngine`] is a deterministic engine that answers every
//! request immediately with canned descriptions. It is used for loopback
//! simulation and tests.

use crate::types::{Candidate, MediaKind, SdpType};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Pipeline could not be built or started
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Remote description was rejected
    #[error("Invalid remote description: {0}")]
    InvalidDescription(String),

    /// Engine not running
    #[error("Pipeline not running")]
    NotRunning,
}

/// Identifies one call session's engine; callbacks from older sessions are dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Allocate the next session id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// ICE connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceConnectionState {
    /// Gathering has not started
    New,
    /// Checking candidate pairs
    Checking,
    /// A pair works
    Connected,
    /// All checks finished
    Completed,
    /// No pair works
    Failed,
    /// Connectivity lost
    Disconnected,
    /// Agent shut down
    Closed,
}

/// Notification from a media engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// The engine wants a (re)negotiation
    NegotiationNeeded,
    /// A local offer or answer was created and applied
    LocalDescriptionReady {
        /// SDP body
        sdp: String,
        /// Offer or answer
        kind: SdpType,
    },
    /// A local candidate was gathered
    LocalCandidateGathered(Candidate),
    /// Candidate gathering finished
    IceGatheringComplete,
    /// ICE connection state changed
    IceConnectionStateChanged(IceConnectionState),
    /// A remote stream started flowing
    RemoteStreamAdded {
        /// Remote stream id, if the engine knows it
        msid: Option<String>,
        /// Media kind
        kind: MediaKind,
    },
    /// The pipeline failed
    PipelineError(String),
    /// The pipeline ran out of data
    EndOfStream,
}

/// Sender handed to an engine for posting its callbacks
#[derive(Debug, Clone)]
pub struct MediaEventSender {
    session: SessionId,
    tx: mpsc::UnboundedSender<(SessionId, MediaEvent)>,
}

impl MediaEventSender {
    /// Create a sender for one session
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<(SessionId, MediaEvent)>) -> Self {
        Self { session, tx }
    }

    /// Session this sender posts for
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Post an event; a closed receiver means the call is gone and the event is dropped
    pub fn send(&self, event: MediaEvent) {
        if self.tx.send((self.session, event)).is_err() {
            tracing::trace!(session = %self.session, "Media event receiver closed");
        }
    }
}

/// Pipeline settings for one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Formatted TURN URIs, empty for none
    pub turn_uris: Vec<String>,
    /// Microphone to capture from
    pub audio_device: Option<String>,
    /// Camera to capture from, `None` for an audio-only call
    pub video_device: Option<String>,
}

/// One call's media pipeline
///
/// Methods must return promptly. Results that take time (local
/// descriptions, candidates, ICE progress) are posted through the
/// [`MediaEventSender`] the engine was created with.
pub trait MediaEngine: Send {
    /// Build and start the pipeline
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline cannot be built
    fn build_pipeline(&mut self, config: &PipelineConfig) -> Result<(), MediaError>;

    /// Ask for a local offer
    fn request_offer(&mut self);

    /// Ask for a local answer to the applied remote offer
    fn request_answer(&mut self);

    /// Apply a remote offer or answer
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    fn apply_remote_description(&mut self, sdp: &str, kind: SdpType) -> Result<(), MediaError>;

    /// Add remote candidates
    fn add_candidates(&mut self, candidates: &[Candidate]);

    /// Tear the pipeline down
    fn end(&mut self);

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline is not running
    fn set_muted(&mut self, muted: bool) -> Result<(), MediaError>;

    /// Whether the microphone is muted
    fn muted(&self) -> bool;

    /// Toggle the local camera; returns whether it is now on
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline is not running
    fn toggle_camera(&mut self) -> Result<bool, MediaError>;
}

/// Creates media engines
pub trait MediaEngineFactory: Send + Sync {
    /// Create an engine posting its events through `events`
    fn create(&self, events: MediaEventSender) -> Box<dyn MediaEngine>;

    /// Capabilities the host is missing for calls, empty when calls are possible
    fn missing_capabilities(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Canned descriptions a [`ScriptedMediaEngine`] hands out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineScript {
    /// Local offer
    pub offer: String,
    /// Local answer
    pub answer: String,
    /// Local candidates gathered after each description
    pub candidates: Vec<Candidate>,
    /// Whether applying a remote description drives ICE to connected
    pub connects: bool,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            offer: scripted_sdp("sendrecv"),
            answer: scripted_sdp("sendrecv"),
            candidates: vec![Candidate::new(
                "candidate:1 1 UDP 2122260223 192.0.2.10 50000 typ host",
                0,
                "0",
            )],
            connects: true,
        }
    }
}

fn scripted_sdp(direction: &str) -> String {
    format!(
        "v=0\r\n\
o=- 1 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=rtpmap:111 OPUS/48000/2\r\n\
a=msid:user1@host-1a2b webrtctransceiver0\r\n\
a=ssrc:1001 msid:user1@host-1a2b webrtctransceiver0\r\n\
a={direction}\r\n"
    )
}

/// Deterministic engine that completes every step immediately
pub struct ScriptedMediaEngine {
    script: EngineScript,
    events: MediaEventSender,
    running: bool,
    muted: bool,
    camera: bool,
    remote_candidates: Vec<Candidate>,
}

impl ScriptedMediaEngine {
    /// Create a new scripted engine
    pub fn new(script: EngineScript, events: MediaEventSender) -> Self {
        Self {
            script,
            events,
            running: false,
            muted: false,
            camera: false,
            remote_candidates: Vec::new(),
        }
    }

    /// Remote candidates added so far
    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    fn describe(&self, sdp: String, kind: SdpType) {
        self.events.send(MediaEvent::LocalDescriptionReady { sdp, kind });
        for candidate in &self.script.candidates {
            self.events
                .send(MediaEvent::LocalCandidateGathered(candidate.clone()));
        }
        self.events.send(MediaEvent::IceGatheringComplete);
    }
}

impl MediaEngine for ScriptedMediaEngine {
    fn build_pipeline(&mut self, config: &PipelineConfig) -> Result<(), MediaError> {
        tracing::debug!(turn = config.turn_uris.len(), "Building scripted pipeline");
        self.running = true;
        self.camera = config.video_device.is_some();
        self.events.send(MediaEvent::NegotiationNeeded);
        Ok(())
    }

    fn request_offer(&mut self) {
        if self.running {
            self.describe(self.script.offer.clone(), SdpType::Offer);
        }
    }

    fn request_answer(&mut self) {
        if self.running {
            self.describe(self.script.answer.clone(), SdpType::Answer);
        }
    }

    fn apply_remote_description(&mut self, sdp: &str, _kind: SdpType) -> Result<(), MediaError> {
        if !self.running {
            return Err(MediaError::NotRunning);
        }
        if sdp.trim().is_empty() {
            return Err(MediaError::InvalidDescription("empty sdp".to_string()));
        }
        if self.script.connects {
            self.events.send(MediaEvent::IceConnectionStateChanged(
                IceConnectionState::Checking,
            ));
            self.events.send(MediaEvent::IceConnectionStateChanged(
                IceConnectionState::Connected,
            ));
        }
        Ok(())
    }

    fn add_candidates(&mut self, candidates: &[Candidate]) {
        self.remote_candidates.extend_from_slice(candidates);
    }

    fn end(&mut self) {
        self.running = false;
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), MediaError> {
        if !self.running {
            return Err(MediaError::NotRunning);
        }
        self.muted = muted;
        Ok(())
    }

    fn muted(&self) -> bool {
        self.muted
    }

    fn toggle_camera(&mut self) -> Result<bool, MediaError> {
        if !self.running {
            return Err(MediaError::NotRunning);
        }
        self.camera = !self.camera;
        Ok(self.camera)
    }
}

/// Factory for [`ScriptedMediaEngine`]s
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngineFactory {
    script: EngineScript,
    missing: Vec<String>,
}

impl ScriptedEngineFactory {
    /// Create a factory handing out engines that follow `script`
    pub fn new(script: EngineScript) -> Self {
        Self {
            script,
            missing: Vec::new(),
        }
    }

    /// Report these capabilities as missing
    #[must_use]
    pub fn with_missing(mut self, missing: Vec<String>) -> Self {
        self.missing = missing;
        self
    }
}

impl MediaEngineFactory for ScriptedEngineFactory {
    fn create(&self, events: MediaEventSender) -> Box<dyn MediaEngine> {
        Box::new(ScriptedMediaEngine::new(self.script.clone(), events))
    }

    fn missing_capabilities(&self) -> Vec<String> {
        self.missing.clone()
    }
}
