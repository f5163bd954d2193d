//! Matrix call core - VoIP call signaling and negotiation for Matrix clients
//!
//! This library implements the signaling side of 1:1 Matrix voice and video
//! calls. It features:
//!
//! - **Wire Codec**: Encoding and decoding of `m.call.*` room events, including
//!   stream id rewriting for SDP produced by media engines
//! - **Call Arbitration**: A single manager that filters foreign calls, echoes
//!   and stale invites, and handles multi-device answering
//! - **Session State Machine**: Offer/answer negotiation, candidate buffering
//!   and mid-call renegotiation over a pluggable media engine
//! - **TURN Caching**: Homeserver TURN credentials reused until they expire
//!
//! Media itself is out of scope: plug a pipeline in through
//! [`MediaEngineFactory`] and a Matrix client through [`SignalingTransport`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use matrix_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let alice = UserId::parse("@alice:example.org")?;
//! let bob = UserId::parse("@bob:example.org")?;
//! let room = MemoryRoom::new(RoomId::parse("!call:example.org")?);
//! let transport = Arc::new(MemoryTransport::new(alice.clone(), room.clone()));
//!
//! let (service, handle) =
//!     CallService::builder(transport, Arc::new(ScriptedEngineFactory::default())).build()?;
//! service.spawn(futures::stream::pending());
//!
//! let context = RoomContext::new(room.room_id().clone(), alice.clone(), vec![alice, bob]);
//! let _call_id = handle.start_call(context).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Matrix identifiers and sender classification
pub mod identity;

/// SDP inspection
pub mod sdp;

/// `m.call.*` event codec
pub mod codec;

/// Media engine seam
pub mod media;

/// Capture device inventory
pub mod devices;

/// TURN credential cache
pub mod turn;

/// Call participants
pub mod participants;

/// Per-call negotiation state machine
pub mod session;

/// Call management and state
pub mod call;

/// Signaling transport and handlers
pub mod signaling;

/// Call service and configuration
pub mod service;

// Re-export main types at crate root
pub use call::{CallEffect, CallError, CallManager, CallManagerConfig};
pub use codec::{
    decode, mangle_stream_ids, MangledSdp, OutgoingSignal, Signal, SignalEncoder, SignalError, SignalKind,
    SignalMessage,
};
pub use devices::{AudioDevice, CallDevices, DeviceChange, VideoCaps, VideoDevice};
pub use identity::{EventId, IdentifierError, LocalDevice, PartyId, RoomId, SenderOrigin, UserId};
pub use media::{
    EngineScript, IceConnectionState, MediaEngine, MediaEngineFactory, MediaError, MediaEvent, MediaEventSender,
    PipelineConfig, ScriptedEngineFactory, ScriptedMediaEngine, SessionId,
};
pub use participants::{CallParticipant, CallParticipants};
pub use service::{CallService, CallServiceBuilder, CallServiceConfig, CallServiceHandle, CallSnapshot, ServiceError};
pub use session::{CallSession, SessionError, SessionNotice, SessionRole};
pub use signaling::{MemoryRoom, MemoryTransport, SignalingError, SignalingHandler, SignalingTransport};
pub use turn::{TurnCache, TurnServers};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerConfig};
    pub use crate::identity::{PartyId, RoomId, UserId};
    pub use crate::media::{MediaEngine, MediaEngineFactory, MediaEvent, ScriptedEngineFactory};
    pub use crate::service::{CallService, CallServiceBuilder, CallServiceConfig, CallServiceHandle};
    pub use crate::signaling::{MemoryRoom, MemoryTransport, SignalingHandler, SignalingTransport};
    pub use crate::types::{
        CallEvent, CallId, Candidate, EndReason, GlobalState, RoomContext, RoomEvent, SessionState,
    };
}
