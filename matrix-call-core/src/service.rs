//! Call service orchestration
//!
//! [`CallService`] owns a [`CallManager`] on a single task and connects it to
//! the outside world: room events come in as a stream, engine callbacks come
//! in on the manager's media channel, and effects go out through the
//! [`SignalingHandler`]. Applications talk to the running service through a
//! cloneable [`CallServiceHandle`].

use crate::call::{CallEffect, CallError, CallManager, CallManagerConfig};
use crate::codec::OutgoingSignal;
use crate::devices::CallDevices;
use crate::identity::{RoomId, UserId};
use crate::media::{MediaEngineFactory, MediaEvent, SessionId};
use crate::participants::CallParticipant;
use crate::signaling::{SignalingHandler, SignalingTransport};
use crate::turn::TurnServers;
use crate::types::{CallEvent, CallId, GlobalState, RoomContext, RoomEvent, SessionState};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// The service task is gone
    #[error("Call service stopped")]
    Stopped,

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Call service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallServiceConfig {
    /// Call manager config
    pub manager: CallManagerConfig,
    /// Capacity of the call event channel
    pub event_channel_capacity: usize,
    /// Capacity of the command channel
    pub command_channel_capacity: usize,
}

impl Default for CallServiceConfig {
    fn default() -> Self {
        Self {
            manager: CallManagerConfig::default(),
            event_channel_capacity: 1000,
            command_channel_capacity: 64,
        }
    }
}

/// Point-in-time view of the call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    /// Global call state
    pub state: GlobalState,
    /// Current call
    pub call_id: Option<CallId>,
    /// Room of the current call
    pub room_id: Option<RoomId>,
    /// Other user
    pub remote_user: Option<UserId>,
    /// Negotiation state
    pub session_state: SessionState,
    /// Microphone muted
    pub muted: bool,
    /// People in the call
    pub participants: Vec<CallParticipant>,
}

impl CallSnapshot {
    fn of(manager: &CallManager) -> Self {
        Self {
            state: manager.state(),
            call_id: manager.call_id().cloned(),
            room_id: manager.room_id().cloned(),
            remote_user: manager.remote_user().cloned(),
            session_state: manager.session_state(),
            muted: manager.muted(),
            participants: manager.participants().iter().cloned().collect(),
        }
    }
}

enum Command {
    StartCall {
        room: RoomContext,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    AcceptCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangupCall {
        reply: oneshot::Sender<()>,
    },
    IgnoreCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Shutdown,
}

enum Internal {
    TurnRefreshed(Result<TurnServers, String>),
    InviteExpired(CallId),
}

/// Handle to a running [`CallService`]
#[derive(Clone)]
pub struct CallServiceHandle {
    commands: mpsc::Sender<Command>,
    event_sender: broadcast::Sender<CallEvent>,
    devices: CallDevices,
}

impl std::fmt::Debug for CallServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallServiceHandle")
            .field("closed", &self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

impl CallServiceHandle {
    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Start a call in a 1:1 room
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be started or the service stopped
    #[tracing::instrument(skip(self, room), fields(room = %room.room_id))]
    pub async fn start_call(&self, room: RoomContext) -> Result<CallId, ServiceError> {
        let call_id = self.request(|reply| Command::StartCall { room, reply }).await??;
        tracing::info!(call_id = %call_id, "Call initiated");
        Ok(call_id)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing or the service stopped
    pub async fn accept_call(&self) -> Result<(), ServiceError> {
        Ok(self.request(|reply| Command::AcceptCall { reply }).await??)
    }

    /// Hang up; does nothing without a call
    ///
    /// # Errors
    ///
    /// Returns error if the service stopped
    pub async fn hangup_call(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::HangupCall { reply }).await
    }

    /// Silence the ringing call without telling the caller
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing or the service stopped
    pub async fn ignore_call(&self) -> Result<(), ServiceError> {
        Ok(self.request(|reply| Command::IgnoreCall { reply }).await??)
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if there is no session or the service stopped
    pub async fn set_muted(&self, muted: bool) -> Result<(), ServiceError> {
        Ok(self.request(|reply| Command::SetMuted { muted, reply }).await??)
    }

    /// Toggle the camera; returns whether it is now on
    ///
    /// # Errors
    ///
    /// Returns error if there is no session or the service stopped
    pub async fn toggle_camera(&self) -> Result<bool, ServiceError> {
        Ok(self.request(|reply| Command::ToggleCamera { reply }).await??)
    }

    /// Current call state
    ///
    /// # Errors
    ///
    /// Returns error if the service stopped
    pub async fn snapshot(&self) -> Result<CallSnapshot, ServiceError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the service task
    pub async fn shutdown(&self) {
        // Already stopped is fine
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Subscribe to call events as a stream
    #[must_use]
    pub fn event_stream(&self) -> BroadcastStream<CallEvent> {
        BroadcastStream::new(self.event_sender.subscribe())
    }

    /// Shared device inventory
    #[must_use]
    pub fn devices(&self) -> &CallDevices {
        &self.devices
    }
}

/// Call service
pub struct CallService<T: SignalingTransport + 'static> {
    manager: CallManager,
    media_rx: mpsc::UnboundedReceiver<(SessionId, MediaEvent)>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    signaling: SignalingHandler<T>,
    outbound: Option<mpsc::UnboundedSender<(RoomId, OutgoingSignal)>>,
    dispatcher: Option<JoinHandle<()>>,
    invite_timer: Option<JoinHandle<()>>,
}

impl<T: SignalingTransport + 'static> CallService<T> {
    /// Create a builder
    #[must_use]
    pub fn builder(transport: Arc<T>, factory: Arc<dyn MediaEngineFactory>) -> CallServiceBuilder<T> {
        CallServiceBuilder::new(transport, factory)
    }

    /// Run the service on its own task
    pub fn spawn<S>(self, room_events: S) -> JoinHandle<()>
    where
        S: Stream<Item = (RoomContext, RoomEvent)> + Send + Unpin + 'static,
    {
        tokio::spawn(self.run(room_events))
    }

    /// Run until shut down or every handle is dropped
    #[tracing::instrument(skip_all)]
    pub async fn run<S>(mut self, mut room_events: S)
    where
        S: Stream<Item = (RoomContext, RoomEvent)> + Send + Unpin,
    {
        tracing::info!("Call service started");
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                Some((session, event)) = self.media_rx.recv() => {
                    self.manager.handle_media_event(session, event);
                }
                Some(internal) = self.internal_rx.recv() => match internal {
                    Internal::TurnRefreshed(result) => self.manager.handle_turn_refreshed(result),
                    Internal::InviteExpired(call_id) => self.manager.handle_invite_expired(&call_id),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                item = room_events.next(), if events_open => match item {
                    Some((room, event)) => self.manager.handle_room_event(&room, &event),
                    None => {
                        tracing::debug!("Room event stream ended");
                        events_open = false;
                    }
                },
            }
            self.drain_effects();
        }

        self.shutdown().await;
        tracing::info!("Call service stopped");
    }

    fn handle_command(&mut self, command: Command) {
        // A caller that stopped waiting is fine
        match command {
            Command::StartCall { room, reply } => {
                let _ = reply.send(self.manager.start_call(&room));
            }
            Command::AcceptCall { reply } => {
                let _ = reply.send(self.manager.accept_call());
            }
            Command::HangupCall { reply } => {
                self.manager.hangup_call();
                let _ = reply.send(());
            }
            Command::IgnoreCall { reply } => {
                let _ = reply.send(self.manager.ignore_call());
            }
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.manager.set_muted(muted));
            }
            Command::ToggleCamera { reply } => {
                let _ = reply.send(self.manager.toggle_camera());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(CallSnapshot::of(&self.manager));
            }
            Command::Shutdown => {}
        }
    }

    fn drain_effects(&mut self) {
        while let Some(effect) = self.manager.poll_effect() {
            match effect {
                CallEffect::Send { room_id, signal } => self.dispatch(room_id, signal),
                CallEffect::RefreshTurn => self.refresh_turn(),
                CallEffect::ArmInviteTimer { call_id, lifetime } => {
                    self.cancel_invite_timer();
                    let internal = self.internal_tx.clone();
                    self.invite_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(lifetime).await;
                        let _ = internal.send(Internal::InviteExpired(call_id));
                    }));
                }
                CallEffect::CancelInviteTimer => self.cancel_invite_timer(),
            }
        }
    }

    fn cancel_invite_timer(&mut self) {
        if let Some(timer) = self.invite_timer.take() {
            timer.abort();
        }
    }

    fn dispatch(&mut self, room_id: RoomId, signal: OutgoingSignal) {
        if self.outbound.is_none() {
            let (tx, mut rx) = mpsc::unbounded_channel::<(RoomId, OutgoingSignal)>();
            let signaling = self.signaling.clone();
            // One task sends everything so events reach the room in order
            self.dispatcher = Some(tokio::spawn(async move {
                while let Some((room_id, signal)) = rx.recv().await {
                    let event_type = signal.event_type();
                    if let Err(e) = signaling.send_signal(&room_id, signal).await {
                        tracing::error!(error = %e, event_type, room = %room_id, "Failed to send call event");
                    }
                }
            }));
            self.outbound = Some(tx);
        }
        let sent = self
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send((room_id, signal)).is_ok());
        if !sent {
            tracing::warn!("Signal dispatcher stopped, dropping call event");
        }
    }

    fn refresh_turn(&self) {
        let signaling = self.signaling.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = signaling
                .fetch_turn_servers()
                .await
                .map_err(|e| e.to_string());
            let _ = internal.send(Internal::TurnRefreshed(result));
        });
    }

    async fn shutdown(&mut self) {
        self.manager.hangup_call();
        self.drain_effects();
        self.cancel_invite_timer();
        // Closing the queue lets the dispatcher finish what is already queued
        self.outbound = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                tracing::warn!(error = %e, "Signal dispatcher ended abnormally");
            }
        }
    }
}

/// Call service builder
pub struct CallServiceBuilder<T: SignalingTransport + 'static> {
    transport: Arc<T>,
    factory: Arc<dyn MediaEngineFactory>,
    devices: CallDevices,
    config: CallServiceConfig,
}

impl<T: SignalingTransport + 'static> CallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<T>, factory: Arc<dyn MediaEngineFactory>) -> Self {
        Self {
            transport,
            factory,
            devices: CallDevices::new(),
            config: CallServiceConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a shared device inventory
    #[must_use]
    pub fn with_devices(mut self, devices: CallDevices) -> Self {
        self.devices = devices;
        self
    }

    /// Build the service and a handle to it
    ///
    /// # Errors
    ///
    /// Returns error if a channel capacity is zero
    pub fn build(self) -> Result<(CallService<T>, CallServiceHandle), ServiceError> {
        if self.config.event_channel_capacity == 0 || self.config.command_channel_capacity == 0 {
            return Err(ServiceError::InitError("channel capacity must be positive".to_string()));
        }

        let (manager, media_rx) = CallManager::new(self.config.manager, self.factory, self.devices.clone());
        let manager = manager.with_event_capacity(self.config.event_channel_capacity);
        let (commands_tx, commands) = mpsc::channel(self.config.command_channel_capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let handle = CallServiceHandle {
            commands: commands_tx,
            event_sender: manager.event_sender(),
            devices: self.devices,
        };
        let service = CallService {
            manager,
            media_rx,
            commands,
            internal_tx,
            internal_rx,
            signaling: SignalingHandler::new(self.transport),
            outbound: None,
            dispatcher: None,
            invite_timer: None,
        };
        Ok((service, handle))
    }
}
