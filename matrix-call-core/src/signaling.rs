//! Matrix signaling transport
//!
//! Outgoing call events and TURN credential requests go through a
//! [`SignalingTransport`]. Incoming room events are pushed into the call
//! service as a stream and never pass through here.

use crate::codec::OutgoingSignal;
use crate::identity::{EventId, RoomId, UserId};
use crate::turn::TurnServers;
use crate::types::RoomEvent;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Homeserver did not provide TURN credentials
    #[error("TURN servers unavailable: {0}")]
    TurnUnavailable(String),
}

/// Signaling transport trait
///
/// Implement this for your Matrix client. `send_event` must deliver events
/// for one room in the order they are sent.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a room event
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<EventId, Self::Error>;

    /// Ask the homeserver for TURN credentials
    async fn fetch_turn_servers(&self) -> Result<TurnServers, Self::Error>;
}

/// Signaling handler with send error backoff
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    error_count: Arc<tokio::sync::Mutex<u32>>,
}

impl<T: SignalingTransport> Clone for SignalingHandler<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            error_count: Arc::clone(&self.error_count),
        }
    }
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            error_count: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    /// Send an encoded call event into a room
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, signal), fields(room = %room_id, event_type = signal.event_type()))]
    pub async fn send_signal(&self, room_id: &RoomId, signal: OutgoingSignal) -> Result<EventId, T::Error> {
        tracing::debug!("Sending call event");
        match self
            .transport
            .send_event(room_id, signal.event_type(), signal.content)
            .await
        {
            Ok(event_id) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(event_id = %event_id, "Call event sent");
                Ok(event_id)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error = %e,
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    "Error sending call event, backing off"
                );
                sleep(backoff_duration).await;
                Err(e)
            }
        }
    }

    /// Fetch TURN credentials
    ///
    /// # Errors
    ///
    /// Returns error if the homeserver request fails
    #[tracing::instrument(skip(self))]
    pub async fn fetch_turn_servers(&self) -> Result<TurnServers, T::Error> {
        tracing::debug!("Fetching TURN servers");
        let servers = self.transport.fetch_turn_servers().await?;
        tracing::info!(uris = servers.uris.len(), ttl = servers.ttl, "TURN servers received");
        Ok(servers)
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

/// An in-process room that every [`MemoryTransport`] attached to it sees
#[derive(Debug, Clone)]
pub struct MemoryRoom {
    room_id: RoomId,
    timeline: broadcast::Sender<RoomEvent>,
    history: Arc<Mutex<Vec<RoomEvent>>>,
    next_event: Arc<AtomicU64>,
}

impl MemoryRoom {
    /// Create an empty room
    pub fn new(room_id: RoomId) -> Self {
        let (timeline, _) = broadcast::channel(256);
        Self {
            room_id,
            timeline,
            history: Arc::new(Mutex::new(Vec::new())),
            next_event: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Room id
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Receive events posted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.timeline.subscribe()
    }

    /// Every event posted so far
    pub fn history(&self) -> Vec<RoomEvent> {
        self.history.lock().clone()
    }

    /// Post an event as `sender`
    pub fn post(&self, sender: &UserId, event_type: &str, content: serde_json::Value) -> EventId {
        let event_id = EventId::new(format!("${}", self.next_event.fetch_add(1, Ordering::Relaxed)));
        let event = RoomEvent {
            event_id: event_id.clone(),
            event_type: event_type.to_string(),
            sender: sender.clone(),
            origin_server_ts: Utc::now(),
            content,
        };
        self.history.lock().push(event.clone());
        // No subscribers is fine, history keeps the event
        let _ = self.timeline.send(event);
        event_id
    }
}

/// Transport posting into [`MemoryRoom`]s as one user
#[derive(Debug)]
pub struct MemoryTransport {
    user: UserId,
    room: MemoryRoom,
    turn: Mutex<Option<TurnServers>>,
    turn_requests: AtomicU64,
}

impl MemoryTransport {
    /// Create a transport for `user` in `room`
    pub fn new(user: UserId, room: MemoryRoom) -> Self {
        Self {
            user,
            room,
            turn: Mutex::new(None),
            turn_requests: AtomicU64::new(0),
        }
    }

    /// Serve these TURN credentials
    #[must_use]
    pub fn with_turn(self, servers: TurnServers) -> Self {
        *self.turn.lock() = Some(servers);
        self
    }

    /// Number of TURN requests served so far
    pub fn turn_requests(&self) -> u64 {
        self.turn_requests.load(Ordering::Relaxed)
    }

    /// The room this transport posts to
    pub fn room(&self) -> &MemoryRoom {
        &self.room
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    type Error = SignalingError;

    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<EventId, SignalingError> {
        if room_id != self.room.room_id() {
            return Err(SignalingError::TransportError(format!("not joined to {room_id}")));
        }
        Ok(self.room.post(&self.user, event_type, content))
    }

    async fn fetch_turn_servers(&self) -> Result<TurnServers, SignalingError> {
        self.turn_requests.fetch_add(1, Ordering::Relaxed);
        self.turn
            .lock()
            .clone()
            .ok_or_else(|| SignalingError::TurnUnavailable("not configured".to_string()))
    }
}
