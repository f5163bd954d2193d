//! Shared helpers for call flow tests

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use matrix_call_core::{
    AudioDevice, CallDevices, CallEffect, CallEvent, CallManager, CallManagerConfig, Candidate, EngineScript,
    EventId, MediaEngine, MediaEngineFactory, MediaError, MediaEvent, MediaEventSender, OutgoingSignal,
    PipelineConfig, RoomContext, RoomEvent, RoomId, ScriptedMediaEngine, SdpType, SessionId, SignalKind,
    TurnServers, UserId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub const ROOM: &str = "!call:example.org";
pub const ALICE: &str = "@alice:example.org";
pub const BOB: &str = "@bob:example.org";

/// Route engine logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn user(s: &str) -> UserId {
    UserId::parse(s).unwrap()
}

pub fn room_id() -> RoomId {
    RoomId::parse(ROOM).unwrap()
}

pub fn room(local: &str, members: &[&str]) -> RoomContext {
    RoomContext::new(room_id(), user(local), members.iter().map(|m| user(m)).collect())
}

pub fn turn_servers() -> TurnServers {
    TurnServers {
        username: "user".to_string(),
        password: "secret".to_string(),
        uris: vec!["turn:turn.example.org:3478?transport=udp".to_string()],
        ttl: 86_400,
    }
}

pub fn candidate(n: u32) -> Candidate {
    Candidate::new(format!("candidate:{n} 1 UDP 2122260223 192.0.2.{n} 5000{n} typ host"), 0, "0")
}

/// What the engine was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Build,
    RequestOffer,
    RequestAnswer,
    ApplyRemote(SdpType),
    AddCandidates(Vec<Candidate>),
    End,
    SetMuted(bool),
}

/// Calls made on every engine a factory created, plus a way to inject callbacks
#[derive(Clone, Default)]
pub struct EngineLog {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    senders: Arc<Mutex<Vec<MediaEventSender>>>,
}

impl EngineLog {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn engines(&self) -> usize {
        self.senders.lock().len()
    }

    /// Post a callback as the most recently created engine
    pub fn inject(&self, event: MediaEvent) {
        if let Some(sender) = self.senders.lock().last() {
            sender.send(event);
        }
    }

    /// Post a callback as the engine created `index`-th
    pub fn inject_into(&self, index: usize, event: MediaEvent) {
        if let Some(sender) = self.senders.lock().get(index) {
            sender.send(event);
        }
    }
}

struct RecordingEngine {
    inner: ScriptedMediaEngine,
    log: EngineLog,
}

impl RecordingEngine {
    fn record(&self, call: EngineCall) {
        self.log.calls.lock().push(call);
    }
}

impl MediaEngine for RecordingEngine {
    fn build_pipeline(&mut self, config: &PipelineConfig) -> Result<(), MediaError> {
        self.record(EngineCall::Build);
        self.inner.build_pipeline(config)
    }

    fn request_offer(&mut self) {
        self.record(EngineCall::RequestOffer);
        self.inner.request_offer();
    }

    fn request_answer(&mut self) {
        self.record(EngineCall::RequestAnswer);
        self.inner.request_answer();
    }

    fn apply_remote_description(&mut self, sdp: &str, kind: SdpType) -> Result<(), MediaError> {
        self.record(EngineCall::ApplyRemote(kind));
        self.inner.apply_remote_description(sdp, kind)
    }

    fn add_candidates(&mut self, candidates: &[Candidate]) {
        self.record(EngineCall::AddCandidates(candidates.to_vec()));
        self.inner.add_candidates(candidates);
    }

    fn end(&mut self) {
        self.record(EngineCall::End);
        self.inner.end();
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), MediaError> {
        self.record(EngineCall::SetMuted(muted));
        self.inner.set_muted(muted)
    }

    fn muted(&self) -> bool {
        self.inner.muted()
    }

    fn toggle_camera(&mut self) -> Result<bool, MediaError> {
        self.inner.toggle_camera()
    }
}

/// Factory handing out scripted engines that record their calls
pub struct RecordingFactory {
    script: EngineScript,
    log: EngineLog,
    missing: Vec<String>,
}

impl RecordingFactory {
    pub fn new(script: EngineScript) -> (Self, EngineLog) {
        let log = EngineLog::default();
        let factory = Self {
            script,
            log: log.clone(),
            missing: Vec::new(),
        };
        (factory, log)
    }

    pub fn with_missing(mut self, missing: Vec<String>) -> Self {
        self.missing = missing;
        self
    }
}

impl MediaEngineFactory for RecordingFactory {
    fn create(&self, events: MediaEventSender) -> Box<dyn MediaEngine> {
        self.log.senders.lock().push(events.clone());
        Box::new(RecordingEngine {
            inner: ScriptedMediaEngine::new(self.script.clone(), events),
            log: self.log.clone(),
        })
    }

    fn missing_capabilities(&self) -> Vec<String> {
        self.missing.clone()
    }
}

pub fn microphone() -> CallDevices {
    CallDevices::with_devices(
        vec![AudioDevice {
            id: "mic-0".to_string(),
            name: "Built-in Microphone".to_string(),
        }],
        Vec::new(),
    )
}

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

/// Wrap content as a room event sent `age` ago
pub fn raw_event_aged(sender: &UserId, event_type: &str, content: serde_json::Value, age: ChronoDuration) -> RoomEvent {
    RoomEvent {
        event_id: EventId::new(format!("$ev{}", NEXT_EVENT.fetch_add(1, Ordering::Relaxed))),
        event_type: event_type.to_string(),
        sender: sender.clone(),
        origin_server_ts: Utc::now() - age,
        content,
    }
}

pub fn raw_event(sender: &UserId, event_type: &str, content: serde_json::Value) -> RoomEvent {
    raw_event_aged(sender, event_type, content, ChronoDuration::zero())
}

pub fn event_from(sender: &UserId, signal: &OutgoingSignal) -> RoomEvent {
    raw_event(sender, signal.event_type(), signal.content.clone())
}

/// One logged-in device driving a [`CallManager`] by hand
pub struct Device {
    pub user: UserId,
    pub room: RoomContext,
    pub manager: CallManager,
    pub log: EngineLog,
    media_rx: mpsc::UnboundedReceiver<(SessionId, MediaEvent)>,
    events: broadcast::Receiver<CallEvent>,
    sent: Vec<OutgoingSignal>,
    effects: Vec<CallEffect>,
}

impl Device {
    /// Device in a 1:1 room between alice and bob, with TURN already cached
    pub fn new(local: &str) -> Self {
        let mut device = Self::cold(local, &[ALICE, BOB], EngineScript::default());
        device.manager.handle_turn_refreshed(Ok(turn_servers()));
        device.pump();
        device
    }

    /// Device whose TURN cache is empty
    pub fn cold(local: &str, members: &[&str], script: EngineScript) -> Self {
        init_tracing();
        let (factory, log) = RecordingFactory::new(script);
        Self::with_factory(local, members, factory, log, microphone())
    }

    pub fn with_factory(
        local: &str,
        members: &[&str],
        factory: RecordingFactory,
        log: EngineLog,
        devices: CallDevices,
    ) -> Self {
        let (manager, media_rx) = CallManager::new(CallManagerConfig::default(), Arc::new(factory), devices);
        let events = manager.subscribe_events();
        Self {
            user: user(local),
            room: room(local, members),
            manager,
            log,
            media_rx,
            events,
            sent: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Feed queued engine callbacks and collect effects until nothing is left
    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok((session, event)) = self.media_rx.try_recv() {
                self.manager.handle_media_event(session, event);
                progressed = true;
            }
            while let Some(effect) = self.manager.poll_effect() {
                match effect {
                    CallEffect::Send { signal, .. } => self.sent.push(signal),
                    other => self.effects.push(other),
                }
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Signals sent since the last call
    pub fn take_sent(&mut self) -> Vec<OutgoingSignal> {
        self.pump();
        std::mem::take(&mut self.sent)
    }

    /// Non-send effects since the last call
    pub fn take_effects(&mut self) -> Vec<CallEffect> {
        self.pump();
        std::mem::take(&mut self.effects)
    }

    /// Call events since the last call
    pub fn take_events(&mut self) -> Vec<CallEvent> {
        self.pump();
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn receive(&mut self, event: &RoomEvent) {
        let room = self.room.clone();
        self.manager.handle_room_event(&room, event);
        self.pump();
    }

    /// Receive a signal another device sent as `sender`
    pub fn deliver(&mut self, sender: &UserId, signal: &OutgoingSignal) {
        self.receive(&event_from(sender, signal));
    }

    pub fn deliver_all(&mut self, sender: &UserId, signals: &[OutgoingSignal]) {
        for signal in signals {
            self.deliver(sender, signal);
        }
    }
}

pub fn kinds(signals: &[OutgoingSignal]) -> Vec<SignalKind> {
    signals.iter().map(|s| s.kind).collect()
}

pub fn ended_count(events: &[CallEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CallEvent::CallEnded { .. }))
        .count()
}

/// Run a full call from alice to bob and return both devices, Active
pub fn connected_pair() -> (Device, Device) {
    let mut alice = Device::new(ALICE);
    let mut bob = Device::new(BOB);

    alice.manager.start_call(&alice.room.clone()).unwrap();
    let offer = alice.take_sent();
    bob.deliver_all(&user(ALICE), &offer);
    bob.manager.accept_call().unwrap();
    let answer = bob.take_sent();
    alice.deliver_all(&user(BOB), &answer);

    alice.take_events();
    bob.take_events();
    alice.take_effects();
    bob.take_effects();
    (alice, bob)
}
