//! Matrix call CLI
//!
//! Developer tooling around the call engine: decode call events captured from
//! a homeserver, and run a loopback call between two simulated devices.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use matrix_call_core::prelude::*;
use matrix_call_core::{
    decode, AudioDevice, CallDevices, CallServiceHandle, Signal, SignalMessage, TurnServers,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON file with a call service configuration
    #[arg(short, long, env = "MATRIX_CALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode `m.call.*` room events from a JSON file (one event or an array)
    Decode {
        /// File with the events
        file: PathBuf,
    },

    /// Run a call between two simulated devices in one process
    Simulate {
        /// Leave the call ringing instead of answering it
        #[arg(long)]
        no_answer: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "1")]
        duration: u64,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Serialize)]
struct DecodedEvent {
    event_type: String,
    sender: String,
    call_id: String,
    party_id: Option<String>,
    summary: String,
}

impl DecodedEvent {
    fn from_signal(event_type: &str, signal: &Signal) -> Self {
        let summary = match &signal.message {
            SignalMessage::Invite(i) => format!("offer, lifetime {}ms", i.lifetime.as_millis()),
            SignalMessage::Candidates(c) => format!("{} candidate(s)", c.candidates.len()),
            SignalMessage::Answer(_) => "answer".to_string(),
            SignalMessage::Negotiate(n) => {
                if n.is_answer {
                    "renegotiation answer".to_string()
                } else {
                    "renegotiation offer".to_string()
                }
            }
            SignalMessage::Hangup(h) => match h.reason {
                Some(reason) => format!("hangup ({reason:?})"),
                None => "hangup".to_string(),
            },
        };
        Self {
            event_type: event_type.to_string(),
            sender: signal.sender.to_string(),
            call_id: signal.message.call_id().to_string(),
            party_id: signal.message.party_id().map(ToString::to_string),
            summary,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("matrix_call_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Decode { file } => handle_decode(&file)?,
        Commands::Simulate {
            no_answer,
            duration,
        } => handle_simulate(config, !no_answer, Duration::from_secs(duration)).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CallServiceConfig> {
    let Some(path) = path else {
        return Ok(CallServiceConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn handle_decode(file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("events are not JSON")?;
    let events: Vec<RoomEvent> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };

    let mut failures = 0;
    for event in &events {
        match decode(event) {
            Ok(signal) => {
                let decoded = DecodedEvent::from_signal(&event.event_type, &signal);
                println!("{}", serde_json::to_string(&decoded)?);
            }
            Err(e) => {
                failures += 1;
                eprintln!("❌ {}: {e}", event.event_id);
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} event(s) could not be decoded", events.len());
    }
    Ok(())
}

fn spawn_device(
    local: &UserId,
    members: &[UserId],
    room: &MemoryRoom,
    config: CallServiceConfig,
) -> Result<CallServiceHandle> {
    let transport = MemoryTransport::new(local.clone(), room.clone()).with_turn(TurnServers {
        username: "loopback".to_string(),
        password: "loopback".to_string(),
        uris: vec!["turn:turn.invalid:3478?transport=udp".to_string()],
        ttl: 3600,
    });
    let devices = CallDevices::with_devices(
        vec![AudioDevice {
            id: "loopback-mic".to_string(),
            name: "Loopback Microphone".to_string(),
        }],
        Vec::new(),
    );

    let (service, handle) = CallService::builder(Arc::new(transport), Arc::new(ScriptedEngineFactory::default()))
        .with_config(config)
        .with_devices(devices)
        .build()?;

    let context = RoomContext::new(room.room_id().clone(), local.clone(), members.to_vec());
    let mut timeline = room.subscribe();
    let (tx, rx) = futures::channel::mpsc::unbounded();
    tokio::spawn(async move {
        while let Ok(event) = timeline.recv().await {
            if tx.unbounded_send((context.clone(), event)).is_err() {
                break;
            }
        }
    });
    service.spawn(rx);
    Ok(handle)
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    timeout: Duration,
    pred: impl Fn(&CallEvent) -> bool,
) -> Result<CallEvent> {
    tokio::time::timeout(timeout, async {
        loop {
            let event = events.recv().await?;
            tracing::debug!(?event, "Call event");
            if pred(&event) {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    })
    .await
    .context("timed out waiting for call event")?
}

async fn handle_simulate(config: CallServiceConfig, answer: bool, duration: Duration) -> Result<()> {
    let alice = UserId::parse("@alice:loopback.invalid")?;
    let bob = UserId::parse("@bob:loopback.invalid")?;
    let members = vec![alice.clone(), bob.clone()];
    let room = MemoryRoom::new(RoomId::parse("!loopback:loopback.invalid")?);
    let lifetime = Duration::from_millis(config.manager.invite_lifetime_ms);

    let caller = spawn_device(&alice, &members, &room, config.clone())?;
    let callee = spawn_device(&bob, &members, &room, config)?;
    let mut caller_events = caller.subscribe_events();
    let mut callee_events = callee.subscribe_events();

    let context = RoomContext::new(room.room_id().clone(), alice.clone(), members.clone());
    let call_id = caller.start_call(context).await?;
    println!("📞 {alice} calling {bob} ({call_id})");

    wait_for(&mut callee_events, Duration::from_secs(5), |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await?;
    println!("🔔 {bob} is ringing");

    if answer {
        callee.accept_call().await?;
        wait_for(&mut caller_events, Duration::from_secs(5), |e| {
            e == &CallEvent::StateChanged(SessionState::Connected)
        })
        .await?;
        println!("✅ Connected, hanging up in {}s", duration.as_secs());
        tokio::time::sleep(duration).await;
        caller.hangup_call().await?;
    } else {
        println!("⏳ Not answering, waiting {}s for the invite to expire", lifetime.as_secs());
    }

    let ended = wait_for(&mut callee_events, lifetime + Duration::from_secs(5), |e| {
        matches!(e, CallEvent::CallEnded { .. })
    })
    .await?;
    if let CallEvent::CallEnded { reason, .. } = ended {
        println!("📴 Call ended on {bob}: {reason:?}");
    }

    caller.shutdown().await;
    callee.shutdown().await;

    println!();
    println!("Room timeline:");
    for event in room.history() {
        println!("  {} {:<18} {}", event.event_id, event.event_type, event.sender);
    }
    Ok(())
}
