//! Capture device inventory
//!
//! Keeps the list of microphones and cameras the platform reports, updated
//! from hot-plug notifications. The call manager consults it before starting
//! a call and when picking the devices a pipeline captures from.

use crate::types::MediaKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Audio device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// One capture mode of a camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCaps {
    /// Resolution, e.g. `1280x720`
    pub resolution: String,
    /// Frame rates offered at this resolution, e.g. `30/1`
    pub frame_rates: Vec<String>,
}

/// Video device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
    /// Capture modes
    #[serde(default)]
    pub caps: Vec<VideoCaps>,
}

/// Hot-plug notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    /// Microphone plugged in
    AudioAdded(AudioDevice),
    /// Camera plugged in
    VideoAdded(VideoDevice),
    /// Device with this id went away
    Removed(String),
}

#[derive(Debug, Default)]
struct Inventory {
    audio: Vec<AudioDevice>,
    video: Vec<VideoDevice>,
}

/// Shared device inventory
#[derive(Debug, Clone, Default)]
pub struct CallDevices {
    inner: Arc<RwLock<Inventory>>,
}

impl CallDevices {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inventory with initial devices
    pub fn with_devices(audio: Vec<AudioDevice>, video: Vec<VideoDevice>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inventory { audio, video })),
        }
    }

    /// Apply a hot-plug notification; returns whether anything changed
    #[tracing::instrument(skip(self))]
    pub fn apply(&self, change: DeviceChange) -> bool {
        let mut inv = self.inner.write();
        match change {
            DeviceChange::AudioAdded(device) => {
                inv.audio.retain(|d| d.id != device.id);
                inv.audio.push(device);
                true
            }
            DeviceChange::VideoAdded(device) => {
                inv.video.retain(|d| d.id != device.id);
                inv.video.push(device);
                true
            }
            DeviceChange::Removed(id) => {
                let before = inv.audio.len() + inv.video.len();
                inv.audio.retain(|d| d.id != id);
                inv.video.retain(|d| d.id != id);
                before != inv.audio.len() + inv.video.len()
            }
        }
    }

    /// Whether any microphone is present
    pub fn has_microphone(&self) -> bool {
        !self.inner.read().audio.is_empty()
    }

    /// Whether any camera is present
    pub fn has_camera(&self) -> bool {
        !self.inner.read().video.is_empty()
    }

    /// Device names of one kind, with `default` first when present
    pub fn names(&self, kind: MediaKind, default: Option<&str>) -> Vec<String> {
        let inv = self.inner.read();
        let mut names: Vec<String> = match kind {
            MediaKind::Audio => inv.audio.iter().map(|d| d.name.clone()).collect(),
            MediaKind::Video => inv.video.iter().map(|d| d.name.clone()).collect(),
        };
        if let Some(pos) = default.and_then(|d| names.iter().position(|n| n == d)) {
            let name = names.remove(pos);
            names.insert(0, name);
        }
        names
    }

    /// Resolutions a camera offers
    pub fn resolutions(&self, camera: &str) -> Vec<String> {
        self.inner
            .read()
            .video
            .iter()
            .find(|d| d.name == camera)
            .map(|d| d.caps.iter().map(|c| c.resolution.clone()).collect())
            .unwrap_or_default()
    }

    /// Frame rates a camera offers at one resolution
    pub fn frame_rates(&self, camera: &str, resolution: &str) -> Vec<String> {
        self.inner
            .read()
            .video
            .iter()
            .find(|d| d.name == camera)
            .and_then(|d| d.caps.iter().find(|c| c.resolution == resolution))
            .map(|c| c.frame_rates.clone())
            .unwrap_or_default()
    }

    /// Microphone to capture from: the preferred one if present, else the first
    pub fn microphone(&self, preferred: Option<&str>) -> Option<String> {
        let inv = self.inner.read();
        preferred
            .and_then(|p| inv.audio.iter().find(|d| d.name == p))
            .or_else(|| inv.audio.first())
            .map(|d| d.name.clone())
    }

    /// Camera to capture from: the preferred one if present, else the first
    pub fn camera(&self, preferred: Option<&str>) -> Option<String> {
        let inv = self.inner.read();
        preferred
            .and_then(|p| inv.video.iter().find(|d| d.name == p))
            .or_else(|| inv.video.first())
            .map(|d| d.name.clone())
    }
}
