//! Capture trait definitions
//!
//! Platform-agnostic traits for the camera, microphone and speaker, plus
//! the device descriptions the UI shows.

use super::acquisition::LiveSource;
use crate::compositor::frame::Frame;
use crate::utils::error::SessionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Information about a camera/webcam
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Whether the camera faces the user
    pub front_facing: bool,
}

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Whether this is an input device
    pub is_input: bool,

    /// Whether this is the default device
    pub is_default: bool,
}

/// Sample layout of an interleaved f32 PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples covering `frames` sample frames
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }
}

/// Which way the requested camera should face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front-facing camera ("user" facing)
    #[default]
    User,
    /// Rear camera
    Environment,
}

/// What to ask the platform for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConstraints {
    pub facing: FacingMode,
    /// Preferred capture resolution; the device may choose another
    pub ideal_resolution: Resolution,
    pub camera_id: Option<String>,
    pub microphone_id: Option<String>,
}

impl Default for DeviceConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            ideal_resolution: Resolution::new(1280, 720),
            camera_id: None,
            microphone_id: None,
        }
    }
}

/// A real-time video producer
pub trait VideoSource: Send + Sync {
    /// Native resolution, once known
    fn resolution(&self) -> Option<Resolution>;

    /// Most recent frame, if the source has produced one yet
    fn latest_frame(&self) -> Option<Arc<Frame>>;
}

/// A pull-based audio track producing interleaved f32 samples
pub trait AudioInput: Send {
    fn format(&self) -> AudioFormat;

    /// Fill the front of `out` with available samples and return how many
    /// were written. Anything not written is treated as silence.
    fn read(&mut self, out: &mut [f32]) -> usize;
}

/// Where the performer hears the reference track
pub trait MonitorOutput: Send {
    fn write(&mut self, samples: &[f32], format: AudioFormat);
}

/// Discards everything written to it
#[derive(Debug, Default)]
pub struct NullMonitor;

impl MonitorOutput for NullMonitor {
    fn write(&mut self, _samples: &[f32], _format: AudioFormat) {}
}

/// Platform access to the camera, microphone and speaker
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request camera + microphone access.
    ///
    /// May wait indefinitely on a permission prompt. If the returned future
    /// is dropped before completing, any partially opened hardware must be
    /// released by the implementation.
    async fn acquire(&self, constraints: &DeviceConstraints) -> SessionResult<LiveSource>;

    /// Speaker output used to monitor the reference track
    fn monitor_output(&self, _format: AudioFormat) -> Box<dyn MonitorOutput> {
        Box::new(NullMonitor)
    }

    fn cameras(&self) -> Vec<CameraInfo> {
        Vec::new()
    }

    fn microphones(&self) -> Vec<AudioDeviceInfo> {
        Vec::new()
    }
}
