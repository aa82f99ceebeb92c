//! Session configuration

use super::capture::CaptureFormat;
use crate::audio::MixerSettings;
use crate::capture::traits::{AudioFormat, Resolution};
use crate::compositor::draw_loop::CompositorSettings;
use crate::compositor::effects::SourceKind;
use crate::utils::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Event scope; solo recording when absent
    pub event_id: Option<String>,

    /// Song whose reference track is sung over
    pub song_id: String,

    /// Composite and capture frame rate
    pub fps: u32,

    /// Surface size when the camera does not report one
    pub fallback_width: u32,
    pub fallback_height: u32,

    pub reference_opacity: f32,
    pub logo_width_ratio: f32,
    pub logo_margin: u32,
    pub mirror_camera: bool,

    /// Mix format
    pub sample_rate: u32,
    pub channels: u16,
    pub microphone_gain: f32,
    pub reference_gain: f32,

    /// Wait between capture start and playback start
    pub settle_delay_ms: u64,

    /// Extra playback attempts before showing the banner
    pub playback_retries: u32,

    /// Capture formats in order of preference
    pub preferred_formats: Vec<CaptureFormat>,

    /// Logo candidates tried after the event's own logo
    pub placeholder_logos: Vec<String>,

    /// Text on the fallback badge
    pub badge_text: String,

    pub initial_source: SourceKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_id: None,
            song_id: String::new(),
            fps: 30,
            fallback_width: 1280,
            fallback_height: 720,
            reference_opacity: 0.4,
            logo_width_ratio: 0.2,
            logo_margin: 16,
            mirror_camera: true,
            sample_rate: 48_000,
            channels: 2,
            microphone_gain: 1.0,
            reference_gain: 1.0,
            settle_delay_ms: 100,
            playback_retries: 1,
            preferred_formats: CaptureFormat::preferred(),
            placeholder_logos: Vec::new(),
            badge_text: "KARAOKE".to_string(),
            initial_source: SourceKind::Camera,
        }
    }
}

impl SessionConfig {
    pub fn for_song(song_id: impl Into<String>) -> Self {
        Self {
            song_id: song_id.into(),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config: SessionConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.song_id.trim().is_empty() {
            return Err(SessionError::Config("songId is required".to_string()));
        }
        if self.fps == 0 || self.fps > 120 {
            return Err(SessionError::Config(format!("fps out of range: {}", self.fps)));
        }
        if self.fallback_width == 0 || self.fallback_height == 0 {
            return Err(SessionError::Config(
                "fallback dimensions must be non-zero".to_string(),
            ));
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(SessionError::Config(
                "sample rate and channel count must be non-zero".to_string(),
            ));
        }
        for (name, value) in [
            ("referenceOpacity", self.reference_opacity),
            ("logoWidthRatio", self.logo_width_ratio),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(SessionError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.preferred_formats.is_empty() {
            return Err(SessionError::Config(
                "at least one capture format is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    pub fn fallback_resolution(&self) -> Resolution {
        Resolution::new(self.fallback_width, self.fallback_height)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn mixer_settings(&self) -> MixerSettings {
        MixerSettings {
            format: self.audio_format(),
            microphone_gain: self.microphone_gain,
            reference_gain: self.reference_gain,
        }
    }

    pub fn compositor_settings(&self) -> CompositorSettings {
        CompositorSettings {
            fps: self.fps,
            mirror_camera: self.mirror_camera,
            reference_opacity: self.reference_opacity,
            logo_width_ratio: self.logo_width_ratio,
            logo_margin: self.logo_margin,
            ..CompositorSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_json_takes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{"songId": "bohemian", "eventId": "gala-2024", "fps": 25, "initialSource": "filtered-camera"}"#,
        )
        .unwrap();

        let config = SessionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.song_id, "bohemian");
        assert_eq!(config.event_id.as_deref(), Some("gala-2024"));
        assert_eq!(config.fps, 25);
        assert_eq!(config.initial_source, SourceKind::FilteredCamera);
        assert_eq!(config.reference_opacity, 0.4);
        assert_eq!(config.preferred_formats, CaptureFormat::preferred());
        assert_eq!(config.badge_text, "KARAOKE");
    }

    #[test]
    fn test_validation() {
        assert!(SessionConfig::for_song("x").validate().is_ok());
        assert!(SessionConfig::default().validate().is_err());

        let bad = SessionConfig {
            reference_opacity: 1.5,
            ..SessionConfig::for_song("x")
        };
        assert!(matches!(bad.validate(), Err(SessionError::Config(_))));

        let bad = SessionConfig {
            fps: 0,
            ..SessionConfig::for_song("x")
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            SessionConfig::from_json_file(&path),
            Err(SessionError::Serialization(_))
        ));
    }
}
