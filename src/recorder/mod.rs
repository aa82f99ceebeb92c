//! Recording system module
//!
//! This module implements one karaoke take from start to hand-off:
//! - SessionConfig for per-session settings
//! - StreamCapture over a pluggable MediaEncoder (ffmpeg by default)
//! - RecordingSessionController to orchestrate devices, playback and capture
//! - ArtifactSink for the finished recording

pub mod capture;
pub mod config;
pub mod controller;
pub mod ffmpeg;
pub mod handoff;
pub mod state;

pub use capture::{CaptureFormat, EncoderFactory, MediaEncoder, RecordingArtifact, StreamCapture};
pub use config::SessionConfig;
pub use controller::{RecordingSessionController, SessionDependencies, AUTOPLAY_BANNER};
pub use ffmpeg::FfmpegEncoderFactory;
pub use handoff::{ArtifactHandoff, ArtifactSink, ChannelSink, LocalRecording};
pub use state::{ReadinessFlags, RecordingTimeline, SessionEvent, SessionStatus, StatusReport};
