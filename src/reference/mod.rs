//! Reference track ("karaoke" backing video + audio)
//!
//! The reference is loaded when the session starts, played while
//! recording, and paused/reset when recording ends or fails.

pub mod ffmpeg;

use crate::capture::traits::AudioInput;
use crate::compositor::frame::Frame;
use crate::utils::error::SessionResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use ffmpeg::FfmpegReferenceLoader;

/// A loaded, playable reference track
#[async_trait]
pub trait ReferencePlayer: Send + Sync {
    fn url(&self) -> &str;

    /// Resolves once enough data is buffered to present a frame and start
    /// audio. Fails with `ReferenceLoad` if the track turns out unplayable.
    async fn wait_can_play(&self) -> SessionResult<()>;

    /// Non-blocking readiness check
    fn can_play(&self) -> bool;

    /// Video frame for the current playback position; `None` when nothing is
    /// buffered yet
    fn current_frame(&self) -> Option<Arc<Frame>>;

    /// The track's audio; handed out once per load
    fn take_audio(&self) -> Option<Box<dyn AudioInput>>;

    /// Start or resume playback. May be refused (`PlaybackStart`).
    async fn play(&self) -> SessionResult<()>;

    fn pause(&self);

    /// Stop playback and rewind to the start
    fn reset(&self);

    fn is_playing(&self) -> bool;

    /// Total length, when finite and known
    fn duration(&self) -> Option<Duration>;

    fn position(&self) -> Duration;

    /// Resolves when playback reaches the natural end of a finite track.
    /// Never resolves for tracks of unknown length.
    async fn ended(&self);
}

/// Opens reference tracks by URL
#[async_trait]
pub trait ReferenceLoader: Send + Sync {
    async fn load(&self, url: &str) -> SessionResult<Arc<dyn ReferencePlayer>>;
}

/// Wall-clock playback position with pause support
#[derive(Debug, Clone, Default)]
pub struct PlaybackClock {
    started_at: Option<Instant>,
    accumulated: Duration,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn start(&mut self, now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if let Some(started) = self.started_at.take() {
            self.accumulated += now.saturating_duration_since(started);
        }
    }

    pub fn reset(&mut self) {
        self.started_at = None;
        self.accumulated = Duration::ZERO;
    }

    pub fn position(&self, now: Instant) -> Duration {
        let running = self
            .started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        self.accumulated + running
    }
}
