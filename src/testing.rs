//! Fakes for every collaborator, shared by the unit tests

use crate::capture::acquisition::{DeviceFaults, HardwareHandle, LiveSource};
use crate::capture::traits::{
    AudioFormat, AudioInput, DeviceConstraints, MediaDevices, MonitorOutput, Resolution,
    VideoSource,
};
use crate::compositor::frame::{Color, Frame};
use crate::recorder::capture::{CaptureFormat, EncoderFactory, EncoderSpec, MediaEncoder};
use crate::recorder::handoff::{ArtifactHandoff, ArtifactSink};
use crate::reference::{ReferenceLoader, ReferencePlayer};
use crate::services::{AssetLoader, TrackResolver};
use crate::utils::error::{SessionError, SessionResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const CAMERA_COLOR: Color = Color::rgba(200, 0, 0, 255);

/// Camera that serves a solid frame
pub struct FakeVideo {
    resolution: Resolution,
    frame: RwLock<Option<Arc<Frame>>>,
    corrupt: AtomicBool,
}

impl FakeVideo {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            resolution: Resolution::new(width, height),
            frame: RwLock::new(Some(Arc::new(Frame::filled(width, height, CAMERA_COLOR)))),
            corrupt: AtomicBool::new(false),
        }
    }

    /// A camera that has not delivered a frame yet
    pub fn without_frames(width: u32, height: u32) -> Self {
        Self {
            frame: RwLock::new(None),
            ..Self::new(width, height)
        }
    }

    pub fn set_color(&self, color: Color) {
        let frame = Frame::filled(self.resolution.width, self.resolution.height, color);
        *self.frame.write() = Some(Arc::new(frame));
    }

    /// Serve frames whose buffers don't match their size
    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }
}

impl VideoSource for FakeVideo {
    fn resolution(&self) -> Option<Resolution> {
        Some(self.resolution)
    }

    fn latest_frame(&self) -> Option<Arc<Frame>> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Some(Arc::new(Frame::corrupted(
                self.resolution.width,
                self.resolution.height,
            )));
        }
        self.frame.read().clone()
    }
}

enum Waveform {
    Constant(f32),
    Ramp(u64),
}

/// Endless synthetic microphone
pub struct FakeMicrophone {
    format: AudioFormat,
    waveform: Waveform,
}

impl FakeMicrophone {
    pub fn silent(sample_rate: u32, channels: u16) -> Self {
        Self::constant(sample_rate, channels, 0.0)
    }

    pub fn constant(sample_rate: u32, channels: u16, level: f32) -> Self {
        Self {
            format: AudioFormat::new(sample_rate, channels),
            waveform: Waveform::Constant(level),
        }
    }

    /// Slowly rising signal, distinct per sample frame
    pub fn ramp(sample_rate: u32, channels: u16) -> Self {
        Self {
            format: AudioFormat::new(sample_rate, channels),
            waveform: Waveform::Ramp(0),
        }
    }
}

impl AudioInput for FakeMicrophone {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        let channels = self.format.channels.max(1) as usize;
        match &mut self.waveform {
            Waveform::Constant(level) => out.fill(*level),
            Waveform::Ramp(position) => {
                for frame in out.chunks_mut(channels) {
                    let value = (*position % 1000) as f32 / 1000.0;
                    frame.fill(value);
                    *position += 1;
                }
            }
        }
        out.len()
    }
}

/// Speaker that remembers what it played
#[derive(Default)]
pub struct RecordingMonitor {
    samples: Arc<Mutex<Vec<f32>>>,
}

impl RecordingMonitor {
    pub fn samples(&self) -> Arc<Mutex<Vec<f32>>> {
        self.samples.clone()
    }
}

impl MonitorOutput for RecordingMonitor {
    fn write(&mut self, samples: &[f32], _format: AudioFormat) {
        self.samples.lock().extend_from_slice(samples);
    }
}

#[derive(Clone)]
enum DeviceMode {
    Grant,
    Deny(String),
    Hang,
}

/// Platform devices with a scripted permission outcome
pub struct FakeDevices {
    mode: Mutex<DeviceMode>,
    resolution: Resolution,
    acquires: AtomicUsize,
    releases: Arc<AtomicUsize>,
    failing_release: AtomicBool,
    faults: DeviceFaults,
}

impl FakeDevices {
    fn with_mode(mode: DeviceMode, width: u32, height: u32) -> Self {
        Self {
            mode: Mutex::new(mode),
            resolution: Resolution::new(width, height),
            acquires: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
            failing_release: AtomicBool::new(false),
            faults: DeviceFaults::new(),
        }
    }

    pub fn granting(width: u32, height: u32) -> Self {
        Self::with_mode(DeviceMode::Grant, width, height)
    }

    pub fn denying(reason: &str) -> Self {
        Self::with_mode(DeviceMode::Deny(reason.to_string()), 640, 480)
    }

    /// Permission prompt the user never answers
    pub fn hanging() -> Self {
        Self::with_mode(DeviceMode::Hang, 640, 480)
    }

    /// Hardware whose release reports an error (after releasing)
    pub fn with_failing_release(self) -> Self {
        self.failing_release.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_granting(&self) {
        *self.mode.lock() = DeviceMode::Grant;
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// The hardware dies, as a device thread would report it
    pub fn fail(&self, reason: &str) {
        self.faults.report(reason);
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, _constraints: &DeviceConstraints) -> SessionResult<LiveSource> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().clone();
        match mode {
            DeviceMode::Grant => {
                let releases = self.releases.clone();
                let failing = self.failing_release.load(Ordering::SeqCst);
                Ok(LiveSource::new(
                    Arc::new(FakeVideo::new(self.resolution.width, self.resolution.height)),
                    Box::new(FakeMicrophone::constant(48_000, 2, 0.2)),
                    HardwareHandle::new(move || {
                        releases.fetch_add(1, Ordering::SeqCst);
                        if failing {
                            return Err(SessionError::Device("camera driver hung up".into()));
                        }
                        Ok(())
                    })
                    .with_faults(self.faults.clone()),
                ))
            }
            DeviceMode::Deny(reason) => Err(SessionError::Device(reason)),
            DeviceMode::Hang => std::future::pending().await,
        }
    }
}

struct ConstantAudio {
    level: Arc<Mutex<f32>>,
}

impl AudioInput for ConstantAudio {
    fn format(&self) -> AudioFormat {
        AudioFormat::new(48_000, 2)
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        out.fill(*self.level.lock());
        out.len()
    }
}

/// Scriptable reference track
pub struct FakeReference {
    ready: AtomicBool,
    frame: RwLock<Option<Arc<Frame>>>,
    level: Arc<Mutex<f32>>,
    audio_takes: AtomicUsize,
    play_failures: AtomicUsize,
    play_attempts: AtomicUsize,
    frame_requests: AtomicUsize,
    playing: AtomicBool,
    duration: Option<Duration>,
    finished: watch::Sender<bool>,
}

impl FakeReference {
    fn build(ready: bool, duration: Option<Duration>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            ready: AtomicBool::new(ready),
            frame: RwLock::new(Some(Arc::new(Frame::filled(16, 9, Color::WHITE)))),
            level: Arc::new(Mutex::new(0.1)),
            audio_takes: AtomicUsize::new(0),
            play_failures: AtomicUsize::new(0),
            play_attempts: AtomicUsize::new(0),
            frame_requests: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            duration,
            finished,
        }
    }

    /// A three-minute song, buffered and playable
    pub fn ready() -> Self {
        Self::build(true, Some(Duration::from_secs(180)))
    }

    pub fn not_ready() -> Self {
        Self::build(false, Some(Duration::from_secs(180)))
    }

    pub fn set_frame(&self, frame: Option<Frame>) {
        *self.frame.write() = frame.map(Arc::new);
    }

    pub fn set_audio_level(&self, level: f32) {
        *self.level.lock() = level;
    }

    /// Reject the next `count` play() calls (`usize::MAX` for always)
    pub fn set_play_failures(&self, count: usize) {
        self.play_failures.store(count, Ordering::SeqCst);
    }

    pub fn audio_takes(&self) -> usize {
        self.audio_takes.load(Ordering::SeqCst)
    }

    pub fn play_attempts(&self) -> usize {
        self.play_attempts.load(Ordering::SeqCst)
    }

    pub fn frame_requests(&self) -> usize {
        self.frame_requests.load(Ordering::SeqCst)
    }

    /// Reach the natural end of the track
    pub fn finish(&self) {
        self.finished.send_replace(true);
    }
}

#[async_trait]
impl ReferencePlayer for FakeReference {
    fn url(&self) -> &str {
        "file:///songs/fake.mp4"
    }

    async fn wait_can_play(&self) -> SessionResult<()> {
        if self.can_play() {
            Ok(())
        } else {
            Err(SessionError::ReferenceLoad("unplayable track".into()))
        }
    }

    fn can_play(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn current_frame(&self) -> Option<Arc<Frame>> {
        self.frame_requests.fetch_add(1, Ordering::SeqCst);
        self.frame.read().clone()
    }

    fn take_audio(&self) -> Option<Box<dyn AudioInput>> {
        if self.audio_takes.fetch_add(1, Ordering::SeqCst) > 0 {
            return None;
        }
        Some(Box::new(ConstantAudio {
            level: self.level.clone(),
        }))
    }

    async fn play(&self) -> SessionResult<()> {
        self.play_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.play_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.play_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(SessionError::PlaybackStart("autoplay blocked".into()));
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn position(&self) -> Duration {
        Duration::ZERO
    }

    async fn ended(&self) {
        if self.duration.is_none() {
            return std::future::pending().await;
        }
        let mut rx = self.finished.subscribe();
        loop {
            let finished = *rx.borrow_and_update();
            if finished {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Loader that hands out one shared [`FakeReference`]
pub struct FakeReferenceLoader {
    player: Arc<FakeReference>,
    failure: Option<String>,
    delay: Duration,
}

impl FakeReferenceLoader {
    pub fn serving(player: Arc<FakeReference>) -> Self {
        Self {
            player,
            failure: None,
            delay: Duration::ZERO,
        }
    }

    /// Fails after `delay`, e.g. a 404 from the media host
    pub fn failing_after(reason: &str, delay: Duration) -> Self {
        Self {
            player: Arc::new(FakeReference::ready()),
            failure: Some(reason.to_string()),
            delay,
        }
    }
}

#[async_trait]
impl ReferenceLoader for FakeReferenceLoader {
    async fn load(&self, _url: &str) -> SessionResult<Arc<dyn ReferencePlayer>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(reason) => Err(SessionError::ReferenceLoad(reason.clone())),
            None => Ok(self.player.clone()),
        }
    }
}

/// Song catalog: every song resolves, or none do
pub struct FakeTracks {
    available: bool,
}

impl FakeTracks {
    pub fn resolving() -> Self {
        Self { available: true }
    }

    pub fn missing() -> Self {
        Self { available: false }
    }
}

#[async_trait]
impl TrackResolver for FakeTracks {
    async fn resolve(&self, song_id: &str) -> anyhow::Result<String> {
        if self.available {
            Ok(format!("file:///songs/{}.mp4", song_id))
        } else {
            anyhow::bail!("404 Not Found: {}", song_id)
        }
    }
}

/// Asset host where every fetch is a 404
#[derive(Default)]
pub struct FakeAssets;

#[async_trait]
impl AssetLoader for FakeAssets {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("404 Not Found: {}", url)
    }
}

#[derive(Clone, Copy)]
enum EncoderMode {
    ChunkPerFrame,
    Silent,
    FailAfter(u64),
    /// Flushing blocks the calling thread, like waiting on ffmpeg
    SlowFinish(Duration),
}

/// Encoder that emits one chunk per video frame
pub struct FakeEncoderFactory {
    formats: Vec<CaptureFormat>,
    mode: EncoderMode,
    created: AtomicUsize,
    audio_samples: Arc<AtomicUsize>,
}

impl Default for FakeEncoderFactory {
    fn default() -> Self {
        Self {
            formats: CaptureFormat::preferred(),
            mode: EncoderMode::ChunkPerFrame,
            created: AtomicUsize::new(0),
            audio_samples: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FakeEncoderFactory {
    pub fn supporting(formats: &[CaptureFormat]) -> Self {
        Self {
            formats: formats.to_vec(),
            ..Self::default()
        }
    }

    /// Accepts input but never produces data
    pub fn silent() -> Self {
        Self {
            mode: EncoderMode::Silent,
            ..Self::default()
        }
    }

    /// Crashes on video frame `frames + 1`
    pub fn failing_after(frames: u64) -> Self {
        Self {
            mode: EncoderMode::FailAfter(frames),
            ..Self::default()
        }
    }

    pub fn slow_to_finish(delay: Duration) -> Self {
        Self {
            mode: EncoderMode::SlowFinish(delay),
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn audio_samples(&self) -> usize {
        self.audio_samples.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for FakeEncoderFactory {
    fn supports(&self, format: CaptureFormat) -> bool {
        self.formats.contains(&format)
    }

    fn create(&self, _spec: &EncoderSpec) -> SessionResult<Box<dyn MediaEncoder>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEncoder {
            mode: self.mode,
            frames: 0,
            pending: Vec::new(),
            audio_samples: self.audio_samples.clone(),
        }))
    }
}

struct FakeEncoder {
    mode: EncoderMode,
    frames: u64,
    pending: Vec<Vec<u8>>,
    audio_samples: Arc<AtomicUsize>,
}

impl MediaEncoder for FakeEncoder {
    fn encode_video(&mut self, _frame: &Frame, timestamp: Duration) -> SessionResult<()> {
        if let EncoderMode::FailAfter(limit) = self.mode {
            if self.frames >= limit {
                return Err(SessionError::Encoding("encoder crashed".into()));
            }
        }
        self.frames += 1;
        if !matches!(self.mode, EncoderMode::Silent) {
            self.pending
                .push(format!("frame@{}ms;", timestamp.as_millis()).into_bytes());
        }
        Ok(())
    }

    fn encode_audio(&mut self, samples: &[f32]) -> SessionResult<()> {
        self.audio_samples.fetch_add(samples.len(), Ordering::SeqCst);
        Ok(())
    }

    fn poll_chunks(&mut self) -> SessionResult<Vec<Vec<u8>>> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn finish(mut self: Box<Self>) -> SessionResult<Vec<Vec<u8>>> {
        if let EncoderMode::SlowFinish(delay) = self.mode {
            std::thread::sleep(delay);
        }
        Ok(std::mem::take(&mut self.pending))
    }
}

/// Review stage that keeps what it receives
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<ArtifactHandoff>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn take(&self) -> Vec<ArtifactHandoff> {
        std::mem::take(&mut *self.delivered.lock())
    }
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn deliver(&self, handoff: ArtifactHandoff) -> anyhow::Result<()> {
        self.delivered.lock().push(handoff);
        Ok(())
    }
}
