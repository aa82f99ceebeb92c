//! FFmpeg-backed reference player
//!
//! The track is probed with ffprobe, then decoded by two ffmpeg processes:
//! one emitting raw RGBA frames, one emitting interleaved f32 audio. Reader
//! threads keep small bounded buffers topped up; playback consumes them
//! against a wall clock.

use super::{PlaybackClock, ReferenceLoader, ReferencePlayer};
use crate::capture::traits::{AudioFormat, AudioInput};
use crate::compositor::frame::Frame;
use crate::utils::error::{SessionError, SessionResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Seconds of decoded audio kept ahead of playback
const AUDIO_BUFFER_SECONDS: usize = 2;
const DECODER_BACKOFF: Duration = Duration::from_millis(5);
const END_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stream facts gathered before decoding starts
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration: Option<Duration>,
    pub has_audio: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse frame rate (format: "30/1" or "30000/1001")
fn parse_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Interpret ffprobe's JSON output
pub fn parse_probe(json: &str) -> SessionResult<ProbeInfo> {
    let output: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| SessionError::ReferenceLoad(format!("Unexpected ffprobe output: {}", e)))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| SessionError::ReferenceLoad("track has no video stream".to_string()))?;

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(SessionError::ReferenceLoad(
                "video stream has no dimensions".to_string(),
            ))
        }
    };

    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .unwrap_or(30.0);

    // "N/A" and friends mean a live or unbounded source
    let duration = output
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
        .and_then(|d| Duration::try_from_secs_f64(d).ok());

    let has_audio = output
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(ProbeInfo {
        width,
        height,
        fps,
        duration,
        has_audio,
    })
}

/// Turn a track URL into something ffmpeg can open
pub fn input_location(url: &str) -> SessionResult<String> {
    if let Some(path) = url.strip_prefix("file://") {
        return urlencoding::decode(path)
            .map(|p| p.into_owned())
            .map_err(|e| SessionError::ReferenceLoad(format!("Bad file URL {}: {}", url, e)));
    }
    match url.split_once("://") {
        Some(("http" | "https", _)) => Ok(url.to_string()),
        Some((scheme, _)) => Err(SessionError::ReferenceLoad(format!(
            "Unsupported URL scheme: {}",
            scheme
        ))),
        None if url.trim().is_empty() => {
            Err(SessionError::ReferenceLoad("empty track URL".to_string()))
        }
        None => Ok(url.to_string()),
    }
}

/// Decoded frames waiting for their presentation time
pub(crate) struct FrameQueue {
    pending: VecDeque<(Duration, Arc<Frame>)>,
    current: Option<Arc<Frame>>,
    capacity: usize,
}

impl FrameQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    pub(crate) fn push(&mut self, pts: Duration, frame: Arc<Frame>) {
        self.pending.push_back((pts, frame));
    }

    /// Latest frame due at `position`
    pub(crate) fn frame_at(&mut self, position: Duration) -> Option<Arc<Frame>> {
        while self
            .pending
            .front()
            .is_some_and(|(pts, _)| *pts <= position)
        {
            if let Some((_, frame)) = self.pending.pop_front() {
                self.current = Some(frame);
            }
        }
        self.current.clone()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
enum LoadState {
    Loading,
    Ready,
    Failed(String),
}

struct PlayerShared {
    url: String,
    input: String,
    ffmpeg: String,
    info: ProbeInfo,
    audio_format: AudioFormat,
    clock: Mutex<PlaybackClock>,
    playing: AtomicBool,
    frames: Mutex<FrameQueue>,
    audio: Mutex<VecDeque<f32>>,
    audio_capacity: usize,
    decoders: Mutex<Vec<Child>>,
    /// Bumped on reset so stale reader threads stop pushing
    epoch: AtomicU64,
    state: watch::Sender<LoadState>,
}

impl PlayerShared {
    fn set_state(&self, state: LoadState) {
        self.state.send_replace(state);
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn start_decoders(self: &Arc<Self>) -> SessionResult<()> {
        let epoch = self.current_epoch();
        let mut children = Vec::with_capacity(2);
        children.push(self.spawn_video_decoder(epoch)?);
        if self.info.has_audio {
            match self.spawn_audio_decoder(epoch) {
                Ok(child) => children.push(child),
                Err(e) => tracing::warn!("Reference audio unavailable, playing silent: {}", e),
            }
        }
        *self.decoders.lock() = children;
        Ok(())
    }

    fn stop_decoders(&self) {
        {
            let mut frames = self.frames.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            frames.clear();
        }
        self.audio.lock().clear();
        for mut child in self.decoders.lock().drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn spawn_video_decoder(self: &Arc<Self>, epoch: u64) -> SessionResult<Child> {
        let size = format!("{}x{}", self.info.width, self.info.height);
        let mut child = Command::new(&self.ffmpeg)
            .args([
                "-nostdin",
                "-loglevel",
                "error",
                "-i",
                &self.input,
                "-an",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &size,
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SessionError::ReferenceLoad(format!("Failed to start FFmpeg decoder: {}", e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::ReferenceLoad("Failed to capture FFmpeg stdout".to_string())
        })?;
        let stderr = child.stderr.take();

        let shared = self.clone();
        std::thread::spawn(move || video_reader(shared, epoch, stdout, stderr));
        Ok(child)
    }

    fn spawn_audio_decoder(self: &Arc<Self>, epoch: u64) -> SessionResult<Child> {
        let rate = self.audio_format.sample_rate.to_string();
        let channels = self.audio_format.channels.to_string();
        let mut child = Command::new(&self.ffmpeg)
            .args([
                "-nostdin",
                "-loglevel",
                "error",
                "-i",
                &self.input,
                "-vn",
                "-f",
                "f32le",
                "-ac",
                &channels,
                "-ar",
                &rate,
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                SessionError::ReferenceLoad(format!("Failed to start FFmpeg audio decoder: {}", e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::ReferenceLoad("Failed to capture FFmpeg stdout".to_string())
        })?;

        let shared = self.clone();
        std::thread::spawn(move || audio_reader(shared, epoch, stdout));
        Ok(child)
    }
}

fn video_reader(
    shared: Arc<PlayerShared>,
    epoch: u64,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
) {
    let (width, height) = (shared.info.width, shared.info.height);
    let frame_size = (width as usize) * (height as usize) * 4;
    let mut reader = BufReader::with_capacity(frame_size * 2, stdout);
    let mut index: u64 = 0;

    loop {
        if shared.current_epoch() != epoch {
            return;
        }
        if shared.frames.lock().is_full() {
            std::thread::sleep(DECODER_BACKOFF);
            continue;
        }

        let mut buffer = vec![0u8; frame_size];
        let read = reader.read_exact(&mut buffer);
        if shared.current_epoch() != epoch {
            return;
        }

        match read {
            Ok(()) => {
                let frame = match Frame::from_rgba(width, height, buffer) {
                    Ok(frame) => Arc::new(frame),
                    Err(e) => {
                        tracing::warn!("Dropping reference frame {}: {}", index, e);
                        continue;
                    }
                };
                let pts = Duration::from_secs_f64(index as f64 / shared.info.fps);
                {
                    let mut frames = shared.frames.lock();
                    if shared.current_epoch() != epoch {
                        return;
                    }
                    frames.push(pts, frame);
                }
                if index == 0 {
                    tracing::info!("Reference track buffered: {}", shared.url);
                    shared.set_state(LoadState::Ready);
                }
                index += 1;
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    tracing::warn!("Reference video decode stopped: {}", e);
                }
                if index == 0 {
                    let mut detail = String::new();
                    if let Some(mut stderr) = stderr {
                        let _ = stderr.read_to_string(&mut detail);
                    }
                    let detail = detail.trim();
                    let message = if detail.is_empty() {
                        "decoder produced no frames".to_string()
                    } else {
                        detail.to_string()
                    };
                    shared.set_state(LoadState::Failed(message));
                } else {
                    tracing::debug!("Reference video decoded {} frames", index);
                }
                return;
            }
        }
    }
}

fn audio_reader(shared: Arc<PlayerShared>, epoch: u64, mut stdout: ChildStdout) {
    let mut chunk = vec![0u8; 16 * 1024];
    let mut carry: Vec<u8> = Vec::with_capacity(4);

    loop {
        if shared.current_epoch() != epoch {
            return;
        }
        if shared.audio.lock().len() >= shared.audio_capacity {
            std::thread::sleep(DECODER_BACKOFF);
            continue;
        }

        let n = match stdout.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Reference audio decode stopped: {}", e);
                return;
            }
        };

        carry.extend_from_slice(&chunk[..n]);
        let whole = carry.len() - carry.len() % 4;
        let samples = carry[..whole]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]));

        let mut audio = shared.audio.lock();
        if shared.current_epoch() != epoch {
            return;
        }
        audio.extend(samples);
        drop(audio);
        carry.drain(..whole);
    }
}

/// Reference audio as a mix input. Silent while paused or starved.
struct ReferenceAudio {
    shared: Arc<PlayerShared>,
}

impl AudioInput for ReferenceAudio {
    fn format(&self) -> AudioFormat {
        self.shared.audio_format
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        out.fill(0.0);
        if self.shared.playing.load(Ordering::Acquire) {
            let mut audio = self.shared.audio.lock();
            let n = out.len().min(audio.len());
            for (o, s) in out.iter_mut().zip(audio.drain(..n)) {
                *o = s;
            }
        }
        out.len()
    }
}

/// A reference track decoded by ffmpeg
pub struct FfmpegReferencePlayer {
    shared: Arc<PlayerShared>,
    audio_taken: AtomicBool,
}

impl FfmpegReferencePlayer {
    pub fn info(&self) -> &ProbeInfo {
        &self.shared.info
    }
}

#[async_trait]
impl ReferencePlayer for FfmpegReferencePlayer {
    fn url(&self) -> &str {
        &self.shared.url
    }

    async fn wait_can_play(&self) -> SessionResult<()> {
        let mut rx = self.shared.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                LoadState::Ready => return Ok(()),
                LoadState::Failed(message) => return Err(SessionError::ReferenceLoad(message)),
                LoadState::Loading => {}
            }
            rx.changed().await.map_err(|_| {
                SessionError::ReferenceLoad("reference decoder went away".to_string())
            })?;
        }
    }

    fn can_play(&self) -> bool {
        *self.shared.state.borrow() == LoadState::Ready
    }

    fn current_frame(&self) -> Option<Arc<Frame>> {
        let position = self.position();
        self.shared.frames.lock().frame_at(position)
    }

    fn take_audio(&self) -> Option<Box<dyn AudioInput>> {
        if self.audio_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Box::new(ReferenceAudio {
            shared: self.shared.clone(),
        }))
    }

    async fn play(&self) -> SessionResult<()> {
        match &*self.shared.state.borrow() {
            LoadState::Ready => {}
            LoadState::Loading => {
                return Err(SessionError::PlaybackStart(
                    "reference track still buffering".to_string(),
                ))
            }
            LoadState::Failed(message) => {
                return Err(SessionError::PlaybackStart(message.clone()))
            }
        }
        self.shared.clock.lock().start(Instant::now());
        self.shared.playing.store(true, Ordering::Release);
        tracing::info!("Reference playback started");
        Ok(())
    }

    fn pause(&self) {
        self.shared.playing.store(false, Ordering::Release);
        self.shared.clock.lock().pause(Instant::now());
    }

    fn reset(&self) {
        self.shared.playing.store(false, Ordering::Release);
        self.shared.clock.lock().reset();
        self.shared.stop_decoders();
        self.shared.set_state(LoadState::Loading);
        if let Err(e) = self.shared.start_decoders() {
            tracing::warn!("Could not restart reference decoders: {}", e);
            self.shared.set_state(LoadState::Failed(e.to_string()));
        }
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    fn duration(&self) -> Option<Duration> {
        self.shared.info.duration
    }

    fn position(&self) -> Duration {
        self.shared.clock.lock().position(Instant::now())
    }

    async fn ended(&self) {
        let Some(duration) = self.duration() else {
            return std::future::pending().await;
        };
        loop {
            if self.position() >= duration {
                return;
            }
            tokio::time::sleep(END_POLL_INTERVAL).await;
        }
    }
}

impl Drop for FfmpegReferencePlayer {
    fn drop(&mut self) {
        self.shared.stop_decoders();
    }
}

/// Loads reference tracks through ffprobe + ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegReferenceLoader {
    ffmpeg: String,
    ffprobe: String,
    audio_format: AudioFormat,
    buffered_frames: usize,
}

impl Default for FfmpegReferenceLoader {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            audio_format: AudioFormat::new(48_000, 2),
            buffered_frames: 8,
        }
    }
}

impl FfmpegReferenceLoader {
    pub fn new(audio_format: AudioFormat) -> Self {
        Self {
            audio_format,
            ..Self::default()
        }
    }

    /// Use specific ffmpeg / ffprobe executables
    pub fn with_binaries(mut self, ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    fn probe(ffprobe: &str, input: &str) -> SessionResult<ProbeInfo> {
        let output = Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "stream=codec_type,width,height,r_frame_rate:format=duration",
                "-of",
                "json",
                input,
            ])
            .output()
            .map_err(|e| SessionError::ReferenceLoad(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SessionError::ReferenceLoad(format!(
                "ffprobe failed: {}",
                stderr.trim()
            )));
        }

        parse_probe(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl ReferenceLoader for FfmpegReferenceLoader {
    async fn load(&self, url: &str) -> SessionResult<Arc<dyn ReferencePlayer>> {
        let input = input_location(url)?;
        let ffprobe = self.ffprobe.clone();
        let probe_input = input.clone();
        let info = tokio::task::spawn_blocking(move || Self::probe(&ffprobe, &probe_input))
            .await
            .map_err(|e| SessionError::ReferenceLoad(format!("probe task failed: {}", e)))??;

        tracing::info!(
            "Opening reference track {}: {}x{} @ {:.2}fps, duration {:?}, audio: {}",
            url,
            info.width,
            info.height,
            info.fps,
            info.duration,
            info.has_audio
        );

        let audio_capacity = self.audio_format.sample_rate as usize
            * self.audio_format.channels.max(1) as usize
            * AUDIO_BUFFER_SECONDS;
        let (state, _) = watch::channel(LoadState::Loading);
        let shared = Arc::new(PlayerShared {
            url: url.to_string(),
            input,
            ffmpeg: self.ffmpeg.clone(),
            info,
            audio_format: self.audio_format,
            clock: Mutex::new(PlaybackClock::new()),
            playing: AtomicBool::new(false),
            frames: Mutex::new(FrameQueue::new(self.buffered_frames)),
            audio: Mutex::new(VecDeque::new()),
            audio_capacity,
            decoders: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            state,
        });
        shared.start_decoders()?;

        Ok(Arc::new(FfmpegReferencePlayer {
            shared,
            audio_taken: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::frame::Color;

    #[test]
    fn test_parse_probe_reads_streams_and_duration() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio"},
                {"codec_type": "video", "width": 1920, "height": 1080, "r_frame_rate": "30000/1001"}
            ],
            "format": {"duration": "184.250000"}
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.duration, Some(Duration::from_millis(184_250)));
        assert!(info.has_audio);
    }

    #[test]
    fn test_parse_probe_unknown_duration_and_missing_video() {
        let live = r#"{"streams":[{"codec_type":"video","width":640,"height":360,"r_frame_rate":"0/0"}],"format":{"duration":"N/A"}}"#;
        let info = parse_probe(live).unwrap();
        assert_eq!(info.duration, None);
        assert_eq!(info.fps, 30.0);
        assert!(!info.has_audio);

        let audio_only = r#"{"streams":[{"codec_type":"audio"}]}"#;
        assert!(matches!(
            parse_probe(audio_only),
            Err(SessionError::ReferenceLoad(_))
        ));
        assert!(parse_probe("garbage").is_err());
    }

    #[test]
    fn test_parse_probe_out_of_range_duration_is_unbounded() {
        for duration in ["1e30", "inf", "NaN"] {
            let json = format!(
                r#"{{"streams":[{{"codec_type":"video","width":640,"height":360}}],"format":{{"duration":"{}"}}}}"#,
                duration
            );
            assert_eq!(parse_probe(&json).unwrap().duration, None, "{duration}");
        }
    }

    #[test]
    fn test_input_location() {
        assert_eq!(
            input_location("file:///songs/My%20Song.mp4").unwrap(),
            "/songs/My Song.mp4"
        );
        assert_eq!(
            input_location("https://cdn.example.com/a.mp4").unwrap(),
            "https://cdn.example.com/a.mp4"
        );
        assert!(input_location("ftp://host/a.mp4").is_err());
        assert!(input_location("  ").is_err());
    }

    #[test]
    fn test_frame_queue_presents_due_frames() {
        let mut queue = FrameQueue::new(3);
        assert!(queue.frame_at(Duration::ZERO).is_none());

        for (i, color) in [Color::BLACK, Color::WHITE, Color::TRANSPARENT]
            .into_iter()
            .enumerate()
        {
            queue.push(Duration::from_millis(i as u64 * 100), Arc::new(Frame::filled(1, 1, color)));
        }
        assert!(queue.is_full());

        let first = queue.frame_at(Duration::ZERO).unwrap();
        assert_eq!(first.pixel(0, 0), Color::BLACK.to_array());

        // holds the current frame between presentation times
        let held = queue.frame_at(Duration::from_millis(50)).unwrap();
        assert_eq!(held.pixel(0, 0), Color::BLACK.to_array());

        let last = queue.frame_at(Duration::from_secs(1)).unwrap();
        assert_eq!(last.pixel(0, 0), Color::TRANSPARENT.to_array());
        assert!(!queue.is_full());

        queue.clear();
        assert!(queue.frame_at(Duration::from_secs(1)).is_none());
    }

    #[tokio::test]
    async fn test_missing_ffprobe_is_reference_load_error() {
        let loader = FfmpegReferenceLoader::default()
            .with_binaries("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let err = loader.load("file:///tmp/song.mp4").await.err().unwrap();
        assert!(matches!(err, SessionError::ReferenceLoad(_)));
    }
}
