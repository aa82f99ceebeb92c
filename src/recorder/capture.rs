//! Stream capture
//!
//! Reads the composite surface and the mixed audio at a fixed frame rate,
//! feeds both to a media encoder, and buffers the encoded chunks in arrival
//! order until finalize concatenates them into one artifact. Encoder calls
//! can block on the encoder process, so they run on the blocking pool.

use super::state::RecordingTimeline;
use crate::audio::MixedAudioOutput;
use crate::capture::traits::AudioFormat;
use crate::compositor::frame::Frame;
use crate::compositor::surface::SurfaceReader;
use crate::utils::error::{SessionError, SessionResult};
use crate::utils::fallback::try_each_sync;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Container + codec pairs the capture can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureFormat {
    WebmVp8Opus,
    WebmVp9Opus,
    Mp4H264Aac,
}

impl CaptureFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            CaptureFormat::WebmVp8Opus => "video/webm;codecs=vp8,opus",
            CaptureFormat::WebmVp9Opus => "video/webm;codecs=vp9,opus",
            CaptureFormat::Mp4H264Aac => "video/mp4;codecs=avc1,mp4a",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CaptureFormat::WebmVp8Opus | CaptureFormat::WebmVp9Opus => "webm",
            CaptureFormat::Mp4H264Aac => "mp4",
        }
    }

    /// Default preference order, most broadly supported first
    pub fn preferred() -> Vec<CaptureFormat> {
        vec![
            CaptureFormat::WebmVp8Opus,
            CaptureFormat::WebmVp9Opus,
            CaptureFormat::Mp4H264Aac,
        ]
    }
}

/// What the encoder is asked to produce
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderSpec {
    pub format: CaptureFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub audio: AudioFormat,
}

impl EncoderSpec {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.fps.max(1) as u64)
    }
}

/// A streaming media encoder
pub trait MediaEncoder: Send {
    /// Queue one video frame with its presentation time
    fn encode_video(&mut self, frame: &Frame, timestamp: Duration) -> SessionResult<()>;

    /// Queue interleaved samples in the encoder's audio format
    fn encode_audio(&mut self, samples: &[f32]) -> SessionResult<()>;

    /// Encoded container data produced since the last poll. Data may lag the
    /// input by an arbitrary amount.
    fn poll_chunks(&mut self) -> SessionResult<Vec<Vec<u8>>>;

    /// Flush and close; returns whatever data remained
    fn finish(self: Box<Self>) -> SessionResult<Vec<Vec<u8>>>;
}

/// Creates encoders and answers "is this type supported"
pub trait EncoderFactory: Send + Sync {
    fn supports(&self, format: CaptureFormat) -> bool;

    fn create(&self, spec: &EncoderSpec) -> SessionResult<Box<dyn MediaEncoder>>;
}

/// One piece of encoded output, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub sequence: u64,
    pub data: Vec<u8>,
}

/// The finished recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    pub data: Vec<u8>,
    pub format: CaptureFormat,
    /// Media duration covered by the encoded frames
    pub duration: Duration,
    pub chunk_count: usize,
    pub timeline: RecordingTimeline,
}

impl RecordingArtifact {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }
}

/// Result of finalize: the artifact plus the encoder failure, if any, that
/// cut the take short
#[derive(Debug)]
pub struct FinalizedCapture {
    pub artifact: RecordingArtifact,
    pub error: Option<SessionError>,
}

/// Pick the first preferred format the factory supports
pub fn negotiate_format(
    factory: &dyn EncoderFactory,
    preferred: &[CaptureFormat],
) -> SessionResult<CaptureFormat> {
    try_each_sync(preferred.iter().copied(), |format| {
        if factory.supports(format) {
            Ok(format)
        } else {
            tracing::debug!("Capture format {} not supported", format.mime_type());
            Err(format)
        }
    })
    .map_err(|failed| {
        SessionError::Encoding(format!(
            "none of the preferred formats are supported ({} tried)",
            failed.errors.len()
        ))
    })
}

/// An in-progress capture of the composite surface and the mixed audio
pub struct StreamCapture {
    spec: EncoderSpec,
    encoder: Option<Box<dyn MediaEncoder>>,
    surface: SurfaceReader,
    audio: MixedAudioOutput,
    chunks: Vec<EncodedChunk>,
    next_sequence: u64,
    frames_encoded: u64,
    audio_frames: u64,
    began: Instant,
    began_at: DateTime<Utc>,
    failure: Option<SessionError>,
}

impl StreamCapture {
    /// Start capturing. The first video frame is encoded immediately so the
    /// take starts at the instant of `begin`.
    pub fn begin(
        factory: &dyn EncoderFactory,
        spec: EncoderSpec,
        surface: SurfaceReader,
        audio: MixedAudioOutput,
    ) -> SessionResult<Self> {
        let (width, height) = surface.dimensions();
        if width == 0 || height == 0 || (width, height) != (spec.width, spec.height) {
            return Err(SessionError::Encoding(format!(
                "surface is {}x{}, encoder expects {}x{}",
                width, height, spec.width, spec.height
            )));
        }
        if audio.format() != spec.audio {
            return Err(SessionError::Encoding(
                "mixed audio format does not match the encoder".to_string(),
            ));
        }

        let encoder = factory.create(&spec)?;
        tracing::info!(
            "Capture started: {} {}x{} @ {}fps",
            spec.format.mime_type(),
            spec.width,
            spec.height,
            spec.fps
        );

        let mut capture = Self {
            spec,
            encoder: Some(encoder),
            surface,
            audio,
            chunks: Vec::new(),
            next_sequence: 0,
            frames_encoded: 0,
            audio_frames: 0,
            began: Instant::now(),
            began_at: Utc::now(),
            failure: None,
        };
        capture.tick(capture.began)?;
        Ok(capture)
    }

    pub fn spec(&self) -> &EncoderSpec {
        &self.spec
    }

    pub fn chunks(&self) -> &[EncodedChunk] {
        &self.chunks
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Media time covered so far
    pub fn duration(&self) -> Duration {
        self.spec.frame_interval() * self.frames_encoded as u32
    }

    /// Append a data chunk; empty chunks carry nothing and are dropped
    pub fn on_chunk(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.chunks.push(EncodedChunk {
            sequence: self.next_sequence,
            data,
        });
        self.next_sequence += 1;
    }

    /// Encode everything due up to `now` and collect finished chunks.
    pub fn tick(&mut self, now: Instant) -> SessionResult<()> {
        if let Some(e) = &self.failure {
            return Err(SessionError::Encoding(e.to_string()));
        }
        let result = self.encode_until(now);
        if let Err(e) = &result {
            tracing::error!("Capture engine failed: {}", e);
            self.failure = Some(SessionError::Encoding(e.to_string()));
        }
        result
    }

    fn encode_until(&mut self, now: Instant) -> SessionResult<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(SessionError::Encoding("capture already finalized".to_string()));
        };
        let elapsed = now.saturating_duration_since(self.began);

        // Video: constant frame rate, one frame per interval since begin
        let due_frames = (elapsed.as_nanos() * self.spec.fps as u128 / NANOS_PER_SEC) as u64 + 1;
        while self.frames_encoded < due_frames {
            let timestamp = self.spec.frame_interval() * self.frames_encoded as u32;
            // copy out so the draw loop never waits on the encoder
            let frame = self.surface.snapshot();
            encoder.encode_video(&frame, timestamp)?;
            self.frames_encoded += 1;
        }

        // Audio: whatever sample frames have accumulated since the last tick
        let due_audio =
            (elapsed.as_nanos() * self.spec.audio.sample_rate as u128 / NANOS_PER_SEC) as u64;
        if due_audio > self.audio_frames {
            let samples = self.audio.pull((due_audio - self.audio_frames) as usize);
            encoder.encode_audio(&samples)?;
            self.audio_frames = due_audio;
        }

        for chunk in encoder.poll_chunks()? {
            self.on_chunk(chunk);
        }
        Ok(())
    }

    /// Flush the encoder and concatenate every buffered chunk. The chunk
    /// buffer does not outlive this call.
    pub async fn finalize(self) -> FinalizedCapture {
        let now = Instant::now();
        let (format, began_at) = (self.spec.format, self.began_at);
        match tokio::task::spawn_blocking(move || self.finalize_at(now)).await {
            Ok(finalized) => finalized,
            Err(e) => {
                tracing::error!("Capture finalize task failed: {}", e);
                FinalizedCapture {
                    artifact: RecordingArtifact {
                        data: Vec::new(),
                        format,
                        duration: Duration::ZERO,
                        chunk_count: 0,
                        timeline: RecordingTimeline::new(began_at, Duration::ZERO),
                    },
                    error: Some(SessionError::Encoding(format!("finalize failed: {}", e))),
                }
            }
        }
    }

    fn finalize_at(mut self, now: Instant) -> FinalizedCapture {
        if self.failure.is_none() {
            let _ = self.tick(now);
        }

        let mut error = self.failure.take();
        if let Some(encoder) = self.encoder.take() {
            match encoder.finish() {
                Ok(rest) => rest.into_iter().for_each(|chunk| self.on_chunk(chunk)),
                Err(e) => {
                    tracing::warn!("Encoder did not finish cleanly: {}", e);
                    error.get_or_insert(e);
                }
            }
        }

        let chunks = std::mem::take(&mut self.chunks);
        let chunk_count = chunks.len();
        let data: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        let duration = self.duration();

        tracing::info!(
            "Capture finalized: {} bytes in {} chunks, {} frames ({:.2}s)",
            data.len(),
            chunk_count,
            self.frames_encoded,
            duration.as_secs_f64()
        );

        FinalizedCapture {
            artifact: RecordingArtifact {
                data,
                format: self.spec.format,
                duration,
                chunk_count,
                timeline: RecordingTimeline::new(self.began_at, duration),
            },
            error,
        }
    }

    /// Tick at the spec's frame rate on a background task
    pub fn spawn(self, failures: mpsc::UnboundedSender<SessionError>) -> CaptureTask {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.spec.frame_interval();
        let began = self.began;
        let mut capture = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(began + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let stop = tokio::select! {
                    _ = ticker.tick() => false,
                    changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
                };
                if stop {
                    break;
                }

                let now = Instant::now();
                let ticked = tokio::task::spawn_blocking(move || {
                    let result = capture.tick(now);
                    (capture, result)
                })
                .await;
                match ticked {
                    Ok((returned, result)) => {
                        capture = returned;
                        if let Err(e) = result {
                            let _ = failures.send(e);
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = failures.send(SessionError::Encoding(format!(
                            "capture tick failed: {}",
                            e
                        )));
                        return None;
                    }
                }
            }
            Some(capture)
        });

        CaptureTask {
            stop_tx,
            task: Some(task),
        }
    }
}

/// A capture ticking in the background
pub struct CaptureTask {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Option<StreamCapture>>>,
}

impl CaptureTask {
    /// Stop ticking and hand the capture back for finalize
    pub async fn stop(&mut self) -> SessionResult<StreamCapture> {
        let _ = self.stop_tx.send(true);
        let task = self
            .task
            .take()
            .ok_or_else(|| SessionError::Encoding("capture already stopped".to_string()))?;
        task.await
            .map_err(|e| SessionError::Encoding(format!("capture task failed: {}", e)))?
            .ok_or_else(|| SessionError::Encoding("capture was lost".to_string()))
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
