//! Native camera and audio devices
//!
//! Camera frames come from nokhwa on a dedicated thread; microphone input
//! and the monitor output go through cpal streams, each kept alive on its
//! own thread because cpal streams are not `Send` on every host.

use super::acquisition::{DeviceFaults, HardwareHandle, LiveSource};
use super::traits::{
    AudioDeviceInfo, AudioFormat, AudioInput, CameraInfo, DeviceConstraints, FacingMode,
    MediaDevices, MonitorOutput, Resolution, VideoSource,
};
use crate::compositor::frame::Frame;
use crate::utils::error::{SessionError, SessionResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

/// Cap on buffered audio, in seconds
const MAX_BUFFERED_SECS: usize = 2;
/// Consecutive failed reads before the camera counts as lost
const CAMERA_FAILURE_LIMIT: u64 = 90;

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

fn push_bounded(queue: &SampleQueue, samples: impl IntoIterator<Item = f32>, cap: usize) {
    let mut queue = queue.lock();
    queue.extend(samples);
    let excess = queue.len().saturating_sub(cap);
    if excess > 0 {
        queue.drain(..excess);
    }
}

/// Latest camera frame, shared with the capture thread
struct CameraFeed {
    resolution: RwLock<Option<Resolution>>,
    frame: RwLock<Option<Arc<Frame>>>,
}

impl VideoSource for CameraFeed {
    fn resolution(&self) -> Option<Resolution> {
        *self.resolution.read()
    }

    fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.frame.read().clone()
    }
}

/// Microphone samples delivered by the cpal callback
struct MicrophoneInput {
    format: AudioFormat,
    queue: SampleQueue,
}

impl AudioInput for MicrophoneInput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        let mut queue = self.queue.lock();
        let n = out.len().min(queue.len());
        for (slot, sample) in out.iter_mut().zip(queue.drain(..n)) {
            *slot = sample;
        }
        n
    }
}

/// Name hints for which way a camera faces
fn looks_front_facing(name: &str) -> bool {
    let name = name.to_lowercase();
    if ["back", "rear", "environment"].iter().any(|hint| name.contains(hint)) {
        return false;
    }
    true
}

/// Explicit id first, then the first camera facing the requested way,
/// then the first camera
fn camera_index(constraints: &DeviceConstraints, cameras: &[CameraInfo]) -> CameraIndex {
    if let Some(id) = &constraints.camera_id {
        return match id.parse::<u32>() {
            Ok(index) => CameraIndex::Index(index),
            Err(_) => CameraIndex::String(id.clone()),
        };
    }
    let want_front = constraints.facing == FacingMode::User;
    cameras
        .iter()
        .find(|camera| camera.front_facing == want_front)
        .map(|camera| match camera.id.parse::<u32>() {
            Ok(index) => CameraIndex::Index(index),
            Err(_) => CameraIndex::String(camera.id.clone()),
        })
        .unwrap_or(CameraIndex::Index(0))
}

fn spawn_camera(
    index: CameraIndex,
    feed: Arc<CameraFeed>,
    running: Arc<AtomicBool>,
    faults: DeviceFaults,
    ready: oneshot::Sender<SessionResult<()>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let format =
            RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestResolution);
        let mut camera = match Camera::new(index.clone(), format) {
            Ok(camera) => camera,
            Err(e) => {
                let _ = ready.send(Err(SessionError::Device(format!(
                    "failed to open camera {:?}: {}",
                    index, e
                ))));
                return;
            }
        };
        if let Err(e) = camera.open_stream() {
            let _ = ready.send(Err(SessionError::Device(format!(
                "failed to open camera stream: {}",
                e
            ))));
            return;
        }

        let native = camera.resolution();
        *feed.resolution.write() = Some(Resolution::new(native.width(), native.height()));
        tracing::info!(
            "Camera opened: {}x{} @ {}fps",
            native.width(),
            native.height(),
            camera.frame_rate()
        );
        let _ = ready.send(Ok(()));

        let mut failures: u64 = 0;
        let mut consecutive: u64 = 0;
        while running.load(Ordering::SeqCst) {
            let decoded = camera
                .frame()
                .and_then(|buffer| buffer.decode_image::<RgbAFormat>());
            match decoded {
                Ok(image) => {
                    consecutive = 0;
                    let (width, height) = (image.width(), image.height());
                    match Frame::from_rgba(width, height, image.into_raw()) {
                        Ok(frame) => *feed.frame.write() = Some(Arc::new(frame)),
                        Err(e) => tracing::debug!("Dropping camera frame: {}", e),
                    }
                }
                Err(e) => {
                    failures += 1;
                    consecutive += 1;
                    if failures == 1 || failures % 100 == 0 {
                        tracing::warn!("Camera frame failed ({} so far): {}", failures, e);
                    }
                    if consecutive >= CAMERA_FAILURE_LIMIT {
                        faults.report(format!("camera stopped delivering frames: {}", e));
                        break;
                    }
                }
            }
        }

        if let Err(e) = camera.stop_stream() {
            tracing::warn!("Error stopping camera stream: {}", e);
        }
        tracing::info!("Camera capture thread stopped");
    })
}

fn sample_i16(sample: i16) -> f32 {
    sample as f32 / 32_768.0
}

fn sample_u16(sample: u16) -> f32 {
    (sample as f32 - 32_768.0) / 32_768.0
}

/// Sample formats the microphone path converts to f32
fn supported_input_format(format: SampleFormat) -> SessionResult<SampleFormat> {
    match format {
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16 => Ok(format),
        other => Err(SessionError::Device(format!(
            "unsupported microphone sample format {:?}",
            other
        ))),
    }
}

/// Stream errors after start: a vanished device is fatal, the rest are logged
fn microphone_errors(faults: DeviceFaults) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => faults.report("microphone disconnected"),
        other => tracing::error!("Microphone stream error: {}", other),
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    queue: SampleQueue,
    cap: usize,
    faults: DeviceFaults,
) -> SessionResult<cpal::Stream> {
    let stream = match supported_input_format(sample_format)? {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_bounded(&queue, data.iter().map(|&s| sample_i16(s)), cap)
            },
            microphone_errors(faults),
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                push_bounded(&queue, data.iter().map(|&s| sample_u16(s)), cap)
            },
            microphone_errors(faults),
            None,
        ),
        _ => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_bounded(&queue, data.iter().copied(), cap)
            },
            microphone_errors(faults),
            None,
        ),
    };
    stream.map_err(|e| SessionError::Device(format!("failed to build microphone stream: {}", e)))
}

fn spawn_microphone(
    running: Arc<AtomicBool>,
    queue: SampleQueue,
    faults: DeviceFaults,
    ready: oneshot::Sender<SessionResult<AudioFormat>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = ready.send(Err(SessionError::Device("no microphone found".to_string())));
            return;
        };
        let supported = match device.default_input_config() {
            Ok(config) => config,
            Err(e) => {
                let _ = ready.send(Err(SessionError::Device(format!(
                    "microphone config unavailable: {}",
                    e
                ))));
                return;
            }
        };
        let config = supported.config();
        let format = AudioFormat::new(config.sample_rate.0, config.channels);
        let cap = format.samples_for_frames(format.sample_rate as usize * MAX_BUFFERED_SECS);

        let stream = build_input_stream(
            &device,
            &config,
            supported.sample_format(),
            queue,
            cap,
            faults,
        )
        .and_then(|stream| {
            stream.play().map(|_| stream).map_err(|e| {
                SessionError::Device(format!("failed to start microphone: {}", e))
            })
        });
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        tracing::info!(
            "Microphone started: {} ({}Hz, {}ch)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            format.sample_rate,
            format.channels
        );
        let _ = ready.send(Ok(format));

        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        drop(stream);
        tracing::info!("Microphone stream stopped");
    })
}

/// Plays the reference track on the default speaker
struct SpeakerMonitor {
    queue: SampleQueue,
    cap: usize,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SpeakerMonitor {
    fn open(format: AudioFormat) -> Self {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));
        let cap = format.samples_for_frames(format.sample_rate as usize * MAX_BUFFERED_SECS);

        let thread = {
            let queue = queue.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    tracing::warn!("No speaker found, the reference track will be silent");
                    return;
                };
                let config = StreamConfig {
                    channels: format.channels,
                    sample_rate: cpal::SampleRate(format.sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                let stream = device.build_output_stream(
                    &config,
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = queue.lock();
                        for slot in out.iter_mut() {
                            *slot = queue.pop_front().unwrap_or(0.0);
                        }
                    },
                    |err| tracing::error!("Speaker stream error: {}", err),
                    None,
                );
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("Failed to open speaker output: {}", e);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    tracing::warn!("Failed to start speaker output: {}", e);
                    return;
                }
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
        };

        Self {
            queue,
            cap,
            running,
            thread: Some(thread),
        }
    }
}

impl MonitorOutput for SpeakerMonitor {
    fn write(&mut self, samples: &[f32], _format: AudioFormat) {
        push_bounded(&self.queue, samples.iter().copied(), self.cap);
    }
}

impl Drop for SpeakerMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The machine's default camera, microphone and speaker
#[derive(Debug, Default)]
pub struct NativeDevices;

impl NativeDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for NativeDevices {
    async fn acquire(&self, constraints: &DeviceConstraints) -> SessionResult<LiveSource> {
        let running = Arc::new(AtomicBool::new(true));
        let feed = Arc::new(CameraFeed {
            resolution: RwLock::new(None),
            frame: RwLock::new(None),
        });
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let faults = DeviceFaults::new();

        let (camera_tx, camera_rx) = oneshot::channel();
        let (mic_tx, mic_rx) = oneshot::channel();
        let threads = vec![
            spawn_camera(
                camera_index(constraints, &self.cameras()),
                feed.clone(),
                running.clone(),
                faults.clone(),
                camera_tx,
            ),
            spawn_microphone(running.clone(), queue.clone(), faults.clone(), mic_tx),
        ];

        // Dropping this handle (an abandoned acquire) stops both threads
        let handle = {
            let running = running.clone();
            HardwareHandle::new(move || {
                running.store(false, Ordering::SeqCst);
                for thread in threads {
                    if thread.join().is_err() {
                        return Err(SessionError::Device("capture thread panicked".to_string()));
                    }
                }
                Ok(())
            })
            .with_faults(faults)
        };

        let closed = || SessionError::Device("capture thread exited".to_string());
        camera_rx.await.map_err(|_| closed())??;
        let format = mic_rx.await.map_err(|_| closed())??;

        Ok(LiveSource::new(
            feed,
            Box::new(MicrophoneInput { format, queue }),
            handle,
        ))
    }

    fn monitor_output(&self, format: AudioFormat) -> Box<dyn MonitorOutput> {
        Box::new(SpeakerMonitor::open(format))
    }

    fn cameras(&self) -> Vec<CameraInfo> {
        match nokhwa::query(ApiBackend::Auto) {
            Ok(cameras) => cameras
                .into_iter()
                .map(|info| {
                    let name = info.human_name().to_string();
                    CameraInfo {
                        id: match info.index() {
                            CameraIndex::Index(i) => i.to_string(),
                            CameraIndex::String(s) => s.to_string(),
                        },
                        front_facing: looks_front_facing(&name),
                        name,
                    }
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate cameras: {}", e);
                Vec::new()
            }
        }
    }

    fn microphones(&self) -> Vec<AudioDeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        match host.input_devices() {
            Ok(devices) => devices
                .filter_map(|device| device.name().ok())
                .map(|name| AudioDeviceInfo {
                    id: name.clone(),
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    is_input: true,
                    name,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate microphones: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_queue_keeps_newest() {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        push_bounded(&queue, (0..10).map(|i| i as f32), 4);
        assert_eq!(queue.lock().iter().copied().collect::<Vec<_>>(), vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_microphone_reads_what_is_buffered() {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::from(vec![0.5; 3])));
        let mut mic = MicrophoneInput {
            format: AudioFormat::new(48_000, 1),
            queue,
        };
        let mut out = [0.0; 8];
        assert_eq!(mic.read(&mut out), 3);
        assert_eq!(mic.read(&mut out), 0);
    }

    #[test]
    fn test_integer_samples_are_normalized() {
        assert_eq!(sample_i16(i16::MIN), -1.0);
        assert_eq!(sample_i16(0), 0.0);
        assert_eq!(sample_u16(0), -1.0);
        assert_eq!(sample_u16(32_768), 0.0);

        for format in [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16] {
            assert_eq!(supported_input_format(format).unwrap(), format);
        }
        let err = supported_input_format(SampleFormat::U8).unwrap_err();
        assert!(matches!(err, SessionError::Device(msg) if msg.contains("U8")));
    }

    #[test]
    fn test_camera_selection() {
        let cameras = vec![
            CameraInfo {
                id: "0".into(),
                name: "Back Camera".into(),
                front_facing: looks_front_facing("Back Camera"),
            },
            CameraInfo {
                id: "1".into(),
                name: "FaceTime HD Camera".into(),
                front_facing: looks_front_facing("FaceTime HD Camera"),
            },
        ];
        let mut constraints = DeviceConstraints::default();
        assert!(matches!(camera_index(&constraints, &cameras), CameraIndex::Index(1)));
        assert!(matches!(camera_index(&constraints, &[]), CameraIndex::Index(0)));

        constraints.facing = FacingMode::Environment;
        assert!(matches!(camera_index(&constraints, &cameras), CameraIndex::Index(0)));

        constraints.camera_id = Some("usb-cam".into());
        assert!(matches!(camera_index(&constraints, &cameras), CameraIndex::String(_)));
    }
}
