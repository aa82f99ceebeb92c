//! FFmpeg streaming encoder
//!
//! Raw RGBA frames go to ffmpeg's stdin, interleaved f32 audio over a
//! loopback TCP socket (ffmpeg opens its inputs in order, so audio can't
//! share the pipe). The muxed container is read back from stdout in chunks
//! as ffmpeg produces them. Each pipe has its own thread so a slow reader
//! never stalls a writer.

use super::capture::{CaptureFormat, EncoderFactory, EncoderSpec, MediaEncoder};
use crate::compositor::frame::Frame;
use crate::utils::error::{SessionError, SessionResult};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Frames queued for ffmpeg before the capture blocks on it
const VIDEO_QUEUE_DEPTH: usize = 8;
const READ_CHUNK_SIZE: usize = 64 * 1024;
const AUDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Encoders each format needs
fn required_encoders(format: CaptureFormat) -> [&'static str; 2] {
    match format {
        CaptureFormat::WebmVp8Opus => ["libvpx", "libopus"],
        CaptureFormat::WebmVp9Opus => ["libvpx-vp9", "libopus"],
        CaptureFormat::Mp4H264Aac => ["libx264", "aac"],
    }
}

/// Output arguments for each format, streamable without seeking
fn codec_args(format: CaptureFormat) -> Vec<&'static str> {
    match format {
        CaptureFormat::WebmVp8Opus => vec![
            "-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "8", "-b:v", "2M",
            "-c:a", "libopus", "-b:a", "128k", "-f", "webm",
        ],
        CaptureFormat::WebmVp9Opus => vec![
            "-c:v", "libvpx-vp9", "-deadline", "realtime", "-cpu-used", "8", "-row-mt", "1",
            "-b:v", "2M", "-c:a", "libopus", "-b:a", "128k", "-f", "webm",
        ],
        CaptureFormat::Mp4H264Aac => vec![
            "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency", "-pix_fmt",
            "yuv420p", "-c:a", "aac", "-b:a", "128k", "-movflags",
            "frag_keyframe+empty_moov+default_base_moof", "-f", "mp4",
        ],
    }
}

/// Encoder names from `ffmpeg -encoders` output
fn parse_encoder_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// Spawns ffmpeg encoders
pub struct FfmpegEncoderFactory {
    ffmpeg: String,
    encoders: OnceLock<Vec<String>>,
}

impl Default for FfmpegEncoderFactory {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegEncoderFactory {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            encoders: OnceLock::new(),
        }
    }

    fn available_encoders(&self) -> &[String] {
        self.encoders.get_or_init(|| {
            match Command::new(&self.ffmpeg)
                .args(["-hide_banner", "-encoders"])
                .output()
            {
                Ok(output) if output.status.success() => {
                    parse_encoder_list(&String::from_utf8_lossy(&output.stdout))
                }
                Ok(output) => {
                    tracing::warn!("ffmpeg -encoders failed with {}", output.status);
                    Vec::new()
                }
                Err(e) => {
                    tracing::warn!("FFmpeg not available: {}", e);
                    Vec::new()
                }
            }
        })
    }

    fn build_args(spec: &EncoderSpec, audio_port: u16) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            // Input 0: raw video on stdin
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        args.push(format!("{}x{}", spec.width, spec.height));
        args.extend(["-r".to_string(), spec.fps.to_string()]);
        args.extend(["-i".to_string(), "pipe:0".to_string()]);

        // Input 1: raw audio from the loopback socket
        args.extend([
            "-f".to_string(),
            "f32le".to_string(),
            "-ar".to_string(),
            spec.audio.sample_rate.to_string(),
            "-ac".to_string(),
            spec.audio.channels.to_string(),
            "-i".to_string(),
            format!("tcp://127.0.0.1:{}", audio_port),
        ]);

        args.extend(["-map", "0:v", "-map", "1:a"].map(String::from));
        args.extend(codec_args(spec.format).into_iter().map(String::from));
        args.push("pipe:1".to_string());
        args
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn supports(&self, format: CaptureFormat) -> bool {
        let available = self.available_encoders();
        required_encoders(format)
            .iter()
            .all(|needed| available.iter().any(|have| have == needed))
    }

    fn create(&self, spec: &EncoderSpec) -> SessionResult<Box<dyn MediaEncoder>> {
        Ok(Box::new(FfmpegEncoder::start(&self.ffmpeg, spec)?))
    }
}

/// A running ffmpeg encode
pub struct FfmpegEncoder {
    process: Child,
    video_tx: Option<SyncSender<Vec<u8>>>,
    audio_tx: Option<Sender<Vec<u8>>>,
    chunks_rx: Receiver<Vec<u8>>,
    writers: Vec<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    stderr: Arc<Mutex<String>>,
    frame_size: usize,
}

impl FfmpegEncoder {
    pub fn start(ffmpeg: &str, spec: &EncoderSpec) -> SessionResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| SessionError::Encoding(format!("Failed to open audio socket: {}", e)))?;
        let port = listener.local_addr()?.port();
        let args = FfmpegEncoderFactory::build_args(spec, port);

        tracing::info!("Starting FFmpeg encoder: {:?}", args);

        let mut process = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::Encoding(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let mut stdin = process
            .stdin
            .take()
            .ok_or_else(|| SessionError::Encoding("Failed to capture FFmpeg stdin".to_string()))?;
        let mut stdout = process
            .stdout
            .take()
            .ok_or_else(|| SessionError::Encoding("Failed to capture FFmpeg stdout".to_string()))?;
        let mut stderr_pipe = process
            .stderr
            .take()
            .ok_or_else(|| SessionError::Encoding("Failed to capture FFmpeg stderr".to_string()))?;

        let stderr = Arc::new(Mutex::new(String::new()));
        let stderr_sink = stderr.clone();
        std::thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr_pipe.read_to_string(&mut text);
            stderr_sink.lock().push_str(&text);
        });

        // Video writer
        let (video_tx, video_rx) = mpsc::sync_channel::<Vec<u8>>(VIDEO_QUEUE_DEPTH);
        let video_writer = std::thread::spawn(move || {
            for frame in video_rx {
                if let Err(e) = stdin.write_all(&frame) {
                    tracing::warn!("FFmpeg video pipe closed: {}", e);
                    return;
                }
            }
            // dropping stdin signals end of video
        });

        // Audio writer: waits for ffmpeg to connect, then streams samples
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>();
        let audio_writer = std::thread::spawn(move || {
            let Some(mut socket) = accept_with_timeout(&listener, AUDIO_CONNECT_TIMEOUT) else {
                tracing::warn!("FFmpeg never connected to the audio socket");
                return;
            };
            for block in audio_rx {
                if let Err(e) = socket.write_all(&block) {
                    tracing::warn!("FFmpeg audio socket closed: {}", e);
                    return;
                }
            }
            let _ = socket.shutdown(std::net::Shutdown::Write);
        });

        // Container reader
        let (chunks_tx, chunks_rx) = mpsc::channel::<Vec<u8>>();
        let reader = std::thread::spawn(move || {
            let mut buffer = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match stdout.read(&mut buffer) {
                    Ok(0) => return,
                    Ok(n) => {
                        if chunks_tx.send(buffer[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("Failed to read FFmpeg output: {}", e);
                        return;
                    }
                }
            }
        });

        Ok(Self {
            process,
            video_tx: Some(video_tx),
            audio_tx: Some(audio_tx),
            chunks_rx,
            writers: vec![video_writer, audio_writer],
            reader: Some(reader),
            stderr,
            frame_size: (spec.width as usize) * (spec.height as usize) * 4,
        })
    }

    fn failure(&mut self, context: &str) -> SessionError {
        // give the stderr reader a moment once the process is gone
        let _ = self.process.try_wait();
        let detail = self.stderr.lock().trim().to_string();
        if detail.is_empty() {
            SessionError::Encoding(context.to_string())
        } else {
            SessionError::Encoding(format!("{}: {}", context, detail))
        }
    }

    fn check_alive(&mut self) -> SessionResult<()> {
        match self.process.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(self.failure(&format!("FFmpeg exited early ({})", status))),
            Err(e) => Err(SessionError::Encoding(format!("Failed to poll FFmpeg: {}", e))),
        }
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        self.chunks_rx.try_iter().collect()
    }
}

fn accept_with_timeout(listener: &TcpListener, timeout: Duration) -> Option<TcpStream> {
    if listener.set_nonblocking(true).is_err() {
        return listener.accept().ok().map(|(socket, _)| socket);
    }
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match listener.accept() {
            Ok((socket, _)) => {
                let _ = socket.set_nonblocking(false);
                return Some(socket);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5))
            }
            Err(e) => {
                tracing::warn!("Audio socket accept failed: {}", e);
                return None;
            }
        }
    }
    None
}

impl MediaEncoder for FfmpegEncoder {
    fn encode_video(&mut self, frame: &Frame, _timestamp: Duration) -> SessionResult<()> {
        // constant frame rate input; ffmpeg derives timestamps from -r
        if frame.data().len() != self.frame_size {
            return Err(SessionError::Encoding(format!(
                "frame is {} bytes, encoder expects {}",
                frame.data().len(),
                self.frame_size
            )));
        }
        let sent = self
            .video_tx
            .as_ref()
            .map(|tx| tx.send(frame.data().to_vec()).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(self.failure("FFmpeg stopped accepting video"));
        }
        Ok(())
    }

    fn encode_audio(&mut self, samples: &[f32]) -> SessionResult<()> {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let sent = self
            .audio_tx
            .as_ref()
            .map(|tx| tx.send(bytes).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(self.failure("FFmpeg stopped accepting audio"));
        }
        Ok(())
    }

    fn poll_chunks(&mut self) -> SessionResult<Vec<Vec<u8>>> {
        let chunks = self.drain();
        self.check_alive()?;
        Ok(chunks)
    }

    fn finish(mut self: Box<Self>) -> SessionResult<Vec<Vec<u8>>> {
        // Close both inputs so ffmpeg flushes and exits
        self.video_tx.take();
        self.audio_tx.take();
        for writer in self.writers.drain(..) {
            let _ = writer.join();
        }

        let status = self
            .process
            .wait()
            .map_err(|e| SessionError::Encoding(format!("Failed to wait for FFmpeg: {}", e)))?;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let chunks = self.drain();

        if !status.success() {
            return Err(self.failure(&format!("FFmpeg encoding failed ({})", status)));
        }
        tracing::info!("FFmpeg encoder finished");
        Ok(chunks)
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Ok(None) = self.process.try_wait() {
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::AudioFormat;

    #[test]
    fn test_parse_encoder_list() {
        let output = "Encoders:\n V..... = Video\n ------\n V....D libx264              libx264 H.264\n V....D libvpx               libvpx VP8\n A....D libopus              libopus Opus\n";
        let encoders = parse_encoder_list(output);
        assert_eq!(encoders, vec!["libx264", "libvpx", "libopus"]);
    }

    #[test]
    fn test_args_map_both_inputs() {
        let spec = EncoderSpec {
            format: CaptureFormat::WebmVp8Opus,
            width: 640,
            height: 480,
            fps: 30,
            audio: AudioFormat::new(48_000, 2),
        };
        let args = FfmpegEncoderFactory::build_args(&spec, 4567);
        let joined = args.join(" ");
        assert!(joined.contains("-s 640x480 -r 30 -i pipe:0"));
        assert!(joined.contains("-ar 48000 -ac 2 -i tcp://127.0.0.1:4567"));
        assert!(joined.contains("-c:v libvpx "));
        assert!(joined.ends_with("-f webm pipe:1"));
    }

    #[test]
    fn test_missing_binary_supports_nothing() {
        let factory = FfmpegEncoderFactory::new("/nonexistent/ffmpeg");
        assert!(!factory.supports(CaptureFormat::WebmVp8Opus));
        assert!(!factory.supports(CaptureFormat::Mp4H264Aac));
    }
}
