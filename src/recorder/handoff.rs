//! Artifact hand-off
//!
//! A finished recording is written to a short-lived local file and offered,
//! together with its `file://` URL, to whatever handles review and upload.

use super::capture::RecordingArtifact;
use crate::utils::error::{SessionError, SessionResult};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Percent-encode each path segment into a `file://` URL
pub fn file_url(path: &Path) -> String {
    let encoded: Vec<String> = path
        .to_string_lossy()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    let joined = encoded.join("/");
    if joined.starts_with('/') {
        format!("file://{}", joined)
    } else {
        format!("file:///{}", joined)
    }
}

/// The artifact on local disk. The file is removed when this is dropped.
#[derive(Debug)]
pub struct LocalRecording {
    path: TempPath,
    url: String,
}

impl LocalRecording {
    /// Write `artifact` to a temp file in `dir` (system temp dir if `None`)
    pub fn write(artifact: &RecordingArtifact, dir: Option<&Path>) -> SessionResult<Self> {
        let suffix = format!(".{}", artifact.format.extension());
        let mut builder = tempfile::Builder::new();
        builder.prefix("karaoke-take-").suffix(&suffix);
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| SessionError::Handoff(format!("Failed to create recording file: {}", e)))?;

        file.write_all(&artifact.data)
            .and_then(|_| file.flush())
            .map_err(|e| SessionError::Handoff(format!("Failed to write recording: {}", e)))?;

        let path = file.into_temp_path();
        let url = file_url(&path);
        tracing::info!("Recording written to {} ({} bytes)", url, artifact.len());
        Ok(Self { path, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file past this handle's lifetime
    pub fn persist(self) -> SessionResult<PathBuf> {
        self.path
            .keep()
            .map_err(|e| SessionError::Handoff(format!("Failed to keep recording: {}", e)))
    }
}

/// Everything the review stage receives
#[derive(Debug)]
pub struct ArtifactHandoff {
    pub session_id: Uuid,
    pub event_id: Option<String>,
    pub song_id: String,
    pub artifact: RecordingArtifact,
    pub local: LocalRecording,
}

impl ArtifactHandoff {
    /// Playable local reference
    pub fn url(&self) -> &str {
        self.local.url()
    }
}

/// Receiver of finished recordings (review, upload, link generation)
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(&self, handoff: ArtifactHandoff) -> anyhow::Result<()>;
}

/// Forwards hand-offs over a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ArtifactHandoff>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ArtifactHandoff>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ArtifactSink for ChannelSink {
    async fn deliver(&self, handoff: ArtifactHandoff) -> anyhow::Result<()> {
        self.tx
            .send(handoff)
            .map_err(|_| anyhow::anyhow!("review stage is no longer listening"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::capture::CaptureFormat;
    use crate::recorder::state::RecordingTimeline;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn artifact() -> RecordingArtifact {
        RecordingArtifact {
            data: vec![0x1a, 0x45, 0xdf, 0xa3],
            format: CaptureFormat::WebmVp8Opus,
            duration: Duration::from_secs(1),
            chunk_count: 1,
            timeline: RecordingTimeline::new(Utc::now(), Duration::from_secs(1)),
        }
    }

    #[test]
    fn test_file_url_encodes_segments() {
        assert_eq!(
            file_url(Path::new("/tmp/my takes/song #1.webm")),
            "file:///tmp/my%20takes/song%20%231.webm"
        );
    }

    #[test]
    fn test_local_recording_lives_until_dropped() {
        let dir = tempdir().unwrap();
        let local = LocalRecording::write(&artifact(), Some(dir.path())).unwrap();
        let path = local.path().to_path_buf();

        assert!(local.url().starts_with("file://"));
        assert!(local.url().ends_with(".webm"));
        assert_eq!(std::fs::read(&path).unwrap(), artifact().data);

        drop(local);
        assert!(!path.exists());
    }

    #[test]
    fn test_persist_keeps_file() {
        let dir = tempdir().unwrap();
        let local = LocalRecording::write(&artifact(), Some(dir.path())).unwrap();
        let path = local.persist().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let dir = tempdir().unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let local = LocalRecording::write(&artifact(), Some(dir.path())).unwrap();
        sink.deliver(ArtifactHandoff {
            session_id: Uuid::new_v4(),
            event_id: None,
            song_id: "song".into(),
            artifact: artifact(),
            local,
        })
        .await
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.song_id, "song");
        assert!(received.url().starts_with("file://"));

        drop(rx);
        let local = LocalRecording::write(&artifact(), Some(dir.path())).unwrap();
        let closed = sink
            .deliver(ArtifactHandoff {
                session_id: Uuid::new_v4(),
                event_id: None,
                song_id: "song".into(),
                artifact: artifact(),
                local,
            })
            .await;
        assert!(closed.is_err());
    }
}
