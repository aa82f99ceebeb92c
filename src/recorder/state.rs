//! Recording session state
//!
//! Defines the session state machine values and what the UI observes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current state of the recording session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum SessionStatus {
    /// Controller created, nothing requested yet
    #[default]
    Initializing,
    /// Waiting on camera/microphone and the reference track
    AcquiringDevices,
    /// Everything ready; waiting for the user to start
    Ready,
    /// Currently recording
    Recording,
    /// Stopping capture and releasing resources
    Finalizing,
    /// Artifact handed off; the session is over
    Complete,
    /// Unrecoverable failure, with a user-facing reason
    Error(String),
}

impl SessionStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SessionStatus::Error(_))
    }

    /// States from which no further transitions happen without a retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Error(_))
    }
}

/// Which of the two setup prerequisites are satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessFlags {
    pub camera_ready: bool,
    pub reference_ready: bool,
}

impl ReadinessFlags {
    pub fn all_ready(&self) -> bool {
        self.camera_ready && self.reference_ready
    }
}

/// Everything the UI polls
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: SessionStatus,
    /// 0-100 while finalizing
    pub progress: Option<u8>,
    /// Human-readable step text
    pub message: Option<String>,
    /// Non-fatal notice (e.g. audio blocked until the user interacts)
    pub banner: Option<String>,
    pub readiness: ReadinessFlags,
}

/// Events emitted during a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Status changed
    Status(SessionStatus),
    /// Finalize progress (percent, step text)
    Progress(u8, String),
    /// Non-fatal banner shown (`Some`) or cleared (`None`)
    Banner(Option<String>),
    /// Readiness changed
    Readiness(ReadinessFlags),
    /// Artifact handed off at this local URL
    ArtifactReady { url: String, bytes: usize },
}

/// Wall-clock bounds of a captured take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingTimeline {
    /// Unix timestamp when capture began
    pub started_at: DateTime<Utc>,

    /// Unix timestamp when capture was finalized
    pub ended_at: DateTime<Utc>,

    /// Media duration in milliseconds
    pub duration_ms: u64,
}

impl RecordingTimeline {
    pub fn new(started_at: DateTime<Utc>, duration: Duration) -> Self {
        let ended_at =
            started_at + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            started_at,
            ended_at,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_with_reason() {
        let json = serde_json::to_string(&SessionStatus::Error("camera denied".into())).unwrap();
        assert_eq!(json, r#"{"state":"error","reason":"camera denied"}"#);

        let json = serde_json::to_string(&SessionStatus::AcquiringDevices).unwrap();
        assert_eq!(json, r#"{"state":"acquiringDevices"}"#);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionStatus::Complete.is_terminal());
        assert!(SessionStatus::Error(String::new()).is_terminal());
        assert!(!SessionStatus::Finalizing.is_terminal());
    }

    #[test]
    fn test_timeline_end_matches_duration() {
        let start = Utc::now();
        let timeline = RecordingTimeline::new(start, Duration::from_millis(2_500));
        assert_eq!(timeline.duration_ms, 2_500);
        assert_eq!((timeline.ended_at - timeline.started_at).num_milliseconds(), 2_500);
    }

    #[test]
    fn test_report_is_camel_case() {
        let report = StatusReport {
            readiness: ReadinessFlags {
                camera_ready: true,
                reference_ready: false,
            },
            ..Default::default()
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["readiness"]["cameraReady"], true);
        assert!(value["banner"].is_null());
    }
}
