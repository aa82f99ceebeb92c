//! Error types and handling
//!
//! Every failure the recording core can hit, classified by whether it is
//! fatal to the session or absorbed where it happens.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session-wide error type
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Camera or microphone denied, missing, or failing
    #[error("Camera/microphone error: {0}")]
    Device(String),

    /// Reference track could not be resolved, fetched, or decoded
    #[error("Could not load the song track: {0}")]
    ReferenceLoad(String),

    /// Reference playback was refused (autoplay policy or a dead decoder)
    #[error("Playback could not start: {0}")]
    PlaybackStart(String),

    /// A single composited frame could not be drawn
    #[error("Frame draw error: {0}")]
    FrameDraw(String),

    /// The capture engine failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Branding logo could not be loaded
    #[error("Logo load error: {0}")]
    OverlayLoad(String),

    /// The finished recording could not be handed downstream
    #[error("Hand-off error: {0}")]
    Handoff(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation not allowed while {0}")]
    InvalidState(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Already connected: {0}")]
    AlreadyConnected(String),

    #[error("Session setup cancelled")]
    Cancelled,
}

impl SessionError {
    /// Whether the error ends the session (and must reach the UI).
    ///
    /// Recoverable categories are absorbed at the component boundary where
    /// they occur and only logged.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::PlaybackStart(_)
            | SessionError::FrameDraw(_)
            | SessionError::OverlayLoad(_)
            | SessionError::AlreadyConnected(_)
            | SessionError::AlreadyRecording
            | SessionError::NotRecording
            | SessionError::InvalidState(_) => false,
            SessionError::Io(_)
            | SessionError::Serialization(_)
            | SessionError::Device(_)
            | SessionError::ReferenceLoad(_)
            | SessionError::Encoding(_)
            | SessionError::Handoff(_)
            | SessionError::Config(_)
            | SessionError::Cancelled => true,
        }
    }

    /// Stable machine-readable code for the UI
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Io(_) => "IO_ERROR",
            SessionError::Serialization(_) => "SERIALIZATION_ERROR",
            SessionError::Device(_) => "DEVICE_ERROR",
            SessionError::ReferenceLoad(_) => "REFERENCE_LOAD_ERROR",
            SessionError::PlaybackStart(_) => "PLAYBACK_START_ERROR",
            SessionError::FrameDraw(_) => "FRAME_DRAW_ERROR",
            SessionError::Encoding(_) => "ENCODING_ERROR",
            SessionError::OverlayLoad(_) => "OVERLAY_LOAD_ERROR",
            SessionError::Handoff(_) => "HANDOFF_ERROR",
            SessionError::Config(_) => "CONFIG_ERROR",
            SessionError::InvalidState(_) => "INVALID_STATE",
            SessionError::AlreadyRecording => "ALREADY_RECORDING",
            SessionError::NotRecording => "NOT_RECORDING",
            SessionError::AlreadyConnected(_) => "ALREADY_CONNECTED",
            SessionError::Cancelled => "CANCELLED",
        }
    }
}

/// Error response for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&SessionError> for ErrorResponse {
    fn from(error: &SessionError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        ErrorResponse::from(&error)
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;
