//! Karaoke Studio - live camera + reference-track recording.
//!
//! This is the main library crate. It composites the performer's camera
//! with a reference video and event branding, mixes the microphone with the
//! backing track, captures both into one recording and hands it off for
//! review.

pub mod audio;
pub mod capture;
pub mod compositor;
pub mod recorder;
pub mod reference;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use recorder::{
    RecordingSessionController, SessionConfig, SessionDependencies, SessionEvent, SessionStatus,
    StatusReport,
};
pub use utils::error::{ErrorResponse, SessionError, SessionResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber.
///
/// Honors `RUST_LOG`; a subscriber installed earlier by the host wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "karaoke_studio_lib=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    tracing::info!("Karaoke Studio v{}", env!("CARGO_PKG_VERSION"));
}
