//! Audio mixing
//!
//! Routes microphone and reference-track audio into one mixed track,
//! independent of what is composited visually.

pub mod convert;
pub mod mixer;

pub use convert::ConvertedInput;
pub use mixer::{AudioMixer, MixedAudioOutput, MixerSettings};
