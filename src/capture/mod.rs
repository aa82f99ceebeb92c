//! Camera and microphone capture
//!
//! Platform-agnostic device traits, session-scoped acquisition, and (with
//! the `native-devices` feature) the real camera/audio backends.

pub mod acquisition;
pub mod traits;

#[cfg(feature = "native-devices")]
pub mod native;

pub use acquisition::{DeviceFaults, HardwareHandle, LiveSource, MediaAcquisition};
pub use traits::{
    AudioDeviceInfo, AudioFormat, AudioInput, CameraInfo, DeviceConstraints, FacingMode,
    MediaDevices, MonitorOutput, NullMonitor, Resolution, VideoSource,
};

#[cfg(feature = "native-devices")]
pub use native::NativeDevices;
