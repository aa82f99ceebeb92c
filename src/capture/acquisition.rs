//! Media acquisition
//!
//! Owns the camera + microphone for one session. Hardware is released on
//! every exit path: explicitly through [`MediaAcquisition::release`], or on
//! drop. Device threads report unrecoverable failures through
//! [`DeviceFaults`].

use super::traits::{AudioInput, DeviceConstraints, MediaDevices, Resolution, VideoSource};
use crate::utils::error::{SessionError, SessionResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type ReleaseFn = Box<dyn FnOnce() -> SessionResult<()> + Send>;

/// Unrecoverable hardware failures (camera unplugged, microphone gone).
/// The first report wins; later ones are ignored.
#[derive(Clone)]
pub struct DeviceFaults {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for DeviceFaults {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFaults {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn report(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.tx.send_if_modified(|fault| {
            if fault.is_some() {
                return false;
            }
            *fault = Some(reason.clone());
            true
        });
        if first {
            tracing::error!("Device failure: {}", reason);
        }
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves with the reason once a failure is reported
    pub async fn failed(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Open hardware. Releasing twice is a no-op.
pub struct HardwareHandle {
    release: Mutex<Option<ReleaseFn>>,
    released: Arc<AtomicBool>,
    faults: DeviceFaults,
}

impl HardwareHandle {
    /// `release` stops every underlying track (camera light off, mic freed)
    pub fn new(release: impl FnOnce() -> SessionResult<()> + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
            released: Arc::new(AtomicBool::new(false)),
            faults: DeviceFaults::new(),
        }
    }

    /// Share a fault channel the device threads report into
    pub fn with_faults(mut self, faults: DeviceFaults) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults(&self) -> DeviceFaults {
        self.faults.clone()
    }

    pub fn release(&self) -> SessionResult<()> {
        let release = self.release.lock().take();
        match release {
            Some(release) => {
                self.released.store(true, Ordering::SeqCst);
                release()
            }
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Observe release from elsewhere
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl Drop for HardwareHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Error releasing hardware on drop: {}", e);
        }
    }
}

/// A live camera + microphone capture
pub struct LiveSource {
    video: Arc<dyn VideoSource>,
    microphone: Option<Box<dyn AudioInput>>,
    handle: HardwareHandle,
}

impl LiveSource {
    pub fn new(
        video: Arc<dyn VideoSource>,
        microphone: Box<dyn AudioInput>,
        handle: HardwareHandle,
    ) -> Self {
        Self {
            video,
            microphone: Some(microphone),
            handle,
        }
    }

    pub fn video(&self) -> Arc<dyn VideoSource> {
        self.video.clone()
    }

    /// The raw microphone track; handed out once
    pub fn take_microphone(&mut self) -> Option<Box<dyn AudioInput>> {
        self.microphone.take()
    }

    pub fn handle(&self) -> &HardwareHandle {
        &self.handle
    }
}

/// Camera + microphone ownership for one session
pub struct MediaAcquisition {
    source: LiveSource,
}

impl MediaAcquisition {
    /// Request devices from the platform
    pub async fn acquire(
        devices: Arc<dyn MediaDevices>,
        constraints: DeviceConstraints,
    ) -> SessionResult<Self> {
        tracing::info!(
            "Requesting camera ({:?}) and microphone access",
            constraints.facing
        );

        let source = devices.acquire(&constraints).await.map_err(|e| match e {
            SessionError::Device(_) | SessionError::Cancelled => e,
            other => SessionError::Device(other.to_string()),
        })?;

        match source.video.resolution() {
            Some(res) => tracing::info!("Camera acquired at {}x{}", res.width, res.height),
            None => tracing::info!("Camera acquired, resolution not reported yet"),
        }

        Ok(Self { source })
    }

    pub fn video(&self) -> Arc<dyn VideoSource> {
        self.source.video()
    }

    pub fn take_microphone(&mut self) -> Option<Box<dyn AudioInput>> {
        self.source.take_microphone()
    }

    /// Native camera resolution if valid, else `fallback`
    pub fn surface_resolution(&self, fallback: Resolution) -> Resolution {
        self.source
            .video
            .resolution()
            .filter(Resolution::is_valid)
            .unwrap_or(fallback)
    }

    /// Stop all hardware tracks. Safe to call more than once.
    pub fn release(&self) -> SessionResult<()> {
        if self.source.handle.is_released() {
            return Ok(());
        }
        tracing::info!("Releasing camera and microphone");
        self.source.handle.release()
    }

    pub fn is_released(&self) -> bool {
        self.source.handle.is_released()
    }

    /// Failures reported by the camera or microphone after acquisition
    pub fn faults(&self) -> DeviceFaults {
        self.source.handle.faults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevices, FakeMicrophone, FakeVideo};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_double_release_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = HardwareHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        handle.release().unwrap();
        handle.release().unwrap();
        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = LiveSource::new(
            Arc::new(FakeVideo::new(8, 8)),
            Box::new(FakeMicrophone::silent(48_000, 2)),
            HardwareHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        drop(source);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_and_release_twice() {
        let devices = Arc::new(FakeDevices::granting(640, 480));
        let acquisition = MediaAcquisition::acquire(devices.clone(), DeviceConstraints::default())
            .await
            .unwrap();

        assert_eq!(
            acquisition.surface_resolution(Resolution::new(1280, 720)),
            Resolution::new(640, 480)
        );
        acquisition.release().unwrap();
        acquisition.release().unwrap();
        assert!(acquisition.is_released());
        assert_eq!(devices.releases(), 1);
    }

    #[tokio::test]
    async fn test_denied_maps_to_device_error() {
        let devices = Arc::new(FakeDevices::denying("Permission denied"));
        let err = MediaAcquisition::acquire(devices, DeviceConstraints::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Device(msg) if msg.contains("Permission denied")));
    }

    #[tokio::test]
    async fn test_first_fault_wins() {
        let faults = DeviceFaults::new();
        let handle = HardwareHandle::new(|| Ok(())).with_faults(faults.clone());
        assert!(handle.faults().current().is_none());

        let waiter = tokio::spawn({
            let faults = handle.faults();
            async move { faults.failed().await }
        });
        tokio::task::yield_now().await;
        faults.report("camera unplugged");
        faults.report("microphone gone");

        assert_eq!(waiter.await.unwrap(), "camera unplugged");
        assert_eq!(handle.faults().current().as_deref(), Some("camera unplugged"));
        // already failed: resolves straight away
        assert_eq!(faults.failed().await, "camera unplugged");
    }
}
