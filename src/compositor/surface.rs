//! The composite drawing target.
//!
//! `CompositeSurface` is the only writer and is owned by the compositor;
//! `SurfaceReader` handles are read-only views given to the capture side.

use super::frame::Frame;
use crate::utils::error::{SessionError, SessionResult};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct SurfaceShared {
    frame: RwLock<Frame>,
    /// Bumped after every completed frame
    generation: AtomicU64,
}

/// Exclusive write side of the composite surface. Not `Clone`.
pub struct CompositeSurface {
    shared: Arc<SurfaceShared>,
}

impl CompositeSurface {
    /// Dimensions are fixed for the surface lifetime and must be non-zero.
    pub fn new(width: u32, height: u32) -> SessionResult<Self> {
        if width == 0 || height == 0 {
            return Err(SessionError::Config(format!(
                "Composite surface needs non-zero dimensions, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            shared: Arc::new(SurfaceShared {
                frame: RwLock::new(Frame::new(width, height)),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.shared.frame.read().dimensions()
    }

    /// A read-only view for the capture side
    pub fn reader(&self) -> SurfaceReader {
        SurfaceReader {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn lock(&self) -> RwLockWriteGuard<'_, Frame> {
        self.shared.frame.write()
    }

    pub(crate) fn publish(&self) {
        self.shared.generation.fetch_add(1, Ordering::Release);
    }
}

/// Read-only handle to the composite surface
#[derive(Clone)]
pub struct SurfaceReader {
    shared: Arc<SurfaceShared>,
}

impl SurfaceReader {
    pub fn dimensions(&self) -> (u32, u32) {
        self.shared.frame.read().dimensions()
    }

    /// Number of frames completed so far
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Copy of the current surface contents
    pub fn snapshot(&self) -> Frame {
        self.shared.frame.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::frame::Color;

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(CompositeSurface::new(0, 720).is_err());
        assert!(CompositeSurface::new(1280, 0).is_err());
    }

    #[test]
    fn test_reader_sees_published_writes() {
        let surface = CompositeSurface::new(4, 4).unwrap();
        let reader = surface.reader();
        assert_eq!(reader.generation(), 0);

        surface.lock().clear(Color::WHITE);
        surface.publish();

        assert_eq!(reader.generation(), 1);
        assert_eq!(reader.snapshot().pixel(3, 3), [255, 255, 255, 255]);
        assert_eq!(reader.dimensions(), (4, 4));
    }
}
