//! Per-frame compositing
//!
//! Each frame: clear, draw the live source mirrored, draw the reference
//! video translucently on top, then the branding overlay in the top-right
//! corner. Frames are composed off-surface and swapped in only when every
//! layer drew, so a frame that fails is skipped without touching what the
//! capture side reads.

use super::effects::{EffectsSource, SourceKind};
use super::frame::{Color, DrawOptions, Frame, Rect};
use super::overlay::BrandingOverlay;
use super::surface::{CompositeSurface, SurfaceReader};
use crate::capture::traits::VideoSource;
use crate::reference::ReferencePlayer;
use crate::utils::error::SessionResult;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Visual parameters of the composite
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositorSettings {
    pub fps: u32,
    pub mirror_camera: bool,
    /// Opacity of the reference video layer
    pub reference_opacity: f32,
    /// Logo width as a fraction of the surface width
    pub logo_width_ratio: f32,
    /// Distance of the logo box from the top and right edges
    pub logo_margin: u32,
    pub logo_padding: u32,
    pub logo_backing: Color,
    pub logo_border: Color,
    pub logo_border_width: u32,
    pub background: Color,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            mirror_camera: true,
            reference_opacity: 0.4,
            logo_width_ratio: 0.2,
            logo_margin: 16,
            logo_padding: 8,
            logo_backing: Color::rgba(0, 0, 0, 150),
            logo_border: Color::rgba(255, 255, 255, 200),
            logo_border_width: 2,
            background: Color::BLACK,
        }
    }
}

impl CompositorSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.fps.max(1) as u64)
    }
}

/// What ended up on the surface for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameOutcome {
    pub live: Option<SourceKind>,
    pub reference: bool,
    pub logo: bool,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompositorStats {
    pub frames_drawn: u64,
    pub frames_failed: u64,
}

#[derive(Default)]
struct Counters {
    drawn: AtomicU64,
    failed: AtomicU64,
}

/// Draws the layered composite onto the surface it owns
pub struct FrameCompositor {
    surface: CompositeSurface,
    /// Back buffer the next frame is composed into
    scratch: Mutex<Frame>,
    camera: Arc<dyn VideoSource>,
    effects: Arc<dyn EffectsSource>,
    active: Arc<RwLock<SourceKind>>,
    reference: Arc<dyn ReferencePlayer>,
    overlay: Arc<BrandingOverlay>,
    settings: CompositorSettings,
    counters: Arc<Counters>,
}

impl FrameCompositor {
    pub fn new(
        surface: CompositeSurface,
        camera: Arc<dyn VideoSource>,
        effects: Arc<dyn EffectsSource>,
        active: Arc<RwLock<SourceKind>>,
        reference: Arc<dyn ReferencePlayer>,
        overlay: Arc<BrandingOverlay>,
        settings: CompositorSettings,
    ) -> Self {
        let (width, height) = surface.dimensions();
        Self {
            surface,
            scratch: Mutex::new(Frame::new(width, height)),
            camera,
            effects,
            active,
            reference,
            overlay,
            settings,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn reader(&self) -> SurfaceReader {
        self.surface.reader()
    }

    pub fn stats(&self) -> CompositorStats {
        CompositorStats {
            frames_drawn: self.counters.drawn.load(Ordering::Relaxed),
            frames_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Primary layer for this tick, falling back to the raw camera when the
    /// effects source has nothing (or fails)
    fn live_frame(&self) -> Option<(SourceKind, Arc<Frame>)> {
        if *self.active.read() == SourceKind::FilteredCamera {
            match self.effects.frame(self.camera.as_ref()) {
                Ok(Some(frame)) => return Some((SourceKind::FilteredCamera, frame)),
                Ok(None) => {}
                Err(e) => tracing::debug!(
                    "Effects source {} unavailable, drawing raw camera: {}",
                    self.effects.name(),
                    e
                ),
            }
        }
        self.camera
            .latest_frame()
            .map(|frame| (SourceKind::Camera, frame))
    }

    /// Box for the logo: top-right, ~`logo_width_ratio` of the surface width
    fn logo_rect(&self, logo: &Frame, surface_width: u32) -> Rect {
        let width = ((surface_width as f32 * self.settings.logo_width_ratio) as u32).max(1);
        let height = if logo.width() == 0 {
            width
        } else {
            ((width as u64 * logo.height() as u64) / logo.width() as u64).max(1) as u32
        };
        let x = surface_width as i32 - self.settings.logo_margin as i32 - width as i32;
        Rect::new(x, self.settings.logo_margin as i32, width, height)
    }

    /// Draw one composite frame
    pub fn render_frame(&self) -> SessionResult<FrameOutcome> {
        let mut outcome = FrameOutcome::default();
        let live = self.live_frame();
        let reference = self.reference.current_frame();
        let logo = self.overlay.current();

        let mut canvas = self.scratch.lock();
        let surface_width = canvas.width();

        // 1. Clear
        canvas.clear(self.settings.background);

        // 2. Live source, mirrored
        if let Some((kind, frame)) = live {
            canvas.draw_scaled(
                &frame,
                DrawOptions {
                    mirror: self.settings.mirror_camera,
                    opacity: 1.0,
                },
            )?;
            outcome.live = Some(kind);
        }

        // 3. Reference video, only when a frame is buffered
        if let Some(frame) = reference {
            canvas.draw_scaled(
                &frame,
                DrawOptions {
                    mirror: false,
                    opacity: self.settings.reference_opacity,
                },
            )?;
            outcome.reference = true;
        }

        // 4. Logo (or fallback badge) with backing and border
        let rect = self.logo_rect(&logo, surface_width);
        let backing = rect.inflate(self.settings.logo_padding);
        canvas.fill_rect(backing, self.settings.logo_backing);
        canvas.stroke_rect(
            backing,
            self.settings.logo_border_width,
            self.settings.logo_border,
        );
        canvas.draw_into(&logo, rect, DrawOptions::default())?;
        outcome.logo = self.overlay.is_logo_loaded();

        std::mem::swap(&mut *self.surface.lock(), &mut *canvas);
        self.surface.publish();
        Ok(outcome)
    }

    /// Draw one frame, absorbing failures
    pub fn tick(&self) -> Option<FrameOutcome> {
        match self.render_frame() {
            Ok(outcome) => {
                self.counters.drawn.fetch_add(1, Ordering::Relaxed);
                Some(outcome)
            }
            Err(e) => {
                let failed = self.counters.failed.fetch_add(1, Ordering::Relaxed) + 1;
                if failed == 1 || failed % 100 == 0 {
                    tracing::warn!("Skipping composite frame ({} failed so far): {}", failed, e);
                } else {
                    tracing::debug!("Skipping composite frame: {}", e);
                }
                None
            }
        }
    }

    /// Run the draw loop at the configured frame rate until stopped
    pub fn spawn(self) -> CompositorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let counters = self.counters.clone();
        let reader = self.surface.reader();
        let interval = self.settings.frame_interval();

        tracing::info!(
            "Starting draw loop at {}fps ({}x{})",
            self.settings.fps,
            reader.dimensions().0,
            reader.dimensions().1
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick();
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            let stats = self.stats();
            tracing::info!(
                "Draw loop stopped: {} frames drawn, {} failed",
                stats.frames_drawn,
                stats.frames_failed
            );
        });

        CompositorHandle {
            stop_tx,
            task: Some(task),
            counters,
            reader,
        }
    }
}

/// Controls a running draw loop
pub struct CompositorHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    reader: SurfaceReader,
}

impl CompositorHandle {
    pub fn reader(&self) -> SurfaceReader {
        self.reader.clone()
    }

    pub fn stats(&self) -> CompositorStats {
        CompositorStats {
            frames_drawn: self.counters.drawn.load(Ordering::Relaxed),
            frames_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Draw loop task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for CompositorHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
