//! Recording session controller
//!
//! Orchestrates one karaoke take: acquire the camera and microphone, load
//! the reference track, composite and mix, capture, and hand the finished
//! artifact to the review stage. Owns every resource it starts and releases
//! each of them exactly once, whatever path the session ends on.

use super::capture::{
    negotiate_format, CaptureTask, EncoderFactory, EncoderSpec, FinalizedCapture,
    RecordingArtifact, StreamCapture,
};
use super::config::SessionConfig;
use super::handoff::{ArtifactHandoff, ArtifactSink, LocalRecording};
use super::state::{ReadinessFlags, SessionEvent, SessionStatus, StatusReport};
use crate::audio::AudioMixer;
use crate::capture::acquisition::{DeviceFaults, MediaAcquisition};
use crate::capture::traits::{DeviceConstraints, MediaDevices};
use crate::compositor::draw_loop::{CompositorHandle, CompositorStats, FrameCompositor};
use crate::compositor::effects::{EffectsSource, SourceKind};
use crate::compositor::frame::Color;
use crate::compositor::overlay::{BrandingOverlay, DEFAULT_BADGE_BACKGROUND};
use crate::compositor::surface::{CompositeSurface, SurfaceReader};
use crate::reference::{ReferenceLoader, ReferencePlayer};
use crate::services::{AssetLoader, EventDirectory, TrackResolver};
use crate::utils::error::{SessionError, SessionResult};
use crate::utils::fallback::try_each;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Shown when the reference track refuses to start
pub const AUTOPLAY_BANNER: &str = "Interact with the page to enable audio";

/// Everything the controller talks to
#[derive(Clone)]
pub struct SessionDependencies {
    pub devices: Arc<dyn MediaDevices>,
    pub references: Arc<dyn ReferenceLoader>,
    pub tracks: Arc<dyn TrackResolver>,
    pub events: Arc<dyn EventDirectory>,
    pub assets: Arc<dyn AssetLoader>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub effects: Arc<dyn EffectsSource>,
    pub sink: Arc<dyn ArtifactSink>,
}

/// Resources held between a successful setup and teardown
struct ActiveSession {
    acquisition: MediaAcquisition,
    reference: Arc<dyn ReferencePlayer>,
    mixer: AudioMixer,
    compositor: CompositorHandle,
    overlay_task: JoinHandle<()>,
    recording: Option<ActiveRecording>,
}

struct ActiveRecording {
    capture: CaptureTask,
    watcher: JoinHandle<()>,
}

#[derive(Debug)]
enum StopReason {
    User,
    TrackEnded,
    CaptureFailed(SessionError),
    DeviceFailed(SessionError),
}

struct Inner {
    id: Uuid,
    config: SessionConfig,
    deps: SessionDependencies,
    report: RwLock<StatusReport>,
    events: broadcast::Sender<SessionEvent>,
    session: Mutex<Option<ActiveSession>>,
    starting: AtomicBool,
    source: Arc<RwLock<SourceKind>>,
    closed: watch::Sender<bool>,
}

impl Inner {
    fn status(&self) -> SessionStatus {
        self.report.read().status.clone()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn set_status(&self, status: SessionStatus) {
        {
            let mut report = self.report.write();
            if report.status == status {
                return;
            }
            if !matches!(status, SessionStatus::Finalizing | SessionStatus::Complete) {
                report.progress = None;
                report.message = None;
            }
            report.status = status.clone();
        }
        match &status {
            SessionStatus::Error(reason) => tracing::error!("Session failed: {}", reason),
            other => tracing::info!("Session status: {:?}", other),
        }
        let _ = self.events.send(SessionEvent::Status(status));
    }

    fn set_progress(&self, percent: u8, message: &str) {
        {
            let mut report = self.report.write();
            report.progress = Some(percent);
            report.message = Some(message.to_string());
        }
        tracing::debug!("Finalize {}%: {}", percent, message);
        let _ = self
            .events
            .send(SessionEvent::Progress(percent, message.to_string()));
    }

    fn set_banner(&self, banner: Option<&str>) {
        {
            let mut report = self.report.write();
            if report.banner.as_deref() == banner {
                return;
            }
            report.banner = banner.map(str::to_string);
        }
        let _ = self
            .events
            .send(SessionEvent::Banner(banner.map(str::to_string)));
    }

    fn set_readiness(&self, update: impl FnOnce(&mut ReadinessFlags)) {
        let readiness = {
            let mut report = self.report.write();
            update(&mut report.readiness);
            report.readiness
        };
        let _ = self.events.send(SessionEvent::Readiness(readiness));
    }

    /// Enter AcquiringDevices from Initializing or Error, clearing the report
    fn begin_setup(&self) -> SessionResult<()> {
        {
            let mut report = self.report.write();
            if !matches!(
                report.status,
                SessionStatus::Initializing | SessionStatus::Error(_)
            ) {
                return Err(SessionError::InvalidState(status_label(&report.status)));
            }
            *report = StatusReport {
                status: SessionStatus::AcquiringDevices,
                ..Default::default()
            };
        }
        tracing::info!("Session status: {:?}", SessionStatus::AcquiringDevices);
        let _ = self
            .events
            .send(SessionEvent::Status(SessionStatus::AcquiringDevices));
        Ok(())
    }
}

fn status_label(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Initializing => "initializing".to_string(),
        SessionStatus::AcquiringDevices => "acquiring devices".to_string(),
        SessionStatus::Ready => "ready".to_string(),
        SessionStatus::Recording => "recording".to_string(),
        SessionStatus::Finalizing => "finalizing".to_string(),
        SessionStatus::Complete => "complete".to_string(),
        SessionStatus::Error(_) => "in error".to_string(),
    }
}

/// Resolves once the session is closed
async fn closed(rx: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *rx.borrow_and_update();
        if is_closed {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The single owner of a recording session
#[derive(Clone)]
pub struct RecordingSessionController {
    inner: Arc<Inner>,
}

impl RecordingSessionController {
    pub fn new(config: SessionConfig, deps: SessionDependencies) -> SessionResult<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        tracing::info!("Creating session {} for song {}", id, config.song_id);
        let (events, _) = broadcast::channel(64);
        let (closed, _) = watch::channel(false);
        let source = Arc::new(RwLock::new(config.initial_source));
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                deps,
                report: RwLock::new(StatusReport::default()),
                events,
                session: Mutex::new(None),
                starting: AtomicBool::new(false),
                source,
                closed,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    pub fn report(&self) -> StatusReport {
        self.inner.report.read().clone()
    }

    pub fn readiness(&self) -> ReadinessFlags {
        self.inner.report.read().readiness
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn source(&self) -> SourceKind {
        *self.inner.source.read()
    }

    /// Live view of the composite surface, while a session is set up
    pub async fn surface(&self) -> Option<SurfaceReader> {
        let slot = self.inner.session.lock().await;
        slot.as_ref().map(|session| session.compositor.reader())
    }

    pub async fn compositor_stats(&self) -> Option<CompositorStats> {
        let slot = self.inner.session.lock().await;
        slot.as_ref().map(|session| session.compositor.stats())
    }

    /// Acquire devices and load the reference track, ending in Ready.
    ///
    /// The song is resolved before any device is requested, so a missing
    /// track never prompts for the camera.
    pub async fn initialize(&self) -> SessionResult<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SessionError::Cancelled);
        }
        inner.begin_setup()?;

        let session = match self.setup().await {
            Ok(session) => session,
            Err(e) => {
                inner.set_readiness(|r| *r = ReadinessFlags::default());
                inner.set_status(SessionStatus::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut slot = inner.session.lock().await;
        if inner.is_closed() {
            drop(slot);
            self.teardown(session).await;
            inner.set_status(SessionStatus::Error(SessionError::Cancelled.to_string()));
            return Err(SessionError::Cancelled);
        }
        *slot = Some(session);
        drop(slot);

        inner.set_status(SessionStatus::Ready);
        Ok(())
    }

    async fn setup(&self) -> SessionResult<ActiveSession> {
        let inner = &self.inner;
        let config = &inner.config;
        let mut closed_rx = inner.closed.subscribe();

        let url = tokio::select! {
            resolved = inner.deps.tracks.resolve(&config.song_id) => resolved
                .map_err(|e| SessionError::ReferenceLoad(format!("{}: {}", config.song_id, e)))?,
            _ = closed(&mut closed_rx) => return Err(SessionError::Cancelled),
        };
        tracing::info!("Song {} resolved to {}", config.song_id, url);

        let overlay = Arc::new(BrandingOverlay::new(
            &config.badge_text,
            DEFAULT_BADGE_BACKGROUND,
        ));
        let overlay_task = self.spawn_overlay_load(overlay.clone());

        let acquire =
            MediaAcquisition::acquire(inner.deps.devices.clone(), DeviceConstraints::default());
        let references = inner.deps.references.clone();
        let load = async move {
            let player = references.load(&url).await?;
            player.wait_can_play().await?;
            Ok::<_, SessionError>(player)
        };
        tokio::pin!(acquire);
        tokio::pin!(load);

        let mut acquisition: Option<MediaAcquisition> = None;
        let mut reference: Option<Arc<dyn ReferencePlayer>> = None;
        let outcome = loop {
            if acquisition.is_some() && reference.is_some() {
                break Ok(());
            }
            tokio::select! {
                acquired = &mut acquire, if acquisition.is_none() => match acquired {
                    Ok(acquired) => {
                        acquisition = Some(acquired);
                        inner.set_readiness(|r| r.camera_ready = true);
                    }
                    Err(e) => break Err(e),
                },
                loaded = &mut load, if reference.is_none() => match loaded {
                    Ok(player) => {
                        tracing::info!("Reference track can play");
                        reference = Some(player);
                        inner.set_readiness(|r| r.reference_ready = true);
                    }
                    Err(e @ SessionError::ReferenceLoad(_)) => break Err(e),
                    Err(e) => break Err(SessionError::ReferenceLoad(e.to_string())),
                },
                _ = closed(&mut closed_rx) => break Err(SessionError::Cancelled),
            }
        };

        let (acquisition, reference) = match (outcome, acquisition, reference) {
            (Ok(()), Some(acquisition), Some(reference)) => (acquisition, reference),
            (outcome, acquisition, reference) => {
                overlay_task.abort();
                if let Some(reference) = reference {
                    reference.pause();
                }
                if let Some(acquisition) = acquisition {
                    if let Err(e) = acquisition.release() {
                        tracing::warn!("Failed to release devices after setup failure: {}", e);
                    }
                }
                return Err(outcome.err().unwrap_or(SessionError::Cancelled));
            }
        };

        let resolution = acquisition.surface_resolution(config.fallback_resolution());
        let surface = match CompositeSurface::new(resolution.width, resolution.height) {
            Ok(surface) => surface,
            Err(e) => {
                overlay_task.abort();
                if let Err(release) = acquisition.release() {
                    tracing::warn!("Failed to release devices: {}", release);
                }
                return Err(e);
            }
        };
        tracing::info!(
            "Composite surface {}x{}",
            resolution.width,
            resolution.height
        );

        let mixer = AudioMixer::new(config.mixer_settings());
        let compositor = FrameCompositor::new(
            surface,
            acquisition.video(),
            inner.deps.effects.clone(),
            inner.source.clone(),
            reference.clone(),
            overlay,
            config.compositor_settings(),
        )
        .spawn();

        Ok(ActiveSession {
            acquisition,
            reference,
            mixer,
            compositor,
            overlay_task,
            recording: None,
        })
    }

    /// Load event branding in the background; the badge stays up meanwhile
    fn spawn_overlay_load(&self, overlay: Arc<BrandingOverlay>) -> JoinHandle<()> {
        let events = self.inner.deps.events.clone();
        let assets = self.inner.deps.assets.clone();
        let event_id = self.inner.config.event_id.clone();
        let placeholders = self.inner.config.placeholder_logos.clone();

        tokio::spawn(async move {
            let mut candidates = Vec::new();
            if let Some(event_id) = &event_id {
                match events.branding(event_id).await {
                    Ok(branding) => {
                        if let Some(color) =
                            branding.primary_color.as_deref().and_then(Color::from_hex)
                        {
                            overlay.set_badge_background(color);
                        }
                        candidates.extend(branding.logo_url);
                    }
                    Err(e) => tracing::warn!("No branding for event {}: {}", event_id, e),
                }
            }
            candidates.extend(placeholders);

            if let Err(e) = overlay.load(assets.as_ref(), &candidates).await {
                tracing::warn!("Using the fallback badge: {}", e);
            }
        })
    }

    /// Begin capture, then start the reference track.
    ///
    /// A concurrent second call fails with `AlreadyRecording`.
    pub async fn start(&self) -> SessionResult<()> {
        let inner = &self.inner;
        if inner.starting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Start already in progress");
            return Err(SessionError::AlreadyRecording);
        }
        let _guard = StartGuard(&inner.starting);

        let mut slot = inner.session.lock().await;
        match inner.status() {
            SessionStatus::Ready => {}
            SessionStatus::Recording => return Err(SessionError::AlreadyRecording),
            other => return Err(SessionError::InvalidState(status_label(&other))),
        }
        let Some(session) = slot.as_mut() else {
            return Err(SessionError::InvalidState("not set up".to_string()));
        };
        if session.recording.is_some() {
            return Err(SessionError::AlreadyRecording);
        }

        match self.begin_recording(session).await {
            Ok(recording) => {
                session.recording = Some(recording);
                Ok(())
            }
            Err(e) => {
                let session = slot.take();
                drop(slot);
                if let Some(session) = session {
                    self.teardown(session).await;
                }
                inner.set_status(SessionStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn begin_recording(&self, session: &mut ActiveSession) -> SessionResult<ActiveRecording> {
        let inner = &self.inner;
        let config = &inner.config;

        if let Some(reason) = session.acquisition.faults().current() {
            return Err(SessionError::Device(reason));
        }
        if !session.mixer.is_microphone_connected() {
            match session.acquisition.take_microphone() {
                Some(microphone) => session.mixer.connect_microphone(microphone)?,
                None => tracing::warn!("No microphone track, recording without vocals"),
            }
        }
        if !session.mixer.is_reference_connected() {
            let monitor = inner.deps.devices.monitor_output(session.mixer.format());
            if let Err(e) = session
                .mixer
                .connect_reference_audio(session.reference.as_ref(), monitor)
            {
                tracing::warn!("Recording without the backing track audio: {}", e);
            }
        }

        // Format probing and encoder startup talk to an external process
        let encoders = inner.deps.encoders.clone();
        let preferred = config.preferred_formats.clone();
        let surface = session.compositor.reader();
        let audio = session.mixer.output()?;
        let (fps, audio_format) = (config.fps, config.audio_format());
        let capture = tokio::task::spawn_blocking(move || {
            let format = negotiate_format(encoders.as_ref(), &preferred)?;
            let (width, height) = surface.dimensions();
            let spec = EncoderSpec {
                format,
                width,
                height,
                fps,
                audio: audio_format,
            };
            StreamCapture::begin(encoders.as_ref(), spec, surface, audio)
        })
        .await
        .map_err(|e| SessionError::Encoding(format!("encoder startup failed: {}", e)))??;
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let capture = capture.spawn(failures_tx);
        inner.set_status(SessionStatus::Recording);

        tokio::time::sleep(config.settle_delay()).await;
        self.start_playback(session.reference.as_ref()).await;

        let watcher = self.spawn_watcher(
            session.reference.clone(),
            session.acquisition.faults(),
            failures_rx,
        );
        Ok(ActiveRecording { capture, watcher })
    }

    /// Playback refusal is absorbed: video-only with a banner
    async fn start_playback(&self, reference: &dyn ReferencePlayer) {
        let attempts = 1 + self.inner.config.playback_retries;
        let played = try_each(1..=attempts, |attempt| async move {
            let result = reference.play().await;
            if let Err(e) = &result {
                tracing::debug!("Playback attempt {} failed: {}", attempt, e);
            }
            result
        })
        .await;

        match played {
            Ok(()) => {
                tracing::info!("Reference playback started");
                self.inner.set_banner(None);
            }
            Err(failed) => {
                tracing::warn!("Reference playback blocked, recording without it: {}", failed);
                self.inner.set_banner(Some(AUTOPLAY_BANNER));
            }
        }
    }

    fn spawn_watcher(
        &self,
        reference: Arc<dyn ReferencePlayer>,
        faults: DeviceFaults,
        mut failures: mpsc::UnboundedReceiver<SessionError>,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = reference.ended() => StopReason::TrackEnded,
                Some(e) = failures.recv() => StopReason::CaptureFailed(e),
                reason = faults.failed() => StopReason::DeviceFailed(SessionError::Device(reason)),
            };
            drop(reference);

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let controller = RecordingSessionController { inner };
            if let Err(e) = controller.finish_recording(reason).await {
                tracing::debug!("Automatic stop ended with error: {}", e);
            }
        })
    }

    /// Stop and finalize. A no-op when nothing is recording.
    pub async fn stop(&self) -> SessionResult<()> {
        self.finish_recording(StopReason::User).await
    }

    /// Retry the reference track after the user interacted with the page
    pub async fn resume_playback(&self) -> SessionResult<()> {
        let slot = self.inner.session.lock().await;
        let session = slot
            .as_ref()
            .filter(|session| session.recording.is_some())
            .ok_or(SessionError::NotRecording)?;
        session.reference.play().await?;
        drop(slot);
        self.inner.set_banner(None);
        tracing::info!("Reference playback resumed");
        Ok(())
    }

    /// Switch the live layer. Refused while recording.
    pub fn select_source(&self, kind: SourceKind) -> SessionResult<()> {
        let status = self.inner.status();
        if status == SessionStatus::Recording || status == SessionStatus::Finalizing {
            return Err(SessionError::InvalidState(status_label(&status)));
        }
        *self.inner.source.write() = kind;
        tracing::info!("Live source set to {:?}", kind);
        Ok(())
    }

    /// Set up again after an error
    pub async fn retry(&self) -> SessionResult<()> {
        let status = self.inner.status();
        if !status.is_error() {
            return Err(SessionError::InvalidState(status_label(&status)));
        }
        tracing::info!("Retrying session setup");
        self.inner.set_status(SessionStatus::Initializing);
        self.initialize().await
    }

    /// Release everything without handing anything off
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.send_replace(true);

        let session = inner.session.lock().await.take();
        if let Some(session) = session {
            tracing::info!("Shutting down session");
            self.teardown(session).await;
        }
        if !inner.status().is_terminal() {
            inner.set_status(SessionStatus::Error("Session closed".to_string()));
        }
    }

    async fn finish_recording(&self, reason: StopReason) -> SessionResult<()> {
        let inner = &self.inner;
        let mut slot = inner.session.lock().await;
        let Some(recording) = slot.as_mut().and_then(|session| session.recording.take()) else {
            tracing::debug!("Stop requested with nothing recording");
            return Ok(());
        };
        let Some(session) = slot.take() else {
            return Ok(());
        };

        match &reason {
            StopReason::User => {
                tracing::info!("Stopping recording");
                recording.watcher.abort();
            }
            StopReason::TrackEnded => tracing::info!("Song finished, stopping recording"),
            StopReason::CaptureFailed(e) => tracing::error!("Capture failed mid-take: {}", e),
            StopReason::DeviceFailed(e) => tracing::error!("Lost a device mid-take: {}", e),
        }
        inner.set_status(SessionStatus::Finalizing);

        let result = self.finalize(session, recording, reason).await;
        drop(slot);
        result
    }

    /// Every step runs even when an earlier one fails
    async fn finalize(
        &self,
        session: ActiveSession,
        recording: ActiveRecording,
        reason: StopReason,
    ) -> SessionResult<()> {
        let inner = &self.inner;
        let ActiveSession {
            acquisition,
            reference,
            mixer,
            mut compositor,
            overlay_task,
            ..
        } = session;
        let ActiveRecording { mut capture, .. } = recording;
        let mut fatal = match reason {
            StopReason::CaptureFailed(e) | StopReason::DeviceFailed(e) => Some(e),
            StopReason::User | StopReason::TrackEnded => None,
        };

        inner.set_progress(10, "Stopping capture");
        let captured = match capture.stop().await {
            Ok(captured) => Some(captured),
            Err(e) => {
                tracing::warn!("Capture did not stop cleanly: {}", e);
                fatal.get_or_insert(e);
                None
            }
        };

        inner.set_progress(30, "Stopping the song");
        reference.pause();

        inner.set_progress(45, "Releasing camera and microphone");
        if let Err(e) = acquisition.release() {
            tracing::warn!("Failed to release devices: {}", e);
        }
        inner.set_readiness(|r| *r = ReadinessFlags::default());

        inner.set_progress(60, "Closing audio");
        if let Err(e) = mixer.close() {
            tracing::warn!("Failed to close the audio mixer: {}", e);
        }

        compositor.stop().await;
        overlay_task.abort();
        let stats = compositor.stats();
        tracing::debug!(
            "Compositor drew {} frames, {} failed",
            stats.frames_drawn,
            stats.frames_failed
        );

        inner.set_progress(75, "Saving recording");
        let FinalizedCapture { artifact, error } = match captured {
            Some(captured) => captured.finalize().await,
            None => {
                let e = fatal
                    .unwrap_or_else(|| SessionError::Encoding("capture was lost".to_string()));
                inner.set_status(SessionStatus::Error(e.to_string()));
                return Err(e);
            }
        };
        if let Some(e) = error {
            fatal.get_or_insert(e);
        }

        if artifact.is_empty() {
            let e = fatal.unwrap_or_else(|| {
                SessionError::Encoding("no media data was captured".to_string())
            });
            inner.set_status(SessionStatus::Error(e.to_string()));
            return Err(e);
        }

        inner.set_progress(90, "Handing off recording");
        if let Err(e) = self.hand_off(artifact).await {
            tracing::error!("Hand-off failed: {}", e);
            fatal.get_or_insert(e);
        }

        match fatal {
            Some(e) => {
                inner.set_status(SessionStatus::Error(e.to_string()));
                Err(e)
            }
            None => {
                inner.set_progress(100, "Done");
                inner.set_status(SessionStatus::Complete);
                Ok(())
            }
        }
    }

    async fn hand_off(&self, artifact: RecordingArtifact) -> SessionResult<()> {
        let inner = &self.inner;
        let local = LocalRecording::write(&artifact, None)?;
        let url = local.url().to_string();
        let bytes = artifact.len();

        inner
            .deps
            .sink
            .deliver(ArtifactHandoff {
                session_id: inner.id,
                event_id: inner.config.event_id.clone(),
                song_id: inner.config.song_id.clone(),
                artifact,
                local,
            })
            .await
            .map_err(|e| SessionError::Handoff(e.to_string()))?;

        tracing::info!("Recording handed off ({} bytes)", bytes);
        let _ = inner.events.send(SessionEvent::ArtifactReady { url, bytes });
        Ok(())
    }

    /// Release without finalizing
    async fn teardown(&self, session: ActiveSession) {
        let ActiveSession {
            acquisition,
            reference,
            mixer,
            mut compositor,
            overlay_task,
            recording,
        } = session;

        if let Some(mut recording) = recording {
            recording.watcher.abort();
            if let Err(e) = recording.capture.stop().await {
                tracing::debug!("Capture stop during teardown: {}", e);
            }
        }
        reference.pause();
        if let Err(e) = acquisition.release() {
            tracing::warn!("Failed to release devices: {}", e);
        }
        if !mixer.is_closed() {
            if let Err(e) = mixer.close() {
                tracing::warn!("Failed to close the audio mixer: {}", e);
            }
        }
        compositor.stop().await;
        overlay_task.abort();
        self.inner.set_readiness(|r| *r = ReadinessFlags::default());
    }
}
