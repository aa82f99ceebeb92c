//! Pluggable visual-effects sources (AR lenses and the like).

use super::frame::Frame;
use crate::capture::traits::VideoSource;
use crate::utils::error::SessionResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which live input the compositor draws as its primary layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Raw camera frames
    #[default]
    Camera,
    /// Camera passed through the effects pipeline
    FilteredCamera,
}

/// A source of effect-processed frames.
///
/// `Ok(None)` means "nothing to show this tick"; the compositor then draws
/// the raw camera instead.
pub trait EffectsSource: Send + Sync {
    fn frame(&self, camera: &dyn VideoSource) -> SessionResult<Option<Arc<Frame>>>;

    fn name(&self) -> &str;
}

/// No effects subsystem
#[derive(Debug, Default)]
pub struct NoEffects;

impl EffectsSource for NoEffects {
    fn frame(&self, _camera: &dyn VideoSource) -> SessionResult<Option<Arc<Frame>>> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// An external effects engine fed with raw camera frames
pub trait EffectsPipeline: Send + Sync {
    /// Process one camera frame; `None` while the engine is warming up
    fn process(&self, input: &Frame) -> SessionResult<Option<Frame>>;
}

/// Adapts an [`EffectsPipeline`] into an [`EffectsSource`]
pub struct ExternalEffects<P> {
    name: String,
    pipeline: P,
}

impl<P: EffectsPipeline> ExternalEffects<P> {
    pub fn new(name: impl Into<String>, pipeline: P) -> Self {
        Self {
            name: name.into(),
            pipeline,
        }
    }
}

impl<P: EffectsPipeline> EffectsSource for ExternalEffects<P> {
    fn frame(&self, camera: &dyn VideoSource) -> SessionResult<Option<Arc<Frame>>> {
        let Some(input) = camera.latest_frame() else {
            return Ok(None);
        };
        Ok(self.pipeline.process(&input)?.map(Arc::new))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
