//! Visual compositing
//!
//! Layers the live camera (optionally through an effects source), the
//! reference video and the branding overlay onto one surface at a fixed
//! frame rate.

pub mod draw_loop;
pub mod effects;
pub mod frame;
pub mod overlay;
pub mod surface;

pub use draw_loop::{CompositorHandle, CompositorSettings, CompositorStats, FrameCompositor};
pub use effects::{EffectsPipeline, EffectsSource, ExternalEffects, NoEffects, SourceKind};
pub use frame::{Color, DrawOptions, Frame, Rect};
pub use overlay::BrandingOverlay;
pub use surface::{CompositeSurface, SurfaceReader};
