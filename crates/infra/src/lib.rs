//! Infrastructure for fxrack: rubato-backed rate conversion and the offline
//! block renderer that drives an effect chain.

pub mod render;
pub mod resample;

pub use render::{
    converter_factory, sine_burst, BlockRenderer, EffectSummary, RenderError, RenderReport,
    TimelineEntry, TimelineKind,
};
pub use resample::{SincConverter, SincFactory, SincQuality};
