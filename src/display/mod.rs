//! Display and audio output contracts

pub mod sink;
pub mod volume;

pub use sink::{AudioSink, DisplayRegion, PresentedUnit, Rect, RenderSink, SinkProbe, Sinks};
