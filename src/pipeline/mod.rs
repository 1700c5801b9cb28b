//! Tunneled decode pipeline
//!
//! One [`StreamPipeline`] per elementary stream, each a chain of components
//! joined by tunnels in a [`ComponentGraph`](graph::ComponentGraph):
//!
//! - [`catalog`]: component factory and buffer budget
//! - [`graph`]: components, tunnels and their wiring rules
//! - [`input`]: slot-based input buffer with backpressure
//! - [`clock`]: shared media clock with rate, pause and epochs
//! - [`pacing`]: present/wait/drop decisions against the clock
//! - [`frames`]: displayed-frame accounting
//! - [`health`]: counters and the async health monitor
//!
//! The pipelines never change playback state themselves; the
//! [`PlaybackController`](crate::player::PlaybackController) does.

pub mod catalog;
pub mod clock;
pub mod frames;
pub mod graph;
pub mod health;
pub mod input;
pub mod pacing;
pub mod state;
pub mod stream;
pub mod types;

pub use catalog::{ComponentCatalog, ComponentRole, SoftwareCatalog};
pub use clock::{ClockSnapshot, ManualTime, MonotonicTime, PlaybackClock, TimeSource};
pub use frames::FrameAccountant;
pub use health::{HealthAlert, HealthMonitor, HealthSummary, PipelineHealth};
pub use state::{ErrorKind, PlaybackState, ResumeState};
pub use stream::{OutputSink, PacketFeeder, PipelineContext, PipelineOptions, StreamPipeline};
pub use types::{
    Codec, MediaInfo, MediaKind, MediaUnit, Packet, SampleFormat, StreamDescriptor, Timestamp,
};
