//! Clock-synchronized playback over tunneled decode pipelines
//!
//! A demuxer feeds compressed packets into per-stream pipelines (decode,
//! optional deinterlace, render) that present units against one shared
//! playback clock. The [`PlaybackController`] owns the clock and the pipelines
//! and implements play, pause, seek, speed, stepping and looping on top.

pub mod config;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod player;
pub mod utils;

pub use config::PlayerSettings;
pub use display::{AudioSink, DisplayRegion, Rect, RenderSink, Sinks};
pub use error::{PipelineError, Result};
pub use pipeline::{MediaInfo, Packet, PacketFeeder, PlaybackState, StreamDescriptor, Timestamp};
pub use player::{PlaybackController, PlaybackEvent, SeekTarget};
