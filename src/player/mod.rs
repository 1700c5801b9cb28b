//! Playback control
//!
//! [`PlaybackController`] is the state machine an application drives: open a
//! stream, feed it through [`PacketFeeder`](crate::pipeline::PacketFeeder)s,
//! call [`poll`](PlaybackController::poll) on its own cadence, and issue
//! play/pause/seek/speed commands.

pub mod controller;
pub mod events;
pub mod speed;

pub use controller::PlaybackController;
pub use events::{PlaybackEvent, PlaybackListener, Reposition, SeekTarget};
