use crate::pipeline::state::ErrorKind;
use crate::pipeline::types::Timestamp;

/// Where to seek: a media time or a displayed-frame index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Time(Timestamp),
    Frame(u64),
}

/// Where the demuxer must restart feeding after a jump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reposition {
    pub time: Timestamp,
    pub frame: u64,
    /// Rate in effect once feeding resumes; negative means feed backward
    pub rate: i32,
}

/// Something `poll` noticed since the previous call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// First decoded frame reached the renderer, the clock is running
    FirstFrame,
    /// End of stream with looping on; playback jumped back to the start
    Looped(Reposition),
    /// End of stream with looping off
    Finished,
    /// Reverse playback hit the start and switched back to normal speed
    ReverseStartReached,
    /// A pipeline fault moved the controller to the Error state
    Error(ErrorKind),
}

/// Receives the stream-finished notification
///
/// Not fired when the stream loops.
pub trait PlaybackListener: Send {
    fn on_finished(&mut self);
}

impl<F> PlaybackListener for F
where
    F: FnMut() + Send,
{
    fn on_finished(&mut self) {
        self()
    }
}
