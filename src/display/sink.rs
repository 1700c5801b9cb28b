//! Output collaborators the pipelines present into
//!
//! The core never draws or plays anything itself: a video pipeline hands due
//! frames to a [`RenderSink`], an audio pipeline hands due blocks to an
//! [`AudioSink`]. [`SinkProbe`] records what was presented, for tests and the
//! demo binary.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::pipeline::types::{MediaUnit, StreamDescriptor, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Where a frame lands on screen: an optional crop of the source and an
/// optional placement rectangle. Without a placement the frame fills the
/// display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayRegion {
    pub crop: Option<Rect>,
    pub placement: Option<Rect>,
}

impl DisplayRegion {
    pub fn fullscreen() -> Self {
        Self::default()
    }

    pub fn placed(placement: Rect) -> Self {
        Self {
            crop: None,
            placement: Some(placement),
        }
    }

    pub fn with_crop(mut self, crop: Rect) -> Self {
        self.crop = Some(crop);
        self
    }

    pub fn is_fullscreen(&self) -> bool {
        self.placement.is_none()
    }
}

/// Display side of a video pipeline
pub trait RenderSink: Send {
    /// Called once when the pipeline opens, before any frame
    fn configure(&mut self, _descriptor: &StreamDescriptor, _region: &DisplayRegion) {}

    fn set_region(&mut self, region: &DisplayRegion);

    /// Show a frame. With `timing_lock` the display refresh follows the
    /// stream's nominal frame rate instead of free-running.
    ///
    /// Returns the sink's exact presented-frame count when it keeps one.
    fn present(&mut self, frame: &MediaUnit, region: &DisplayRegion, timing_lock: bool)
    -> Option<u64>;
}

/// Output side of an audio pipeline
pub trait AudioSink: Send {
    fn configure(&mut self, _descriptor: &StreamDescriptor) {}

    fn play(&mut self, unit: &MediaUnit);

    /// Output gain in millibels
    fn set_gain(&mut self, millibels: i32);
}

/// Sinks handed to the controller at open
#[derive(Default)]
pub struct Sinks {
    pub video: Option<Box<dyn RenderSink>>,
    pub audio: Option<Box<dyn AudioSink>>,
}

impl Sinks {
    pub fn new(video: Box<dyn RenderSink>, audio: Box<dyn AudioSink>) -> Self {
        Self {
            video: Some(video),
            audio: Some(audio),
        }
    }

    pub fn video_only(video: Box<dyn RenderSink>) -> Self {
        Self {
            video: Some(video),
            audio: None,
        }
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks")
            .field("video", &self.video.is_some())
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

/// One unit as it reached a probe sink
#[derive(Debug, Clone)]
pub struct PresentedUnit {
    pub pts: Timestamp,
    pub epoch: u64,
    pub sequence: u64,
    pub deinterlaced: bool,
    pub timing_lock: bool,
    pub at: Instant,
}

impl PresentedUnit {
    fn record(unit: &MediaUnit, timing_lock: bool) -> Self {
        Self {
            pts: unit.pts,
            epoch: unit.epoch,
            sequence: unit.sequence,
            deinterlaced: unit.deinterlaced,
            timing_lock,
            at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct ProbeLog {
    frames: Vec<PresentedUnit>,
    audio: Vec<PresentedUnit>,
    frame_count: u64,
    gain: Option<i32>,
    region: Option<DisplayRegion>,
    configured: Vec<StreamDescriptor>,
}

/// Shared record of everything presented through its sinks
#[derive(Debug, Clone, Default)]
pub struct SinkProbe {
    log: Arc<Mutex<ProbeLog>>,
}

impl SinkProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render sink feeding this probe; `exact_counts` makes it report a
    /// presented-frame counter like a hardware renderer would
    pub fn render_sink(&self, exact_counts: bool) -> Box<dyn RenderSink> {
        Box::new(ProbeRenderSink {
            log: self.log.clone(),
            exact_counts,
        })
    }

    pub fn audio_sink(&self) -> Box<dyn AudioSink> {
        Box::new(ProbeAudioSink {
            log: self.log.clone(),
        })
    }

    /// Both sinks, with exact frame counts
    pub fn sinks(&self) -> Sinks {
        Sinks::new(self.render_sink(true), self.audio_sink())
    }

    pub fn frames(&self) -> Vec<PresentedUnit> {
        self.log.lock().frames.clone()
    }

    pub fn frame_count(&self) -> usize {
        self.log.lock().frames.len()
    }

    pub fn last_frame(&self) -> Option<PresentedUnit> {
        self.log.lock().frames.last().cloned()
    }

    pub fn audio_units(&self) -> Vec<PresentedUnit> {
        self.log.lock().audio.clone()
    }

    pub fn gain(&self) -> Option<i32> {
        self.log.lock().gain
    }

    pub fn region(&self) -> Option<DisplayRegion> {
        self.log.lock().region
    }

    pub fn configured(&self) -> Vec<StreamDescriptor> {
        self.log.lock().configured.clone()
    }

    /// Forget presented units; the exact frame counter keeps running
    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.frames.clear();
        log.audio.clear();
    }
}

struct ProbeRenderSink {
    log: Arc<Mutex<ProbeLog>>,
    exact_counts: bool,
}

impl RenderSink for ProbeRenderSink {
    fn configure(&mut self, descriptor: &StreamDescriptor, region: &DisplayRegion) {
        let mut log = self.log.lock();
        log.configured.push(descriptor.clone());
        log.region = Some(*region);
    }

    fn set_region(&mut self, region: &DisplayRegion) {
        self.log.lock().region = Some(*region);
    }

    fn present(
        &mut self,
        frame: &MediaUnit,
        _region: &DisplayRegion,
        timing_lock: bool,
    ) -> Option<u64> {
        let mut log = self.log.lock();
        log.frames.push(PresentedUnit::record(frame, timing_lock));
        log.frame_count += 1;
        self.exact_counts.then_some(log.frame_count)
    }
}

struct ProbeAudioSink {
    log: Arc<Mutex<ProbeLog>>,
}

impl AudioSink for ProbeAudioSink {
    fn configure(&mut self, descriptor: &StreamDescriptor) {
        self.log.lock().configured.push(descriptor.clone());
    }

    fn play(&mut self, unit: &MediaUnit) {
        self.log.lock().audio.push(PresentedUnit::record(unit, false));
    }

    fn set_gain(&mut self, millibels: i32) {
        self.log.lock().gain = Some(millibels);
    }
}
