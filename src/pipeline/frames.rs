//! Displayed-frame accounting

use super::types::Timestamp;

/// Tracks which frame is on screen
///
/// The count is anchored at a baseline (frame, media time) set on open, seek,
/// loop and rate change. From there it is derived either from the sink's exact
/// presented-frame counter or from elapsed media time × nominal fps.
#[derive(Debug, Clone)]
pub struct FrameAccountant {
    fps: f64,
    prefer_exact: bool,
    baseline_frame: u64,
    baseline_media: Timestamp,
    /// Sink counter value matching the baseline frame minus one
    exact_at_baseline: Option<u64>,
    latest_exact: Option<u64>,
    exact_since_baseline: bool,
    /// Late drops already overtaken by a presented frame
    skipped: u64,
    /// Late drops since the last presented frame
    pending_skips: u64,
}

impl FrameAccountant {
    pub fn new(fps: f64, prefer_exact: bool) -> Self {
        Self {
            fps,
            prefer_exact,
            baseline_frame: 0,
            baseline_media: Timestamp::ZERO,
            exact_at_baseline: None,
            latest_exact: None,
            exact_since_baseline: false,
            skipped: 0,
            pending_skips: 0,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn baseline(&self) -> (u64, Timestamp) {
        (self.baseline_frame, self.baseline_media)
    }

    pub fn frame_to_time(&self, frame: u64) -> Timestamp {
        if self.fps <= 0.0 {
            return Timestamp::ZERO;
        }
        Timestamp::from_seconds(frame as f64 / self.fps)
    }

    pub fn time_to_frame(&self, time: Timestamp) -> u64 {
        (time.as_seconds() * self.fps).round().max(0.0) as u64
    }

    /// Restart counting: `frame` is on screen at media time `media`
    pub fn rebase(&mut self, frame: u64, media: Timestamp) {
        self.baseline_frame = frame;
        self.baseline_media = media;
        self.exact_at_baseline = self.latest_exact;
        self.exact_since_baseline = false;
        self.skipped = 0;
        self.pending_skips = 0;
    }

    /// Note a unit dropped for lateness; it counts once a later frame shows
    pub fn record_skipped(&mut self) {
        self.pending_skips += 1;
    }

    /// Note a presented frame, with the sink's counter when it has one
    pub fn record_presented(&mut self, exact: Option<u64>) {
        let skipped = std::mem::take(&mut self.pending_skips);
        let Some(count) = exact else {
            return;
        };
        self.skipped += skipped;
        if self.exact_at_baseline.is_none() {
            self.exact_at_baseline = Some(count.saturating_sub(1));
        }
        self.latest_exact = Some(count);
        self.exact_since_baseline = true;
    }

    /// Frame on screen at media time `media` while playing at `rate`
    pub fn current_frame(&self, media: Timestamp, rate: i32) -> u64 {
        if self.prefer_exact
            && rate > 0
            && self.exact_since_baseline
            && let (Some(latest), Some(base)) = (self.latest_exact, self.exact_at_baseline)
        {
            let delta = latest.saturating_sub(base);
            return self.baseline_frame + delta.saturating_sub(1) + self.skipped;
        }

        let elapsed = (media.micros - self.baseline_media.micros) as f64 / 1_000_000.0;
        let frame = self.baseline_frame as f64 + (elapsed * self.fps).round();
        frame.max(0.0) as u64
    }
}
