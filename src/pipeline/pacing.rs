//! Presentation pacing
//!
//! Decides, per decoded unit, whether the clock has reached it yet.

use std::time::Duration;

use super::clock::ClockSnapshot;
use super::types::Timestamp;

/// What to do with the unit at the head of a presentation queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceDecision {
    /// Not due yet, keep it queued
    Wait,
    /// Due now, hand it to the sink
    Present,
    /// Due so long ago that showing it would only add latency
    DropLate,
    /// Enqueued before the last discontinuity
    DiscardStale,
}

/// Decide the fate of a unit stamped `pts` under clock epoch `epoch`
///
/// Forward rates present a unit once media time has reached its PTS, reverse
/// rates once media time has fallen to it. The late window scales with the
/// rate magnitude, since at 4x a tick covers four times as much media time.
pub fn decide(
    pts: Timestamp,
    epoch: u64,
    clock: &ClockSnapshot,
    drop_threshold: Duration,
) -> PaceDecision {
    if epoch != clock.epoch {
        return PaceDecision::DiscardStale;
    }

    let media = clock.media_time.micros;
    let lateness = if clock.rate > 0 {
        media - pts.micros
    } else {
        pts.micros - media
    };
    if lateness < 0 {
        return PaceDecision::Wait;
    }

    let window = drop_threshold.as_micros() as i64 * clock.rate.unsigned_abs() as i64;
    if lateness > window {
        PaceDecision::DropLate
    } else {
        PaceDecision::Present
    }
}

/// Fills in timestamps the container left unknown
///
/// An unknown PTS is taken as one nominal unit after the previous unit, or
/// one unit before it while playing in reverse.
#[derive(Debug, Clone)]
pub struct PtsInterpolator {
    unit_duration: Duration,
    last: Option<Timestamp>,
    origin: Timestamp,
}

impl PtsInterpolator {
    pub fn new(unit_duration: Duration) -> Self {
        Self {
            unit_duration,
            last: None,
            origin: Timestamp::ZERO,
        }
    }

    /// Forget history; the next unknown PTS resolves to `origin`
    pub fn reset(&mut self, origin: Timestamp) {
        self.last = None;
        self.origin = origin;
    }

    pub fn resolve(&mut self, pts: Option<Timestamp>, rate: i32) -> Timestamp {
        let resolved = match (pts, self.last) {
            (Some(pts), _) => pts,
            (None, None) => self.origin,
            (None, Some(last)) if rate < 0 => {
                last.sub(self.unit_duration).clamp(Timestamp::ZERO, last)
            }
            (None, Some(last)) => last.add(self.unit_duration),
        };
        self.last = Some(resolved);
        resolved
    }
}
