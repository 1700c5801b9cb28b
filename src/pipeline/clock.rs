//! Playback clock for audio-video synchronization

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::types::Timestamp;
use crate::error::{PipelineError, Result};

/// Source of wall-clock time in microseconds
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    fn now_micros(&self) -> i64;
}

/// Monotonic wall clock backed by `Instant`
#[derive(Debug, Clone)]
pub struct MonotonicTime {
    base: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_micros(&self) -> i64 {
        self.base.elapsed().as_micros() as i64
    }
}

/// Hand-driven wall clock, cloned handles share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    now: Arc<AtomicI64>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(delta.as_micros() as i64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Copy of the clock state taken under one lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub media_time: Timestamp,
    pub rate: i32,
    pub paused: bool,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    /// Wall time (µs) at which `media_anchor` was valid
    wall_anchor: i64,
    /// Media time (µs) at `wall_anchor`
    media_anchor: i64,
    rate: i32,
    pending_rate: Option<i32>,
    paused: bool,
}

impl ClockState {
    fn media_at(&self, now: i64) -> i64 {
        let media = if self.paused {
            self.media_anchor
        } else {
            self.media_anchor + (now - self.wall_anchor) * self.rate as i64
        };
        media.max(0)
    }

    fn rebase(&mut self, now: i64) {
        self.media_anchor = self.media_at(now);
        self.wall_anchor = now;
    }
}

/// Authoritative media time source for a playback session
///
/// Media time is a piecewise-linear function of wall time: each rate change,
/// pause or seek re-anchors it. Seeks and rate changes are discontinuities and
/// bump the epoch; consumers tag their work with the epoch they observed and
/// discard anything tagged with an older one.
///
/// # Thread Safety
///
/// The state sits behind a reader-writer lock so the per-unit reads on the
/// pacing path only contend with the rare control writes. The epoch is
/// mirrored in an atomic for lock-free checks.
pub struct PlaybackClock {
    time: Arc<dyn TimeSource>,
    state: RwLock<ClockState>,
    epoch: AtomicU64,
}

impl PlaybackClock {
    /// Create a clock on the monotonic wall clock, paused at zero
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(MonotonicTime::new()))
    }

    /// Create a clock paused at zero on the given time source
    pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
        let now = time.now_micros();
        Self {
            time,
            state: RwLock::new(ClockState {
                wall_anchor: now,
                media_anchor: 0,
                rate: 1,
                pending_rate: None,
                paused: true,
            }),
            epoch: AtomicU64::new(0),
        }
    }

    /// Start running from `origin`
    ///
    /// Does not bump the epoch: units queued while opening stay valid.
    pub fn start(&self, origin: Timestamp) {
        let now = self.time.now_micros();
        let mut state = self.state.write();
        if let Some(rate) = state.pending_rate.take() {
            state.rate = rate;
        }
        state.media_anchor = origin.micros.max(0);
        state.wall_anchor = now;
        state.paused = false;
    }

    /// Freeze or resume media time. Idempotent in both directions.
    pub fn pause(&self, pause: bool) {
        let now = self.time.now_micros();
        let mut state = self.state.write();
        match (state.paused, pause) {
            (false, true) => {
                state.rebase(now);
                state.paused = true;
            }
            (true, false) => {
                state.wall_anchor = now;
                state.paused = false;
            }
            _ => {}
        }
    }

    /// Request a new rate multiplier
    ///
    /// The rate is applied at the next packet boundary (see
    /// [`packet_boundary`](Self::packet_boundary)), never in the middle of a
    /// unit's presentation window. Zero is rejected: pausing is `pause(true)`.
    pub fn set_rate(&self, rate: i32) -> Result<()> {
        if rate == 0 {
            return Err(PipelineError::InvalidArgument(
                "rate multiplier 0, use pause instead".into(),
            ));
        }
        let mut state = self.state.write();
        state.pending_rate = if rate == state.rate { None } else { Some(rate) };
        Ok(())
    }

    /// Apply a pending rate, if any. Returns the rate that was applied.
    pub fn packet_boundary(&self) -> Option<i32> {
        if self.state.read().pending_rate.is_none() {
            return None;
        }
        let now = self.time.now_micros();
        let mut state = self.state.write();
        let rate = state.pending_rate.take()?;
        state.rebase(now);
        state.rate = rate;
        Some(rate)
    }

    /// Jump media time to `origin` and open a new epoch
    pub fn notify_discontinuity(&self, origin: Timestamp) -> u64 {
        let now = self.time.now_micros();
        let mut state = self.state.write();
        state.media_anchor = origin.micros.max(0);
        state.wall_anchor = now;
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Move a paused clock forward to `position` (frame stepping)
    ///
    /// Continuous motion, so the epoch is kept.
    pub fn advance_paused_to(&self, position: Timestamp) {
        let mut state = self.state.write();
        if state.paused {
            state.media_anchor = position.micros.max(0);
        }
    }

    pub fn media_time_micros(&self) -> i64 {
        let now = self.time.now_micros();
        self.state.read().media_at(now)
    }

    pub fn media_time(&self) -> Timestamp {
        Timestamp::from_micros(self.media_time_micros())
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        let now = self.time.now_micros();
        let state = self.state.read();
        ClockSnapshot {
            media_time: Timestamp::from_micros(state.media_at(now)),
            rate: state.rate,
            paused: state.paused,
            epoch: self.epoch.load(Ordering::Acquire),
        }
    }

    /// Rate currently in effect
    pub fn rate(&self) -> i32 {
        self.state.read().rate
    }

    pub fn pending_rate(&self) -> Option<i32> {
        self.state.read().pending_rate
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PlaybackClock")
            .field("media_time", &snapshot.media_time)
            .field("rate", &snapshot.rate)
            .field("paused", &snapshot.paused)
            .field("epoch", &snapshot.epoch)
            .finish()
    }
}
