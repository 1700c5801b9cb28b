//! Health monitoring and metrics for pipeline

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::types::MediaKind;
use crate::utils::sos::SignalOfStop;

/// Health metrics for a stream pipeline
///
/// Tracks various counters and timestamps to monitor pipeline health.
/// All fields use atomic operations for thread-safe access.
pub struct PipelineHealth {
    /// Reference point for `last_present`
    origin: Instant,

    /// Units handed to the sink
    pub units_presented: AtomicU64,

    /// Units dropped for arriving later than the drop threshold
    pub late_drops: AtomicU64,

    /// Units discarded because they belong to an older clock epoch
    pub stale_discards: AtomicU64,

    /// Packets refused because the input buffer was full
    pub backpressure_refusals: AtomicU64,

    /// Completed graph flushes
    pub flushes: AtomicU64,

    /// Number of decode failures
    pub decode_failures: AtomicU64,

    /// Total bytes of data presented
    pub bytes_presented: AtomicU64,

    /// Microseconds since `origin` of the last presented unit
    pub last_present: AtomicU64,

    /// Set while the pipeline is not expected to present (paused, drained)
    idle: AtomicBool,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            units_presented: AtomicU64::new(0),
            late_drops: AtomicU64::new(0),
            stale_discards: AtomicU64::new(0),
            backpressure_refusals: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            bytes_presented: AtomicU64::new(0),
            last_present: AtomicU64::new(0),
            idle: AtomicBool::new(true),
        }
    }

    fn elapsed_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Record a unit handed to the sink
    pub fn record_presented(&self, size: usize) {
        self.last_present
            .store(self.elapsed_micros(), Ordering::Relaxed);
        self.units_presented.fetch_add(1, Ordering::Relaxed);
        self.bytes_presented
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_late_drop(&self) {
        self.late_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_discard(&self) {
        self.stale_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_refusals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark whether the pipeline is currently expected to be idle
    ///
    /// Leaving the idle state restarts the stall timer.
    pub fn set_idle(&self, idle: bool) {
        let was_idle = self.idle.swap(idle, Ordering::Relaxed);
        if was_idle && !idle {
            self.last_present
                .store(self.elapsed_micros(), Ordering::Relaxed);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    pub fn units_presented(&self) -> u64 {
        self.units_presented.load(Ordering::Relaxed)
    }

    pub fn late_drops(&self) -> u64 {
        self.late_drops.load(Ordering::Relaxed)
    }

    pub fn stale_discards(&self) -> u64 {
        self.stale_discards.load(Ordering::Relaxed)
    }

    pub fn backpressure_refusals(&self) -> u64 {
        self.backpressure_refusals.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_presented(&self) -> u64 {
        self.bytes_presented.load(Ordering::Relaxed)
    }

    /// Calculate the late drop rate as a percentage of units that reached
    /// the presentation decision
    pub fn drop_rate(&self) -> f64 {
        let drops = self.late_drops();
        let total = self.units_presented() + drops;
        if total == 0 {
            return 0.0;
        }
        (drops as f64 / total as f64) * 100.0
    }

    /// Check if the pipeline has stalled (nothing presented for the given
    /// duration while it was expected to present)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        if self.is_idle() {
            return false;
        }
        let last = self.last_present.load(Ordering::Relaxed);
        let elapsed_micros = self.elapsed_micros().saturating_sub(last);
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            units_presented: self.units_presented(),
            late_drops: self.late_drops(),
            stale_discards: self.stale_discards(),
            backpressure_refusals: self.backpressure_refusals(),
            flushes: self.flushes(),
            decode_failures: self.decode_failures(),
            bytes_presented: self.bytes_presented(),
            drop_rate: self.drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSummary {
    pub units_presented: u64,
    pub late_drops: u64,
    pub stale_discards: u64,
    pub backpressure_refusals: u64,
    pub flushes: u64,
    pub decode_failures: u64,
    pub bytes_presented: u64,
    pub drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} presented ({} late drops, {:.2}%), {} stale, {} backpressure, {} flushes, {} decode failures, {} bytes",
            self.units_presented,
            self.late_drops,
            self.drop_rate,
            self.stale_discards,
            self.backpressure_refusals,
            self.flushes,
            self.decode_failures,
            self.bytes_presented
        )
    }
}

/// Health alert types
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// Nothing presented for the threshold duration while playing
    Stalled { kind: MediaKind, duration: Duration },

    /// High late-drop rate detected
    HighDropRate { kind: MediaKind, rate: f64 },

    /// New decode failures since the last check
    DecodeFailures { kind: MediaKind, count: u64 },

    /// New backpressure refusals since the last check
    Backpressure { kind: MediaKind, count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { kind, duration } => {
                write!(f, "{} pipeline stalled for {:?}", kind, duration)
            }
            HealthAlert::HighDropRate { kind, rate } => {
                write!(f, "{} late drop rate: {:.2}%", kind, rate)
            }
            HealthAlert::DecodeFailures { kind, count } => {
                write!(f, "{} decode failures: {}", kind, count)
            }
            HealthAlert::Backpressure { kind, count } => {
                write!(f, "{} backpressure refusals: {}", kind, count)
            }
        }
    }
}

/// Health monitoring service
///
/// Periodically checks pipeline health and sends alerts when issues are detected.
/// Stops when the receiver goes away or the session's stop signal fires.
pub struct HealthMonitor {
    kind: MediaKind,
    health: Arc<PipelineHealth>,
    alert_tx: mpsc::Sender<HealthAlert>,
    stop: Option<SignalOfStop>,
    check_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(
        kind: MediaKind,
        health: Arc<PipelineHealth>,
        alert_tx: mpsc::Sender<HealthAlert>,
    ) -> Self {
        Self {
            kind,
            health,
            alert_tx,
            stop: None,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            drop_rate_threshold: 10.0, // 10% drop rate
        }
    }

    /// Configure the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Configure the stall threshold
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Configure the drop rate threshold
    pub fn with_drop_rate_threshold(mut self, threshold: f64) -> Self {
        self.drop_rate_threshold = threshold;
        self
    }

    /// Stop checking once this signal is cancelled
    pub fn with_stop_signal(mut self, stop: SignalOfStop) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.cancelled())
    }

    async fn send(&self, alert: HealthAlert) -> bool {
        self.alert_tx.send(alert).await.is_ok()
    }

    /// Run the health monitor until stopped
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut last_decode_failures = 0u64;
        let mut last_backpressure = 0u64;

        loop {
            interval.tick().await;
            if self.stopped() {
                log::debug!("HealthMonitor: {} monitor stopped", self.kind);
                return;
            }

            let mut alerts = Vec::new();

            if self.health.is_stalled(self.stall_threshold) {
                alerts.push(HealthAlert::Stalled {
                    kind: self.kind,
                    duration: self.stall_threshold,
                });
            }

            let drop_rate = self.health.drop_rate();
            if drop_rate > self.drop_rate_threshold {
                alerts.push(HealthAlert::HighDropRate {
                    kind: self.kind,
                    rate: drop_rate,
                });
            }

            let decode_failures = self.health.decode_failures();
            if decode_failures > last_decode_failures {
                alerts.push(HealthAlert::DecodeFailures {
                    kind: self.kind,
                    count: decode_failures - last_decode_failures,
                });
                last_decode_failures = decode_failures;
            }

            let backpressure = self.health.backpressure_refusals();
            if backpressure > last_backpressure {
                alerts.push(HealthAlert::Backpressure {
                    kind: self.kind,
                    count: backpressure - last_backpressure,
                });
                last_backpressure = backpressure;
            }

            for alert in alerts {
                if !self.send(alert).await {
                    return;
                }
            }
        }
    }
}
