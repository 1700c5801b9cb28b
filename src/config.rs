use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::display::DisplayRegion;
use crate::error::{PipelineError, Result};
use crate::pipeline::graph::ViolationPolicy;
use crate::pipeline::stream::PipelineOptions;

/// Player settings, fixed for the lifetime of one open session
///
/// Every field has a default, so a settings file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    /// Restart from the beginning at end of stream
    pub loop_playback: bool,
    /// Insert the deinterlace filter into the video graph
    pub deinterlace: bool,
    /// Lock display refresh to the stream's frame rate
    pub timing_lock: bool,
    pub enable_audio: bool,
    /// Normalized volume in [0, 1]
    pub initial_volume: f64,
    pub display_region: DisplayRegion,
    /// Trust the renderer's presented-frame counter over media time
    pub prefer_exact_frame_count: bool,
    pub drop_threshold_ms: u64,
    pub flush_timeout_ms: u64,
    pub step_timeout_ms: u64,
    pub pacing_tick_ms: u64,
    pub feed_timeout_ms: u64,
    pub violation_policy: ViolationPolicy,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            loop_playback: false,
            deinterlace: false,
            timing_lock: false,
            enable_audio: true,
            initial_volume: 0.5,
            display_region: DisplayRegion::default(),
            prefer_exact_frame_count: true,
            drop_threshold_ms: 100,
            flush_timeout_ms: 500,
            step_timeout_ms: 1000,
            pacing_tick_ms: 2,
            feed_timeout_ms: 200,
            violation_policy: ViolationPolicy::default(),
        }
    }
}

impl PlayerSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::Configuration(format!("settings: {}", e)))
    }

    /// Read settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let settings = Self::from_json_str(&json)?;
        log::debug!("Config: loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Configuration(format!("settings: {}", e)))
    }

    pub fn drop_threshold(&self) -> Duration {
        Duration::from_millis(self.drop_threshold_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn pacing_tick(&self) -> Duration {
        Duration::from_millis(self.pacing_tick_ms.max(1))
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    /// Options shared by the video and audio pipelines
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            deinterlace: self.deinterlace,
            timing_lock: self.timing_lock,
            drop_threshold: self.drop_threshold(),
            flush_timeout: self.flush_timeout(),
            pacing_tick: self.pacing_tick(),
            feed_timeout: self.feed_timeout(),
            violation_policy: self.violation_policy,
            region: self.display_region,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
