//! Core types for the pipeline system

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timestamp representation for media time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Microseconds since stream origin
    pub micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from (possibly fractional) seconds
    pub fn from_seconds(seconds: f64) -> Self {
        Self {
            micros: (seconds * 1_000_000.0).round() as i64,
        }
    }

    /// Create a timestamp from a duration since origin
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    pub fn as_seconds(&self) -> f64 {
        self.micros as f64 / 1_000_000.0
    }

    /// Convert to duration, saturating negative values at zero
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }

    /// Subtract a duration from this timestamp
    pub fn sub(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros - duration.as_micros() as i64,
        }
    }

    /// Calculate the difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }

    pub fn clamp(self, min: Timestamp, max: Timestamp) -> Self {
        Self {
            micros: self.micros.clamp(min.micros, max.micros.max(min.micros)),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Compressed stream codecs known to the component catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Mpeg4,
    Mpeg2,
    Vc1,
    Mjpeg,
    Vp8,
    Hevc,
    Aac,
    Mp3,
    Ac3,
    Dts,
    Pcm,
    Opus,
}

impl Codec {
    pub fn kind(&self) -> MediaKind {
        match self {
            Codec::H264
            | Codec::Mpeg4
            | Codec::Mpeg2
            | Codec::Vc1
            | Codec::Mjpeg
            | Codec::Vp8
            | Codec::Hevc => MediaKind::Video,
            Codec::Aac | Codec::Mp3 | Codec::Ac3 | Codec::Dts | Codec::Pcm | Codec::Opus => {
                MediaKind::Audio
            }
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Audio sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }
}

/// Stream metadata supplied once at open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub codec: Codec,
    /// Frame width (video only)
    pub width: u32,
    /// Frame height (video only)
    pub height: u32,
    /// Nominal frames per second (video only)
    pub frame_rate: f64,
    pub aspect_ratio: f64,
    /// Sample rate (audio only)
    pub sample_rate: u32,
    /// Number of channels (audio only)
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamDescriptor {
    pub fn video(codec: Codec, width: u32, height: u32, frame_rate: f64) -> Self {
        let aspect_ratio = if height > 0 {
            width as f64 / height as f64
        } else {
            0.0
        };
        Self {
            codec,
            width,
            height,
            frame_rate,
            aspect_ratio,
            sample_rate: 0,
            channels: 0,
            sample_format: SampleFormat::S16,
        }
    }

    pub fn audio(codec: Codec, sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            codec,
            width: 0,
            height: 0,
            frame_rate: 0.0,
            aspect_ratio: 0.0,
            sample_rate,
            channels,
            sample_format,
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: f64) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }

    /// Nominal duration of one decoded unit: a frame for video, a
    /// 1024-sample block for audio
    pub fn unit_duration(&self) -> Duration {
        match self.kind() {
            MediaKind::Video if self.frame_rate > 0.0 => {
                Duration::from_secs_f64(1.0 / self.frame_rate)
            }
            MediaKind::Audio if self.sample_rate > 0 => {
                Duration::from_secs_f64(1024.0 / self.sample_rate as f64)
            }
            _ => Duration::ZERO,
        }
    }
}

/// Everything the demuxer knows about a movie before the first packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub video: Option<StreamDescriptor>,
    pub audio: Option<StreamDescriptor>,
    /// Stream duration in microseconds, zero when unknown
    pub duration_micros: i64,
}

impl MediaInfo {
    pub fn duration(&self) -> Timestamp {
        Timestamp::from_micros(self.duration_micros.max(0))
    }
}

/// Compressed packet produced by the demuxer
#[derive(Clone)]
pub struct Packet {
    pub data: Bytes,
    /// Presentation timestamp, `None` when the container did not provide one
    pub pts: Option<Timestamp>,
    pub is_keyframe: bool,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, pts: Option<Timestamp>) -> Self {
        Self {
            data: data.into(),
            pts,
            is_keyframe: false,
        }
    }

    pub fn keyframe(mut self) -> Self {
        self.is_keyframe = true;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("pts", &self.pts)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.size())
            .finish()
    }
}

/// Unit of media flowing through a component graph
///
/// Carries the presentation timestamp resolved at input time and the clock
/// epoch it was enqueued under, so a unit from before a discontinuity can
/// never be presented after it.
#[derive(Clone)]
pub struct MediaUnit {
    pub kind: MediaKind,
    pub data: Bytes,
    pub pts: Timestamp,
    pub epoch: u64,
    /// Monotonic input order within a pipeline
    pub sequence: u64,
    pub is_keyframe: bool,
    /// Set by the image filter stage
    pub deinterlaced: bool,
}

impl MediaUnit {
    pub fn new(kind: MediaKind, data: Bytes, pts: Timestamp, epoch: u64, sequence: u64) -> Self {
        Self {
            kind,
            data,
            pts,
            epoch,
            sequence,
            is_keyframe: false,
            deinterlaced: false,
        }
    }

    /// Get the size of the unit data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MediaUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaUnit")
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("epoch", &self.epoch)
            .field("sequence", &self.sequence)
            .field("deinterlaced", &self.deinterlaced)
            .field("size", &self.size())
            .finish()
    }
}
