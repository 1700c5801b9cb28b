//! Component catalog: the contract hardware components satisfy, and a
//! software catalog that implements it
//!
//! The pipeline never names a concrete decoder. It asks a
//! [`ComponentCatalog`] for a backend by [`ComponentRole`] and reserves the
//! input buffer memory through it, so a device port only has to provide a
//! catalog of its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::graph::PortSpec;
use super::types::{Codec, MediaKind, MediaUnit, StreamDescriptor};
use crate::error::{PipelineError, Result};

/// Role a component plays in a stream graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentRole {
    VideoDecode,
    ImageFilter,
    VideoRender,
    AudioDecode,
    AudioRender,
}

impl ComponentRole {
    pub fn name(&self) -> &'static str {
        match self {
            ComponentRole::VideoDecode => "video_decode",
            ComponentRole::ImageFilter => "image_fx",
            ComponentRole::VideoRender => "video_render",
            ComponentRole::AudioDecode => "audio_decode",
            ComponentRole::AudioRender => "audio_render",
        }
    }

    /// Input port number, if the role has one
    pub fn input_port(&self) -> Option<u32> {
        match self {
            ComponentRole::VideoDecode => Some(130),
            ComponentRole::ImageFilter => Some(190),
            ComponentRole::VideoRender => Some(90),
            ComponentRole::AudioDecode => Some(120),
            ComponentRole::AudioRender => Some(100),
        }
    }

    /// Output port number, `None` for renderers
    pub fn output_port(&self) -> Option<u32> {
        match self {
            ComponentRole::VideoDecode => Some(131),
            ComponentRole::ImageFilter => Some(191),
            ComponentRole::AudioDecode => Some(121),
            ComponentRole::VideoRender | ComponentRole::AudioRender => None,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            ComponentRole::VideoDecode | ComponentRole::ImageFilter | ComponentRole::VideoRender => {
                MediaKind::Video
            }
            ComponentRole::AudioDecode | ComponentRole::AudioRender => MediaKind::Audio,
        }
    }

    pub fn ports(&self) -> Vec<PortSpec> {
        let kind = self.kind();
        self.input_port()
            .map(|p| PortSpec::input(p, kind))
            .into_iter()
            .chain(self.output_port().map(|p| PortSpec::output(p, kind)))
            .collect()
    }
}

impl std::fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Processing behind a graph component
///
/// `process` is called with the graph lock held, one unit at a time.
pub trait ComponentBackend: Send {
    fn role(&self) -> ComponentRole;

    /// Turn one input unit into at most one output unit
    fn process(&mut self, unit: MediaUnit) -> Result<Option<MediaUnit>>;

    /// Drop any internal state tied to the previous position
    fn flush(&mut self);

    /// Whether the backend holds no more work after a flush
    fn is_drained(&self) -> bool;

    /// Units the component can hold on each of its queues
    fn queue_depth(&self) -> usize;
}

/// Memory reserved from a catalog's buffer budget, returned on drop
#[derive(Debug)]
pub struct BufferLease {
    bytes: usize,
    pool: Arc<AtomicUsize>,
}

impl BufferLease {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Factory for component backends
pub trait ComponentCatalog: Send + Sync {
    /// Build the backend for `role`, or `Configuration` if the descriptor
    /// cannot be handled
    fn create(
        &self,
        role: ComponentRole,
        descriptor: &StreamDescriptor,
    ) -> Result<Box<dyn ComponentBackend>>;

    /// Reserve input buffer memory, `ResourceExhausted` when over budget
    fn reserve_buffers(&self, bytes: usize) -> Result<BufferLease>;
}

/// Pure software stand-in for a device catalog
#[derive(Debug, Clone)]
pub struct SoftwareCatalog {
    budget: usize,
    reserved: Arc<AtomicUsize>,
    max_width: u32,
    max_height: u32,
    codecs: Vec<Codec>,
}

impl SoftwareCatalog {
    pub const DEFAULT_BUDGET: usize = 64 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_budget(Self::DEFAULT_BUDGET)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget,
            reserved: Arc::new(AtomicUsize::new(0)),
            max_width: 1920,
            max_height: 1088,
            codecs: vec![
                Codec::H264,
                Codec::Mpeg4,
                Codec::Mpeg2,
                Codec::Vc1,
                Codec::Mjpeg,
                Codec::Vp8,
                Codec::Aac,
                Codec::Mp3,
                Codec::Ac3,
                Codec::Dts,
                Codec::Pcm,
            ],
        }
    }

    pub fn with_max_resolution(mut self, width: u32, height: u32) -> Self {
        self.max_width = width;
        self.max_height = height;
        self
    }

    pub fn with_codecs(mut self, codecs: Vec<Codec>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Bytes currently leased out
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    fn validate(&self, role: ComponentRole, descriptor: &StreamDescriptor) -> Result<()> {
        if role.kind() != descriptor.kind() {
            return Err(PipelineError::Configuration(format!(
                "{} cannot handle {} stream",
                role,
                descriptor.kind()
            )));
        }
        if !self.codecs.contains(&descriptor.codec) {
            return Err(PipelineError::Configuration(format!(
                "codec {} not supported",
                descriptor.codec
            )));
        }
        match descriptor.kind() {
            MediaKind::Video => {
                if descriptor.width == 0 || descriptor.height == 0 {
                    return Err(PipelineError::Configuration("empty video frame".into()));
                }
                if descriptor.width > self.max_width || descriptor.height > self.max_height {
                    return Err(PipelineError::Configuration(format!(
                        "{}x{} exceeds {}x{}",
                        descriptor.width, descriptor.height, self.max_width, self.max_height
                    )));
                }
                if !(descriptor.frame_rate.is_finite() && descriptor.frame_rate > 0.0) {
                    return Err(PipelineError::Configuration(format!(
                        "invalid frame rate {}",
                        descriptor.frame_rate
                    )));
                }
            }
            MediaKind::Audio => {
                if descriptor.sample_rate == 0 || descriptor.channels == 0 {
                    return Err(PipelineError::Configuration(format!(
                        "invalid audio layout {} Hz x {} channels",
                        descriptor.sample_rate, descriptor.channels
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for SoftwareCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentCatalog for SoftwareCatalog {
    fn create(
        &self,
        role: ComponentRole,
        descriptor: &StreamDescriptor,
    ) -> Result<Box<dyn ComponentBackend>> {
        self.validate(role, descriptor)?;
        let backend: Box<dyn ComponentBackend> = match role {
            ComponentRole::VideoDecode | ComponentRole::AudioDecode => {
                Box::new(SoftwareDecoder::new(role, descriptor))
            }
            ComponentRole::ImageFilter => Box::new(Deinterlacer),
            ComponentRole::VideoRender | ComponentRole::AudioRender => {
                Box::new(RenderPassthrough { role })
            }
        };
        Ok(backend)
    }

    fn reserve_buffers(&self, bytes: usize) -> Result<BufferLease> {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.budget {
                return Err(PipelineError::ResourceExhausted(format!(
                    "{} bytes requested, {} of {} in use",
                    bytes, current, self.budget
                )));
            }
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(BufferLease {
                        bytes,
                        pool: self.reserved.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Decoder stand-in: passes units through, rejecting empty payloads
#[derive(Debug)]
struct SoftwareDecoder {
    role: ComponentRole,
    depth: usize,
    decoded: u64,
}

impl SoftwareDecoder {
    fn new(role: ComponentRole, descriptor: &StreamDescriptor) -> Self {
        let depth = match descriptor.kind() {
            MediaKind::Video => 4,
            MediaKind::Audio => 8,
        };
        Self {
            role,
            depth,
            decoded: 0,
        }
    }
}

impl ComponentBackend for SoftwareDecoder {
    fn role(&self) -> ComponentRole {
        self.role
    }

    fn process(&mut self, unit: MediaUnit) -> Result<Option<MediaUnit>> {
        if unit.data.is_empty() {
            return Err(PipelineError::InvalidArgument(format!(
                "empty payload at {}",
                unit.pts
            )));
        }
        self.decoded += 1;
        Ok(Some(unit))
    }

    fn flush(&mut self) {
        log::trace!("{}: flush after {} units", self.role, self.decoded);
    }

    fn is_drained(&self) -> bool {
        true
    }

    fn queue_depth(&self) -> usize {
        self.depth
    }
}

#[derive(Debug)]
struct Deinterlacer;

impl ComponentBackend for Deinterlacer {
    fn role(&self) -> ComponentRole {
        ComponentRole::ImageFilter
    }

    fn process(&mut self, mut unit: MediaUnit) -> Result<Option<MediaUnit>> {
        unit.deinterlaced = true;
        Ok(Some(unit))
    }

    fn flush(&mut self) {}

    fn is_drained(&self) -> bool {
        true
    }

    fn queue_depth(&self) -> usize {
        2
    }
}

#[derive(Debug)]
struct RenderPassthrough {
    role: ComponentRole,
}

impl ComponentBackend for RenderPassthrough {
    fn role(&self) -> ComponentRole {
        self.role
    }

    fn process(&mut self, unit: MediaUnit) -> Result<Option<MediaUnit>> {
        Ok(Some(unit))
    }

    fn flush(&mut self) {}

    fn is_drained(&self) -> bool {
        true
    }

    fn queue_depth(&self) -> usize {
        match self.role.kind() {
            MediaKind::Video => 3,
            MediaKind::Audio => 8,
        }
    }
}
