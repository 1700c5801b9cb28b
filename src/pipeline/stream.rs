//! Per-stream decode pipeline
//!
//! A [`StreamPipeline`] owns the component graph for one elementary stream
//! (decode, optional image filter, render), the input buffer in front of it,
//! and one pacing worker thread that moves units through the graph and hands
//! them to the sink as the clock reaches them.
//!
//! Packets come in on the demuxer's thread through a [`PacketFeeder`]. After
//! every clock discontinuity the feeder refuses packets with
//! [`PipelineError::Discontinuity`] until the demuxer acknowledges it and
//! repositions to the restart point it gets back.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::catalog::{ComponentBackend, ComponentCatalog, ComponentRole};
use super::clock::PlaybackClock;
use super::frames::FrameAccountant;
use super::graph::{ComponentGraph, ComponentHandle, ViolationPolicy};
use super::health::PipelineHealth;
use super::input::{InputBuffer, SlotLayout};
use super::pacing::{self, PaceDecision, PtsInterpolator};
use super::types::{MediaKind, MediaUnit, Packet, StreamDescriptor, Timestamp};
use crate::display::{AudioSink, DisplayRegion, RenderSink};
use crate::error::{PipelineError, Result};
use crate::utils::sos::SignalOfStop;

/// Longest a blocked feeder or step waiter sleeps before rechecking for close
const WAIT_SLICE: Duration = Duration::from_millis(10);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Per-pipeline tuning, fixed at open
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Insert the image filter stage between decode and render (video only)
    pub deinterlace: bool,
    /// Ask the render sink to lock its refresh to the nominal frame rate
    pub timing_lock: bool,
    /// How late a unit may be, at 1x, before it is dropped
    pub drop_threshold: Duration,
    pub flush_timeout: Duration,
    /// Worker wake-up period
    pub pacing_tick: Duration,
    /// Default bound for [`PacketFeeder::feed`]
    pub feed_timeout: Duration,
    pub violation_policy: ViolationPolicy,
    pub region: DisplayRegion,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            deinterlace: false,
            timing_lock: false,
            drop_threshold: Duration::from_millis(100),
            flush_timeout: Duration::from_millis(500),
            pacing_tick: Duration::from_millis(2),
            feed_timeout: Duration::from_millis(200),
            violation_policy: ViolationPolicy::default(),
            region: DisplayRegion::default(),
        }
    }
}

/// Where presented units go
pub enum OutputSink {
    Video(Box<dyn RenderSink>),
    Audio(Box<dyn AudioSink>),
    /// Units are paced and counted, then dropped
    Discard,
}

impl OutputSink {
    fn kind(&self) -> Option<MediaKind> {
        match self {
            OutputSink::Video(_) => Some(MediaKind::Video),
            OutputSink::Audio(_) => Some(MediaKind::Audio),
            OutputSink::Discard => None,
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Video(_) => write!(f, "OutputSink::Video"),
            OutputSink::Audio(_) => write!(f, "OutputSink::Audio"),
            OutputSink::Discard => write!(f, "OutputSink::Discard"),
        }
    }
}

/// Session-wide collaborators a pipeline paces against
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub clock: Arc<PlaybackClock>,
    pub stop: SignalOfStop,
    /// Receives exact presented-frame counts (video pipelines)
    pub frames: Option<Arc<Mutex<FrameAccountant>>>,
}

impl PipelineContext {
    pub fn new(clock: Arc<PlaybackClock>) -> Self {
        Self {
            clock,
            stop: SignalOfStop::new(),
            frames: None,
        }
    }

    pub fn with_stop(mut self, stop: SignalOfStop) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_frames(mut self, frames: Arc<Mutex<FrameAccountant>>) -> Self {
        self.frames = Some(frames);
        self
    }
}

/// State guarded by the pipeline lock
struct Shared {
    input: InputBuffer,
    graph: ComponentGraph,
    decoder: ComponentHandle,
    renderer: ComponentHandle,
    interpolator: PtsInterpolator,
    sequence: u64,
    end_of_stream: bool,
    step_budget: u32,
    stepped: u32,
    fault: Option<PipelineError>,
    output: OutputSink,
    region: DisplayRegion,
    /// Where feeders resume after `restart_epoch` began
    restart_at: Timestamp,
    restart_epoch: u64,
}

struct Inner {
    kind: MediaKind,
    descriptor: StreamDescriptor,
    options: PipelineOptions,
    clock: Arc<PlaybackClock>,
    stop: SignalOfStop,
    frames: Option<Arc<Mutex<FrameAccountant>>>,
    health: Arc<PipelineHealth>,
    shared: Mutex<Shared>,
    /// Signalled when input slots free up
    space: Condvar,
    /// Signalled when a step frame is presented
    stepped: Condvar,
    accepting: AtomicBool,
    first_frame: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn shutting_down(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.stop.cancelled()
    }

    /// Enqueue under the pipeline lock. `acked_epoch` is the epoch a feeder
    /// last acknowledged; a packet from before a discontinuity never gets in,
    /// however long it waited for space.
    fn push_locked(
        &self,
        shared: &mut Shared,
        packet: &Packet,
        acked_epoch: Option<u64>,
    ) -> Result<()> {
        if let Some(acked) = acked_epoch {
            let epoch = self.clock.epoch();
            if acked != epoch || acked != shared.restart_epoch {
                return Err(PipelineError::Discontinuity { epoch });
            }
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PipelineError::Quiesced);
        }
        match shared.input.try_push(packet) {
            Err(PipelineError::Oversized { size, capacity }) => {
                log::warn!(
                    "{} pipeline: dropped {} byte packet, input holds {} bytes",
                    self.kind,
                    size,
                    capacity
                );
                Err(PipelineError::Oversized { size, capacity })
            }
            other => other,
        }
    }

    fn try_decode(&self, packet: &Packet, acked_epoch: Option<u64>) -> Result<()> {
        let mut shared = self.shared.lock();
        let result = self.push_locked(&mut shared, packet, acked_epoch);
        if let Err(PipelineError::Backpressure { .. }) = result {
            self.health.record_backpressure();
        }
        result
    }

    fn decode_timeout(&self, packet: &Packet, acked_epoch: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        loop {
            if self.shutting_down() {
                return Err(PipelineError::Cancelled);
            }
            match self.push_locked(&mut shared, packet, Some(acked_epoch)) {
                Err(PipelineError::Backpressure { .. }) if Instant::now() < deadline => {
                    let wake = deadline.min(Instant::now() + WAIT_SLICE);
                    self.space.wait_until(&mut shared, wake);
                }
                Err(e @ PipelineError::Backpressure { .. }) => {
                    self.health.record_backpressure();
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// One worker pass: input into the decoder, pump, present what is due
    fn tick(&self) -> Result<()> {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;

        let epoch = self.clock.epoch();
        let rate = self.clock.rate();
        let mut moved = false;
        while shared.graph.can_accept(shared.decoder) {
            let Some(packet) = shared.input.pop() else {
                break;
            };
            let pts = shared.interpolator.resolve(packet.pts, rate);
            let mut unit = MediaUnit::new(self.kind, packet.data, pts, epoch, shared.sequence);
            unit.is_keyframe = packet.is_keyframe;
            shared.sequence += 1;
            shared.graph.feed(shared.decoder, unit)?;
            moved = true;
        }
        if moved {
            self.space.notify_all();
        }

        let report = shared.graph.pump()?;
        for _ in 0..report.failures {
            self.health.record_decode_failure();
        }
        if shared.graph.first_output_seen() && !self.first_frame.swap(true, Ordering::AcqRel) {
            log::info!("{} pipeline: first frame ready", self.kind);
        }

        self.present_due(shared);

        let idle = (self.clock.is_paused() && shared.step_budget == 0)
            || !self.accepting.load(Ordering::Acquire)
            || (shared.end_of_stream && shared.input.is_empty() && shared.graph.is_drained());
        self.health.set_idle(idle);
        Ok(())
    }

    fn present_due(&self, shared: &mut Shared) {
        let renderer = shared.renderer;
        loop {
            let Some((pts, epoch)) = shared.graph.front(renderer).map(|u| (u.pts, u.epoch)) else {
                return;
            };
            self.clock.packet_boundary();
            let clock = self.clock.snapshot();

            if shared.step_budget > 0 && clock.paused {
                if epoch != clock.epoch {
                    shared.graph.pop_output(renderer);
                    self.health.record_stale_discard();
                    continue;
                }
                if let Some(unit) = shared.graph.pop_output(renderer) {
                    self.present(shared, &unit);
                    self.clock.advance_paused_to(unit.pts);
                    shared.step_budget -= 1;
                    shared.stepped += 1;
                    self.stepped.notify_all();
                }
                return;
            }

            if self.kind == MediaKind::Audio && clock.paused {
                return;
            }

            match pacing::decide(pts, epoch, &clock, self.options.drop_threshold) {
                PaceDecision::Wait => return,
                PaceDecision::DiscardStale => {
                    shared.graph.pop_output(renderer);
                    self.health.record_stale_discard();
                }
                PaceDecision::DropLate => {
                    shared.graph.pop_output(renderer);
                    self.health.record_late_drop();
                    if let Some(frames) = &self.frames {
                        frames.lock().record_skipped();
                    }
                    log::trace!("{} pipeline: dropped late unit {}", self.kind, pts);
                }
                PaceDecision::Present => {
                    if let Some(unit) = shared.graph.pop_output(renderer) {
                        self.present(shared, &unit);
                    }
                    // One frame per refresh
                    if self.kind == MediaKind::Video {
                        return;
                    }
                }
            }
        }
    }

    fn present(&self, shared: &mut Shared, unit: &MediaUnit) {
        let region = shared.region;
        match &mut shared.output {
            OutputSink::Video(sink) => {
                let exact = sink.present(unit, &region, self.options.timing_lock);
                if let Some(frames) = &self.frames {
                    frames.lock().record_presented(exact);
                }
            }
            OutputSink::Audio(sink) => sink.play(unit),
            OutputSink::Discard => {}
        }
        self.health.record_presented(unit.size());
    }

    fn run(self: Arc<Self>) {
        log::debug!("{} pacer: started", self.kind);
        let mut last_stats = Instant::now();

        while !self.shutting_down() {
            if let Err(e) = self.tick() {
                log::error!("{} pacer: {}", self.kind, e);
                self.accepting.store(false, Ordering::Release);
                self.shared.lock().fault = Some(e);
                break;
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                log::info!("{} pipeline: {}", self.kind, self.health.summary());
                last_stats = Instant::now();
            }

            self.stop.wait_timeout(self.options.pacing_tick);
        }

        self.space.notify_all();
        self.stepped.notify_all();
        log::debug!("{} pacer: stopped", self.kind);
    }
}

/// Decode pipeline for one elementary stream
pub struct StreamPipeline {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl StreamPipeline {
    /// Build the graph for `descriptor` and start the pacing worker
    ///
    /// Nothing is retained on failure: components built so far are torn
    /// down and the buffer reservation is returned.
    pub fn open(
        descriptor: &StreamDescriptor,
        context: PipelineContext,
        options: PipelineOptions,
        catalog: &dyn ComponentCatalog,
        mut output: OutputSink,
    ) -> Result<Self> {
        let kind = descriptor.kind();
        if output.kind().is_some_and(|k| k != kind) {
            return Err(PipelineError::Configuration(format!(
                "{:?} cannot present a {} stream",
                output, kind
            )));
        }

        let (decode_role, render_role) = match kind {
            MediaKind::Video => (ComponentRole::VideoDecode, ComponentRole::VideoRender),
            MediaKind::Audio => (ComponentRole::AudioDecode, ComponentRole::AudioRender),
        };
        let mut roles = vec![decode_role];
        if options.deinterlace && kind == MediaKind::Video {
            roles.push(ComponentRole::ImageFilter);
        }
        roles.push(render_role);

        let mut backends = Vec::with_capacity(roles.len());
        for role in &roles {
            backends.push((*role, catalog.create(*role, descriptor)?));
        }

        let layout = SlotLayout::for_descriptor(descriptor);
        let lease = catalog.reserve_buffers(layout.capacity_bytes())?;
        let input = InputBuffer::new(layout).with_lease(lease);

        let mut graph = ComponentGraph::new(options.violation_policy);
        let (decoder, renderer) = match Self::wire(&mut graph, backends) {
            Ok(handles) => handles,
            Err(e) => {
                if let Err(teardown) = graph.teardown() {
                    log::error!("{} pipeline: teardown after failed open: {}", kind, teardown);
                }
                return Err(e);
            }
        };

        match &mut output {
            OutputSink::Video(sink) => sink.configure(descriptor, &options.region),
            OutputSink::Audio(sink) => sink.configure(descriptor),
            OutputSink::Discard => {}
        }

        let epoch = context.clock.epoch();
        let inner = Arc::new(Inner {
            kind,
            descriptor: descriptor.clone(),
            clock: context.clock,
            stop: context.stop,
            frames: context.frames,
            health: Arc::new(PipelineHealth::new()),
            shared: Mutex::new(Shared {
                input,
                graph,
                decoder,
                renderer,
                interpolator: PtsInterpolator::new(descriptor.unit_duration()),
                sequence: 0,
                end_of_stream: false,
                step_budget: 0,
                stepped: 0,
                fault: None,
                output,
                region: options.region,
                restart_at: Timestamp::ZERO,
                restart_epoch: epoch,
            }),
            options,
            space: Condvar::new(),
            stepped: Condvar::new(),
            accepting: AtomicBool::new(true),
            first_frame: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let name = format!("{}-pacer", kind);
        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_inner.run())
            .map_err(|e| PipelineError::ResourceExhausted(format!("pacer thread: {}", e)))?;

        log::info!(
            "{} pipeline: opened {} ({} input slots of {} bytes{})",
            kind,
            descriptor.codec,
            layout.slot_count,
            layout.slot_size,
            if roles.contains(&ComponentRole::ImageFilter) {
                ", deinterlaced"
            } else {
                ""
            }
        );

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    fn wire(
        graph: &mut ComponentGraph,
        backends: Vec<(ComponentRole, Box<dyn ComponentBackend>)>,
    ) -> Result<(ComponentHandle, ComponentHandle)> {
        let mut chain: Vec<(ComponentRole, ComponentHandle)> = Vec::with_capacity(backends.len());
        for (role, backend) in backends {
            let handle = graph.add_component(role.name(), role.ports(), backend)?;
            if let Some((prev_role, prev)) = chain.last()
                && let (Some(out), Some(input)) = (prev_role.output_port(), role.input_port())
            {
                graph.tunnel(*prev, out, handle, input)?;
            }
            chain.push((role, handle));
        }
        graph.activate_all()?;

        match (chain.first(), chain.last()) {
            (Some((_, decoder)), Some((_, renderer))) => Ok((*decoder, *renderer)),
            _ => Err(PipelineError::Configuration("empty component chain".into())),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.inner.descriptor
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.inner.health.clone()
    }

    /// Enqueue a packet without blocking. False on backpressure or when the
    /// pipeline is quiesced; see [`try_decode`](Self::try_decode) for why.
    pub fn decode(&self, packet: &Packet) -> bool {
        self.try_decode(packet).is_ok()
    }

    pub fn try_decode(&self, packet: &Packet) -> Result<()> {
        self.inner.try_decode(packet, None)
    }

    /// Handle for feeding packets from another thread
    pub fn feeder(&self) -> PacketFeeder {
        let acked_epoch = self.inner.shared.lock().restart_epoch;
        PacketFeeder {
            inner: self.inner.clone(),
            acked_epoch,
        }
    }

    /// Stop or resume accepting packets
    pub fn set_accepting(&self, accepting: bool) {
        // Taken under the lock so no push straddles a flush
        let _shared = self.inner.shared.lock();
        self.inner.accepting.store(accepting, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Discard queued packets and in-flight units, waiting for the graph to
    /// drain
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let mut shared = self.inner.shared.lock();
        shared.input.clear();
        shared.step_budget = 0;
        shared.end_of_stream = false;
        let result = shared.graph.flush(timeout, &self.inner.stop);
        drop(shared);

        self.inner.space.notify_all();
        match &result {
            Ok(()) => self.inner.health.record_flush(),
            Err(e) => log::error!("{} pipeline: flush failed: {}", self.inner.kind, e),
        }
        result
    }

    /// Reopen the feed after a quiesce; feeders restart from `restart_at`
    pub fn resume_feed(&self, restart_at: Timestamp) {
        let mut shared = self.inner.shared.lock();
        shared.restart_at = restart_at;
        shared.restart_epoch = self.inner.clock.epoch();
        shared.interpolator.reset(restart_at);
        self.inner.accepting.store(true, Ordering::Release);
        drop(shared);
        self.inner.space.notify_all();
    }

    pub fn signal_end_of_stream(&self) {
        self.inner.shared.lock().end_of_stream = true;
        log::debug!("{} pipeline: end of stream", self.inner.kind);
    }

    pub fn end_of_stream(&self) -> bool {
        self.inner.shared.lock().end_of_stream
    }

    /// Present `frames` more units with the clock paused, waiting up to
    /// `timeout`. Returns how many were presented.
    pub fn request_step(&self, frames: u32, timeout: Duration) -> Result<u32> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.inner.shared.lock();
        shared.step_budget = frames;
        shared.stepped = 0;

        while shared.step_budget > 0 {
            if self.inner.shutting_down() {
                shared.step_budget = 0;
                return Err(PipelineError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wake = deadline.min(now + WAIT_SLICE);
            self.inner.stepped.wait_until(&mut shared, wake);
        }

        shared.step_budget = 0;
        Ok(shared.stepped)
    }

    pub fn is_first_frame_ready(&self) -> bool {
        self.inner.first_frame.load(Ordering::Acquire)
    }

    /// No packets queued and nothing left in the graph
    pub fn is_drained(&self) -> bool {
        let shared = self.inner.shared.lock();
        shared.input.is_empty() && shared.graph.is_drained()
    }

    pub fn queued_packets(&self) -> usize {
        self.inner.shared.lock().input.len()
    }

    /// Escalating error hit by the pacing worker, if any
    pub fn fault(&self) -> Option<PipelineError> {
        self.inner.shared.lock().fault.clone()
    }

    pub fn set_region(&self, region: DisplayRegion) {
        let mut shared = self.inner.shared.lock();
        shared.region = region;
        if let OutputSink::Video(sink) = &mut shared.output {
            sink.set_region(&region);
        }
    }

    /// Forward an output gain in millibels to an audio sink
    pub fn set_gain(&self, millibels: i32) {
        if let OutputSink::Audio(sink) = &mut self.inner.shared.lock().output {
            sink.set_gain(millibels);
        }
    }

    /// Stop the worker and tear the graph down. Idempotent.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.closed.store(true, Ordering::Release);
        self.inner.space.notify_all();
        self.inner.stepped.notify_all();

        if worker.join().is_err() {
            log::error!("{} pipeline: pacer panicked", self.inner.kind);
        }

        let mut shared = self.inner.shared.lock();
        shared.input.clear();
        if let Err(e) = shared.graph.teardown() {
            log::error!("{} pipeline: teardown failed: {}", self.inner.kind, e);
        }
        log::info!(
            "{} pipeline: closed, {}",
            self.inner.kind,
            self.inner.health.summary()
        );
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("kind", &self.inner.kind)
            .field("codec", &self.inner.descriptor.codec)
            .field("accepting", &self.is_accepting())
            .field("open", &self.worker.is_some())
            .finish()
    }
}

/// Demuxer-side handle to a pipeline's input
///
/// Each feeder remembers the last clock epoch it acknowledged. Once the clock
/// moves on (seek, loop, rate change) every call fails with
/// [`PipelineError::Discontinuity`] until
/// [`acknowledge_discontinuity`](Self::acknowledge_discontinuity) hands back
/// the position to restart from.
#[derive(Clone)]
pub struct PacketFeeder {
    inner: Arc<Inner>,
    acked_epoch: u64,
}

impl PacketFeeder {
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn discontinuity_pending(&self) -> bool {
        self.inner.clock.epoch() != self.acked_epoch
    }

    fn check_epoch(&self) -> Result<()> {
        let epoch = self.inner.clock.epoch();
        if epoch != self.acked_epoch {
            return Err(PipelineError::Discontinuity { epoch });
        }
        Ok(())
    }

    /// Accept the latest discontinuity and get the media position to resume
    /// feeding from. `Quiesced` while the pipeline is still settling.
    pub fn acknowledge_discontinuity(&mut self) -> Result<Timestamp> {
        let shared = self.inner.shared.lock();
        if shared.restart_epoch != self.inner.clock.epoch() {
            return Err(PipelineError::Quiesced);
        }
        self.acked_epoch = shared.restart_epoch;
        Ok(shared.restart_at)
    }

    /// Enqueue without blocking
    pub fn try_feed(&self, packet: &Packet) -> Result<()> {
        self.check_epoch()?;
        self.inner.try_decode(packet, Some(self.acked_epoch))
    }

    /// Enqueue, waiting up to the pipeline's feed timeout for space
    pub fn feed(&self, packet: &Packet) -> Result<()> {
        self.feed_timeout(packet, self.inner.options.feed_timeout)
    }

    /// Enqueue, waiting up to `timeout` for space. Interrupted by close, and
    /// by any discontinuity that happens during the wait.
    pub fn feed_timeout(&self, packet: &Packet, timeout: Duration) -> Result<()> {
        self.check_epoch()?;
        self.inner.decode_timeout(packet, self.acked_epoch, timeout)
    }

    /// Mark the end of this stream at the current epoch
    pub fn end_of_stream(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock();
        self.check_epoch()?;
        shared.end_of_stream = true;
        drop(shared);
        log::debug!("{} feeder: end of stream", self.inner.kind);
        Ok(())
    }
}

impl std::fmt::Debug for PacketFeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFeeder")
            .field("kind", &self.inner.kind)
            .field("acked_epoch", &self.acked_epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::SinkProbe;
    use crate::pipeline::catalog::SoftwareCatalog;
    use crate::pipeline::clock::ManualTime;
    use crate::pipeline::types::{Codec, SampleFormat};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn video_descriptor() -> StreamDescriptor {
        StreamDescriptor::video(Codec::H264, 640, 480, 25.0)
    }

    fn frame(index: i64) -> Packet {
        Packet::new(vec![1u8; 512], Some(Timestamp::from_micros(index * 40_000)))
    }

    fn test_options() -> PipelineOptions {
        PipelineOptions {
            violation_policy: ViolationPolicy::Report,
            ..PipelineOptions::default()
        }
    }

    fn open_video(
        probe: &SinkProbe,
        options: PipelineOptions,
    ) -> (ManualTime, Arc<PlaybackClock>, StreamPipeline) {
        let time = ManualTime::new();
        let clock = Arc::new(PlaybackClock::with_time_source(Arc::new(time.clone())));
        let pipeline = StreamPipeline::open(
            &video_descriptor(),
            PipelineContext::new(clock.clone()),
            options,
            &SoftwareCatalog::new(),
            OutputSink::Video(probe.render_sink(true)),
        )
        .unwrap();
        (time, clock, pipeline)
    }

    #[test]
    fn test_open_rejects_unsupported_codec() {
        let clock = Arc::new(PlaybackClock::new());
        let catalog = SoftwareCatalog::new();
        let result = StreamPipeline::open(
            &StreamDescriptor::video(Codec::Hevc, 640, 480, 25.0),
            PipelineContext::new(clock),
            test_options(),
            &catalog,
            OutputSink::Discard,
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
        assert_eq!(catalog.reserved(), 0);
    }

    #[test]
    fn test_open_reports_exhausted_budget() {
        let clock = Arc::new(PlaybackClock::new());
        let catalog = SoftwareCatalog::with_budget(1024);
        let result = StreamPipeline::open(
            &video_descriptor(),
            PipelineContext::new(clock),
            test_options(),
            &catalog,
            OutputSink::Discard,
        );
        assert!(matches!(result, Err(PipelineError::ResourceExhausted(_))));
    }

    #[test]
    fn test_open_rejects_mismatched_sink() {
        let probe = SinkProbe::new();
        let result = StreamPipeline::open(
            &StreamDescriptor::audio(Codec::Aac, 44_100, 2, SampleFormat::S16),
            PipelineContext::new(Arc::new(PlaybackClock::new())),
            test_options(),
            &SoftwareCatalog::new(),
            OutputSink::Video(probe.render_sink(false)),
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_first_frame_presented_while_clock_paused() {
        let probe = SinkProbe::new();
        let (_time, clock, pipeline) = open_video(&probe, test_options());

        assert!(pipeline.decode(&frame(0)));
        assert!(pipeline.decode(&frame(1)));
        assert!(wait_for(|| pipeline.is_first_frame_ready()));
        assert!(wait_for(|| probe.frame_count() == 1));

        // Frame 1 waits for the clock
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.frame_count(), 1);
        assert!(clock.is_paused());
        assert_eq!(probe.configured().len(), 1);
    }

    #[test]
    fn test_frames_paced_by_clock() {
        let probe = SinkProbe::new();
        let (time, clock, pipeline) = open_video(&probe, test_options());
        for i in 0..5 {
            assert!(pipeline.decode(&frame(i)));
        }
        clock.start(Timestamp::ZERO);
        assert!(wait_for(|| probe.frame_count() == 1));

        time.advance(Duration::from_millis(80));
        assert!(wait_for(|| probe.frame_count() == 3));
        let pts: Vec<_> = probe.frames().iter().map(|f| f.pts.micros).collect();
        assert_eq!(pts, vec![0, 40_000, 80_000]);
    }

    #[test]
    fn test_stale_units_discarded_after_flush_race() {
        let probe = SinkProbe::new();
        let (_time, clock, pipeline) = open_video(&probe, test_options());
        pipeline.decode(&frame(10));
        assert!(wait_for(|| pipeline.is_first_frame_ready()));

        clock.notify_discontinuity(Timestamp::from_seconds(1.0));
        assert!(wait_for(|| pipeline.health().stale_discards() == 1));
        assert_eq!(probe.frame_count(), 0);
    }

    #[test]
    fn test_late_units_dropped() {
        let probe = SinkProbe::new();
        let (time, clock, pipeline) = open_video(&probe, test_options());
        clock.start(Timestamp::ZERO);
        time.advance(Duration::from_secs(1));

        pipeline.decode(&frame(0));
        pipeline.decode(&frame(24));
        assert!(wait_for(|| probe.frame_count() == 1));
        assert_eq!(pipeline.health().late_drops(), 1);
        assert_eq!(probe.last_frame().unwrap().pts.micros, 960_000);
    }

    #[test]
    fn test_backpressure_keeps_queue_intact() {
        let probe = SinkProbe::new();
        let (_time, _clock, pipeline) = open_video(&probe, test_options());
        // Stop the worker from draining the input buffer
        pipeline.inner.closed.store(true, Ordering::Release);
        std::thread::sleep(Duration::from_millis(20));

        let big = |i: i64| Packet::new(vec![0u8; 80 * 1024], Some(Timestamp::from_micros(i)));
        let mut accepted = 0;
        while pipeline.decode(&big(accepted)) {
            accepted += 1;
        }
        let queued = pipeline.queued_packets();
        assert_eq!(queued as i64, accepted);
        assert!(matches!(
            pipeline.try_decode(&big(99)),
            Err(PipelineError::Backpressure { .. })
        ));
        assert_eq!(pipeline.queued_packets(), queued);
        assert!(pipeline.health().backpressure_refusals() >= 2);
    }

    #[test]
    fn test_quiesced_pipeline_refuses_packets() {
        let probe = SinkProbe::new();
        let (_time, _clock, pipeline) = open_video(&probe, test_options());
        pipeline.set_accepting(false);
        assert_eq!(pipeline.try_decode(&frame(0)), Err(PipelineError::Quiesced));
        pipeline.resume_feed(Timestamp::ZERO);
        assert!(pipeline.try_decode(&frame(0)).is_ok());
    }

    #[test]
    fn test_flush_empties_pipeline() {
        let probe = SinkProbe::new();
        let (_time, _clock, pipeline) = open_video(&probe, test_options());
        for i in 0..4 {
            pipeline.decode(&frame(i + 1));
        }
        pipeline.signal_end_of_stream();
        pipeline.flush(Duration::from_millis(200)).unwrap();

        assert!(pipeline.is_drained());
        assert!(!pipeline.end_of_stream());
        assert_eq!(pipeline.health().flushes(), 1);
    }

    #[test]
    fn test_feeder_requires_acknowledged_discontinuity() {
        let probe = SinkProbe::new();
        let (_time, clock, pipeline) = open_video(&probe, test_options());
        let mut feeder = pipeline.feeder();
        assert!(feeder.try_feed(&frame(0)).is_ok());

        pipeline.set_accepting(false);
        pipeline.flush(Duration::from_millis(200)).unwrap();
        let epoch = clock.notify_discontinuity(Timestamp::from_seconds(2.0));

        assert!(feeder.discontinuity_pending());
        assert_eq!(
            feeder.try_feed(&frame(50)),
            Err(PipelineError::Discontinuity { epoch })
        );
        assert_eq!(feeder.acknowledge_discontinuity(), Err(PipelineError::Quiesced));

        pipeline.resume_feed(Timestamp::from_seconds(2.0));
        assert_eq!(
            feeder.acknowledge_discontinuity(),
            Ok(Timestamp::from_seconds(2.0))
        );
        assert!(feeder.try_feed(&frame(50)).is_ok());
        assert!(feeder.end_of_stream().is_ok());
    }

    #[test]
    fn test_close_interrupts_blocked_feeder() {
        let probe = SinkProbe::new();
        let (_time, _clock, mut pipeline) = open_video(&probe, test_options());

        // Clock stays paused, so the graph backs up into the input buffer
        let big = Packet::new(vec![0u8; 80 * 1024], None);
        while pipeline.decode(&big) {}

        let feeder = pipeline.feeder();
        let blocked = std::thread::spawn(move || {
            let start = Instant::now();
            let result = feeder.feed_timeout(&big, Duration::from_secs(30));
            (result, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(30));
        pipeline.close();

        let (result, elapsed) = blocked.join().unwrap();
        assert_eq!(result, Err(PipelineError::Cancelled));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_blocked_feeder_never_crosses_a_discontinuity() {
        let probe = SinkProbe::new();
        let (_time, clock, pipeline) = open_video(&probe, test_options());
        let stale = || Packet::new(vec![0u8; 80 * 1024], Some(Timestamp::from_seconds(9.0)));
        while pipeline.decode(&stale()) {}
        std::thread::sleep(Duration::from_millis(30));
        while pipeline.decode(&stale()) {}

        let feeder = pipeline.feeder();
        let blocked =
            std::thread::spawn(move || feeder.feed_timeout(&stale(), Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(30));

        pipeline.set_accepting(false);
        pipeline.flush(Duration::from_millis(200)).unwrap();
        clock.notify_discontinuity(Timestamp::ZERO);
        pipeline.resume_feed(Timestamp::ZERO);

        let result = blocked.join().unwrap();
        assert!(matches!(
            result,
            Err(PipelineError::Discontinuity { .. }) | Err(PipelineError::Quiesced)
        ));

        // Nothing from before the jump sits in front of the new position
        assert!(pipeline.decode(&frame(0)));
        assert!(wait_for(|| probe.frame_count() == 1));
        assert_eq!(probe.last_frame().unwrap().pts, Timestamp::ZERO);
    }

    #[test]
    fn test_step_presents_frames_while_paused() {
        let probe = SinkProbe::new();
        let (_time, clock, pipeline) = open_video(&probe, test_options());
        for i in 0..6 {
            pipeline.decode(&frame(i));
        }
        assert!(wait_for(|| probe.frame_count() == 1));

        let advanced = pipeline.request_step(3, Duration::from_secs(2)).unwrap();
        assert_eq!(advanced, 3);
        assert_eq!(probe.frame_count(), 4);
        assert_eq!(clock.media_time_micros(), 120_000);
        assert!(clock.is_paused());
        assert_eq!(clock.rate(), 1);
    }

    #[test]
    fn test_deinterlace_stage_inserted() {
        let probe = SinkProbe::new();
        let options = PipelineOptions {
            deinterlace: true,
            timing_lock: true,
            ..test_options()
        };
        let (_time, _clock, pipeline) = open_video(&probe, options);
        pipeline.decode(&frame(0));
        assert!(wait_for(|| probe.frame_count() == 1));

        let shown = probe.last_frame().unwrap();
        assert!(shown.deinterlaced);
        assert!(shown.timing_lock);
        let components = pipeline.inner.shared.lock().graph.components().len();
        assert_eq!(components, 3);
    }

    #[test]
    fn test_audio_waits_while_paused() {
        let probe = SinkProbe::new();
        let time = ManualTime::new();
        let clock = Arc::new(PlaybackClock::with_time_source(Arc::new(time.clone())));
        let pipeline = StreamPipeline::open(
            &StreamDescriptor::audio(Codec::Aac, 48_000, 2, SampleFormat::S16),
            PipelineContext::new(clock.clone()),
            test_options(),
            &SoftwareCatalog::new(),
            OutputSink::Audio(probe.audio_sink()),
        )
        .unwrap();

        pipeline.decode(&Packet::new(vec![0u8; 256], Some(Timestamp::ZERO)));
        assert!(wait_for(|| pipeline.is_first_frame_ready()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(probe.audio_units().is_empty());

        clock.start(Timestamp::ZERO);
        assert!(wait_for(|| probe.audio_units().len() == 1));

        pipeline.set_gain(-1200);
        assert_eq!(probe.gain(), Some(-1200));
    }
}
