//! Synthetic demuxer for the command line player
//!
//! Generates fixed-size packets at the stream's nominal unit rate and walks
//! them forward or backward depending on the clock's rate. Follows the feeder
//! protocol: on a discontinuity it acknowledges and restarts from the position
//! the pipeline hands back.

use bytes::Bytes;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tunnelplay::error::PipelineError;
use tunnelplay::pipeline::{MediaKind, Packet, PacketFeeder, PlaybackClock, StreamDescriptor, Timestamp};
use tunnelplay::utils::sos::SignalOfStop;

const RETRY_DELAY: Duration = Duration::from_millis(5);
const KEYFRAME_INTERVAL: i64 = 30;

pub struct SyntheticDemuxer {
    feeder: PacketFeeder,
    clock: Arc<PlaybackClock>,
    stop: SignalOfStop,
    payload: Bytes,
    unit_micros: i64,
    duration: Timestamp,
    next: i64,
    eos_sent: bool,
}

impl SyntheticDemuxer {
    pub fn new(
        feeder: PacketFeeder,
        descriptor: &StreamDescriptor,
        duration: Timestamp,
        clock: Arc<PlaybackClock>,
        stop: SignalOfStop,
    ) -> Self {
        let payload_size = match descriptor.kind() {
            MediaKind::Video => 4096,
            MediaKind::Audio => 1024,
        };
        Self {
            feeder,
            clock,
            stop,
            payload: Bytes::from(vec![0u8; payload_size]),
            unit_micros: (descriptor.unit_duration().as_micros() as i64).max(1),
            duration,
            next: 0,
            eos_sent: false,
        }
    }

    /// Run on a dedicated thread until the session stops
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let name = format!("{}-demux", self.feeder.kind());
        std::thread::Builder::new().name(name).spawn(move || self.run())
    }

    fn run(mut self) {
        log::debug!("{} demuxer: started", self.feeder.kind());
        while !self.stop.cancelled() {
            if self.next < 0 || self.next > self.duration.micros {
                if !self.finish() {
                    break;
                }
                continue;
            }

            let index = self.next / self.unit_micros;
            let mut packet = Packet::new(self.payload.clone(), Some(Timestamp::from_micros(self.next)));
            packet.is_keyframe = index % KEYFRAME_INTERVAL == 0;

            match self.feeder.feed(&packet) {
                Ok(()) => self.advance(),
                Err(PipelineError::Backpressure { .. }) => {}
                Err(PipelineError::Discontinuity { .. }) => {
                    if !self.reposition() {
                        break;
                    }
                }
                Err(PipelineError::Quiesced) => {
                    self.stop.wait_timeout(RETRY_DELAY);
                }
                Err(PipelineError::Cancelled) => break,
                Err(e) => {
                    log::warn!("{} demuxer: skipping packet: {}", self.feeder.kind(), e);
                    self.advance();
                }
            }
        }
        log::debug!("{} demuxer: stopped", self.feeder.kind());
    }

    fn advance(&mut self) {
        if self.clock.rate() < 0 {
            self.next -= self.unit_micros;
        } else {
            self.next += self.unit_micros;
        }
    }

    /// Past either end: mark end of stream once, then wait for a jump.
    /// False when the session is gone.
    fn finish(&mut self) -> bool {
        if self.feeder.discontinuity_pending() {
            return self.reposition();
        }
        if !self.eos_sent {
            match self.feeder.end_of_stream() {
                Ok(()) => self.eos_sent = true,
                Err(PipelineError::Discontinuity { .. }) => return self.reposition(),
                Err(e) => {
                    log::warn!("{} demuxer: {}", self.feeder.kind(), e);
                    return false;
                }
            }
        }
        !self.stop.wait_timeout(Duration::from_millis(10))
    }

    fn reposition(&mut self) -> bool {
        loop {
            match self.feeder.acknowledge_discontinuity() {
                Ok(restart) => {
                    // Snap to the unit grid so pts stay aligned with the stream
                    self.next = restart.micros / self.unit_micros * self.unit_micros;
                    self.eos_sent = false;
                    log::debug!("{} demuxer: restarting at {}", self.feeder.kind(), restart);
                    return true;
                }
                Err(PipelineError::Quiesced) => {
                    if self.stop.wait_timeout(RETRY_DELAY) {
                        return false;
                    }
                }
                Err(e) => {
                    log::warn!("{} demuxer: {}", self.feeder.kind(), e);
                    return false;
                }
            }
        }
    }
}
