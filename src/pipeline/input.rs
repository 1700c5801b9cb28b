//! Decoder input buffer
//!
//! Compressed packets are copied into fixed-size slots before they enter the
//! decode component. A packet spanning several slots is accepted only when
//! all of them are free, so the queue never holds a partial packet.

use std::collections::VecDeque;

use bytes::Bytes;

use super::catalog::BufferLease;
use super::types::{MediaKind, Packet, StreamDescriptor, Timestamp};
use crate::error::{PipelineError, Result};

const VIDEO_SLOT_SIZE: usize = 80 * 1024;
const AUDIO_SLOT_SIZE: usize = 16 * 1024;

/// Frames a demuxer may deliver back to back at the worst-case size
const VIDEO_BURST_FRAMES: usize = 4;
const MIN_VIDEO_SLOTS: usize = 20;
const AUDIO_BURST_BLOCKS: usize = 8;
const MIN_AUDIO_SLOTS: usize = 32;

/// Slot geometry for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub slot_size: usize,
    pub slot_count: usize,
}

impl SlotLayout {
    /// Size the buffer for worst-case compressed bursts of `descriptor`
    pub fn for_descriptor(descriptor: &StreamDescriptor) -> Self {
        match descriptor.kind() {
            MediaKind::Video => {
                // A compressed frame rarely exceeds half of its raw 4:2:0 size
                let worst_frame =
                    (descriptor.width as usize * descriptor.height as usize * 3 / 2) / 2;
                let per_frame = worst_frame.div_ceil(VIDEO_SLOT_SIZE).max(1);
                Self {
                    slot_size: VIDEO_SLOT_SIZE,
                    slot_count: (per_frame * VIDEO_BURST_FRAMES).max(MIN_VIDEO_SLOTS),
                }
            }
            MediaKind::Audio => {
                let block = 1024
                    * descriptor.channels as usize
                    * descriptor.sample_format.bytes_per_sample();
                let per_block = block.div_ceil(AUDIO_SLOT_SIZE).max(1);
                Self {
                    slot_size: AUDIO_SLOT_SIZE,
                    slot_count: (per_block * AUDIO_BURST_BLOCKS).max(MIN_AUDIO_SLOTS),
                }
            }
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.slot_size * self.slot_count
    }
}

/// A packet copied into input slots
#[derive(Clone)]
pub struct QueuedPacket {
    pub data: Bytes,
    pub pts: Option<Timestamp>,
    pub is_keyframe: bool,
    slots: usize,
}

impl QueuedPacket {
    pub fn slots(&self) -> usize {
        self.slots
    }
}

impl std::fmt::Debug for QueuedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedPacket")
            .field("pts", &self.pts)
            .field("size", &self.data.len())
            .field("slots", &self.slots)
            .finish()
    }
}

#[derive(Debug)]
pub struct InputBuffer {
    layout: SlotLayout,
    used_slots: usize,
    queue: VecDeque<QueuedPacket>,
    _lease: Option<BufferLease>,
}

impl InputBuffer {
    pub fn new(layout: SlotLayout) -> Self {
        Self {
            layout,
            used_slots: 0,
            queue: VecDeque::new(),
            _lease: None,
        }
    }

    /// Tie the buffer to memory reserved from a catalog, released on drop
    pub fn with_lease(mut self, lease: BufferLease) -> Self {
        self._lease = Some(lease);
        self
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    fn slots_for(&self, size: usize) -> usize {
        size.div_ceil(self.layout.slot_size).max(1)
    }

    /// Copy a packet in, all or nothing
    pub fn try_push(&mut self, packet: &Packet) -> Result<()> {
        let needed = self.slots_for(packet.size());
        if needed > self.layout.slot_count {
            return Err(PipelineError::Oversized {
                size: packet.size(),
                capacity: self.layout.capacity_bytes(),
            });
        }
        if self.used_slots + needed > self.layout.slot_count {
            return Err(PipelineError::Backpressure {
                used: self.used_slots,
                capacity: self.layout.slot_count,
            });
        }

        self.queue.push_back(QueuedPacket {
            data: Bytes::copy_from_slice(&packet.data),
            pts: packet.pts,
            is_keyframe: packet.is_keyframe,
            slots: needed,
        });
        self.used_slots += needed;
        Ok(())
    }

    pub fn front(&self) -> Option<&QueuedPacket> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<QueuedPacket> {
        let packet = self.queue.pop_front()?;
        self.used_slots -= packet.slots;
        Some(packet)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.used_slots = 0;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn used_slots(&self) -> usize {
        self.used_slots
    }

    pub fn free_slots(&self) -> usize {
        self.layout.slot_count - self.used_slots
    }
}
