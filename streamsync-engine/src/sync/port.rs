//! Per-port state of the synchronization engine

use super::buffer::InternalBuffer;
use std::fmt;
use streamsync_common::{MarkerList, MediaFormat, StreamFlags};

/// Small bitset of port indices (at most 32 ports)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortMask(u32);

impl PortMask {
    pub fn set(&mut self, index: usize) {
        if index < 32 {
            self.0 |= 1 << index;
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < 32 {
            self.0 &= !(1 << index);
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(self, other: PortMask) -> PortMask {
        PortMask(self.0 | other.0)
    }

    pub fn difference(self, other: PortMask) -> PortMask {
        PortMask(self.0 & !other.0)
    }

    /// Set indices, lowest first
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..32usize).filter(move |i| self.0 & (1 << i) != 0)
    }
}

impl fmt::Display for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Engine-wide synchronization phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// At least one port started since the last full sync
    #[default]
    Starting,
    /// Every started port has delivered threshold-sized output
    Synced,
}

/// Input port state
#[derive(Debug, Default)]
pub struct SyncInPort {
    pub(crate) media_format: Option<MediaFormat>,
    pub(crate) buffer: Option<InternalBuffer>,

    /// Flags and markers travelling with the buffered data
    pub(crate) int_flags: StreamFlags,
    pub(crate) int_markers: MarkerList,

    pub(crate) threshold_bytes_per_ch: u32,
    pub(crate) frame_size_bytes_per_ch: u32,

    /// Timestamp of the first buffered byte
    pub(crate) buffer_timestamp: Option<i64>,

    // Cleared at the start of every cycle
    pub(crate) pending_dfg: bool,
    pub(crate) pending_eof: bool,

    pub(crate) pending_eos: bool,
    pub(crate) eos_received: bool,
    pub(crate) output_sent_once: bool,
    pub(crate) threshold_disabled: bool,
    pub(crate) will_start_received: bool,
    pub(crate) best_effort: bool,

    /// Output was produced since the port last started
    pub(crate) emitted_since_start: bool,
}

impl SyncInPort {
    pub(crate) fn buffered_bytes_per_ch(&self) -> u32 {
        self.buffer.as_ref().map_or(0, InternalBuffer::len_per_ch)
    }

    pub(crate) fn meets_threshold(&self) -> bool {
        self.buffer.is_some() && self.buffered_bytes_per_ch() >= self.threshold_bytes_per_ch
    }

    pub(crate) fn has_buffer_space(&self) -> bool {
        self.buffer.as_ref().is_some_and(InternalBuffer::has_space)
    }

    pub fn is_threshold_disabled(&self) -> bool {
        self.threshold_disabled
    }

    pub fn has_sent_output(&self) -> bool {
        self.output_sent_once
    }

    pub fn threshold_bytes_per_ch(&self) -> u32 {
        self.threshold_bytes_per_ch
    }

    pub fn media_format(&self) -> Option<&MediaFormat> {
        self.media_format.as_ref()
    }
}

/// Output port state
#[derive(Debug, Default)]
pub struct SyncOutPort {
    /// Timestamp the next output frame should carry
    pub(crate) expected_timestamp: Option<i64>,
    /// Peer input closed mid-stream; push a flushing EOS on the next cycle
    pub(crate) needs_eos_at_close: bool,
}
