//! Per-port stream buffers
//!
//! A [`StreamData`] is what the scheduler hands to an engine for one port and
//! one processing cycle: one fixed-capacity buffer per channel, stream flags,
//! a timestamp and the markers attached to the data.

use crate::metadata::MarkerList;

/// One channel's buffer: fixed capacity plus the number of valid bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBuffer {
    data: Vec<u8>,
    actual_len: usize,
}

impl ChannelBuffer {
    /// Empty buffer with `capacity` bytes of storage
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            actual_len: 0,
        }
    }

    /// Full buffer holding exactly `bytes`
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let actual_len = bytes.len();
        Self {
            data: bytes,
            actual_len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.actual_len
    }

    pub fn is_empty(&self) -> bool {
        self.actual_len == 0
    }

    pub fn spare(&self) -> usize {
        self.capacity() - self.actual_len
    }

    /// Valid bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.actual_len]
    }

    /// Up to the first `count` valid bytes
    pub fn head(&self, count: usize) -> &[u8] {
        let valid = self.as_slice();
        valid.get(..count).unwrap_or(valid)
    }

    /// Storage past the valid bytes, for writers that fill in place
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.actual_len..]
    }

    /// Mark `count` bytes written through [`Self::spare_mut`] as valid
    pub fn advance(&mut self, count: usize) {
        self.actual_len = (self.actual_len + count).min(self.capacity());
    }

    /// Set the valid length, clamped to capacity
    pub fn set_len(&mut self, len: usize) {
        self.actual_len = len.min(self.capacity());
    }

    pub fn clear(&mut self) {
        self.actual_len = 0;
    }

    /// Append as much of `bytes` as fits; returns bytes copied
    pub fn push_slice(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.spare());
        self.data[self.actual_len..self.actual_len + n].copy_from_slice(&bytes[..n]);
        self.actual_len += n;
        n
    }

    /// Append up to `count` zero bytes; returns bytes written
    pub fn push_zeros(&mut self, count: usize) -> usize {
        let n = count.min(self.spare());
        self.data[self.actual_len..self.actual_len + n].fill(0);
        self.actual_len += n;
        n
    }

    /// Drop `count` bytes from the front, moving the remainder down
    pub fn consume_front(&mut self, count: usize) {
        let n = count.min(self.actual_len);
        self.data.copy_within(n..self.actual_len, 0);
        self.actual_len -= n;
    }
}

/// Stream level flags travelling with a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Buffer ends a frame early (EOF / short frame)
    pub end_of_frame: bool,
    /// A flushing end-of-stream marker is attached
    pub marker_eos: bool,
    /// `timestamp` carries a meaningful value
    pub timestamp_valid: bool,
}

/// Buffers, flags and markers for one port for one cycle
#[derive(Debug)]
pub struct StreamData {
    pub bufs: Vec<ChannelBuffer>,
    pub flags: StreamFlags,
    /// Timestamp of the first sample, in microseconds
    pub timestamp: i64,
    pub metadata: MarkerList,
}

impl StreamData {
    /// Empty stream with `num_channels` buffers of `capacity_per_ch` bytes
    pub fn new(num_channels: usize, capacity_per_ch: usize) -> Self {
        Self {
            bufs: (0..num_channels)
                .map(|_| ChannelBuffer::with_capacity(capacity_per_ch))
                .collect(),
            flags: StreamFlags::default(),
            timestamp: 0,
            metadata: MarkerList::new(),
        }
    }

    /// Stream whose buffers are full with the given per-channel bytes
    pub fn from_channels(channels: Vec<Vec<u8>>) -> Self {
        Self {
            bufs: channels.into_iter().map(ChannelBuffer::from_bytes).collect(),
            flags: StreamFlags::default(),
            timestamp: 0,
            metadata: MarkerList::new(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.bufs.len()
    }

    /// Valid bytes per channel (channel 0 is authoritative)
    pub fn len_per_ch(&self) -> u32 {
        self.bufs.first().map_or(0, |b| to_u32(b.len()))
    }

    pub fn capacity_per_ch(&self) -> u32 {
        self.bufs.first().map_or(0, |b| to_u32(b.capacity()))
    }

    pub fn space_per_ch(&self) -> u32 {
        self.bufs.first().map_or(0, |b| to_u32(b.spare()))
    }

    /// True when sample bytes are present
    pub fn has_data(&self) -> bool {
        self.len_per_ch() > 0
    }

    /// True when bytes, markers or an EOF flag are present
    pub fn has_anything(&self) -> bool {
        self.has_data() || !self.metadata.is_empty() || self.flags.end_of_frame
    }

    /// Set every channel's valid length
    pub fn set_len_per_ch(&mut self, len: u32) {
        for buf in &mut self.bufs {
            buf.set_len(len as usize);
        }
    }

    /// Report nothing consumed from this input
    pub fn mark_unconsumed(&mut self) {
        self.set_len_per_ch(0);
    }

    /// Drop `count` consumed bytes from the front of every channel
    pub fn consume_front(&mut self, count: u32) {
        for buf in &mut self.bufs {
            buf.consume_front(count as usize);
        }
    }
}

/// Saturating usize to u32 conversion for per-channel lengths
pub(crate) fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_buffer_push_and_consume() {
        let mut buf = ChannelBuffer::with_capacity(8);
        assert_eq!(buf.push_slice(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(buf.push_slice(&[6, 7, 8, 9]), 3, "Push must stop at capacity");
        assert!(buf.spare() == 0);

        buf.consume_front(3);
        assert_eq!(buf.as_slice(), &[4, 5, 6, 7, 8]);

        assert_eq!(buf.push_zeros(10), 3);
        assert_eq!(buf.as_slice(), &[4, 5, 6, 7, 8, 0, 0, 0]);
    }

    #[test]
    fn test_channel_buffer_in_place_fill() {
        let mut buf = ChannelBuffer::with_capacity(6);
        buf.push_slice(&[1, 2]);
        assert_eq!(buf.head(10), &[1, 2], "Head is clamped to the valid bytes");
        assert_eq!(buf.head(1), &[1]);

        let spare = buf.spare_mut();
        assert_eq!(spare.len(), 4);
        spare[..3].copy_from_slice(&[3, 4, 5]);
        buf.advance(3);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5]);

        buf.advance(10);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_stream_lengths() {
        let mut sd = StreamData::new(2, 16);
        assert_eq!(sd.capacity_per_ch(), 16);
        assert!(!sd.has_anything());

        sd.set_len_per_ch(10);
        assert_eq!(sd.len_per_ch(), 10);
        assert_eq!(sd.space_per_ch(), 6);

        sd.mark_unconsumed();
        assert!(!sd.has_data());

        sd.flags.end_of_frame = true;
        assert!(sd.has_anything());
    }
}
