//! Internal per-input buffer
//!
//! Sized to one threshold frame plus one upstream frame of slack. Owned by a
//! single input port and dropped when that port closes or its media format
//! changes.

use crate::error::{EngineError, Result};
use streamsync_common::{ChannelBuffer, StreamData};
use tracing::debug;

/// Fixed-capacity buffer, one channel buffer per input channel
#[derive(Debug)]
pub struct InternalBuffer {
    channels: Vec<ChannelBuffer>,
}

impl InternalBuffer {
    /// Allocate `num_channels` buffers of `capacity_per_ch` bytes.
    ///
    /// # Errors
    /// `ResourceExhausted` if the allocator refuses the request.
    pub fn allocate(num_channels: usize, capacity_per_ch: usize) -> Result<Self> {
        let mut channels = Vec::new();
        channels.try_reserve_exact(num_channels).map_err(|e| {
            EngineError::ResourceExhausted(format!("{} channel buffers: {}", num_channels, e))
        })?;

        for _ in 0..num_channels {
            let mut storage: Vec<u8> = Vec::new();
            storage.try_reserve_exact(capacity_per_ch).map_err(|e| {
                EngineError::ResourceExhausted(format!(
                    "{} byte channel buffer: {}",
                    capacity_per_ch, e
                ))
            })?;
            storage.resize(capacity_per_ch, 0);
            let mut channel = ChannelBuffer::from_bytes(storage);
            channel.clear();
            channels.push(channel);
        }

        debug!(
            "Allocated internal buffer: {} channels x {} bytes",
            num_channels, capacity_per_ch
        );
        Ok(Self { channels })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn len_per_ch(&self) -> u32 {
        self.channels.first().map_or(0, |c| to_u32(c.len()))
    }

    pub fn capacity_per_ch(&self) -> u32 {
        self.channels.first().map_or(0, |c| to_u32(c.capacity()))
    }

    pub fn has_space(&self) -> bool {
        self.len_per_ch() < self.capacity_per_ch()
    }

    pub fn is_empty(&self) -> bool {
        self.len_per_ch() == 0
    }

    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
    }

    pub fn channel(&self, ch: usize) -> Option<&ChannelBuffer> {
        self.channels.get(ch)
    }

    /// Append up to `limit_per_ch` total bytes per channel from `input`,
    /// starting `skip` bytes into each input channel.
    ///
    /// # Returns
    /// Bytes appended per channel
    pub fn fill_from(&mut self, input: &StreamData, skip: u32, limit_per_ch: u32) -> u32 {
        let mut copied = 0;
        for (channel, src) in self.channels.iter_mut().zip(input.bufs.iter()) {
            let room = (limit_per_ch as usize).saturating_sub(channel.len());
            let bytes = src.as_slice().get(skip as usize..).unwrap_or(&[]);
            let take = bytes.len().min(room);
            copied = channel.push_slice(&bytes[..take]);
        }
        to_u32(copied)
    }

    /// Discard the oldest `count` bytes of every channel
    pub fn drop_oldest(&mut self, count: u32) {
        for channel in &mut self.channels {
            channel.consume_front(count as usize);
        }
    }

    /// Copy the first `count` bytes of each channel onto the end of `output`
    ///
    /// # Returns
    /// Bytes written per channel
    pub fn copy_to(&self, output: &mut StreamData, count: u32) -> u32 {
        let mut copied = 0;
        for (channel, dst) in self.channels.iter().zip(output.bufs.iter_mut()) {
            let take = (count as usize).min(channel.len());
            copied = dst.push_slice(&channel.as_slice()[..take]);
        }
        to_u32(copied)
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
