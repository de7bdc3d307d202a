//! Per-input delay line
//!
//! Holds `early_eos_delay_ms` worth of samples for one input so that an
//! end-of-stream is seen (and announced) that long before it reaches the
//! output. One `HeapRb<u8>` per channel; markers are kept with offsets
//! relative to the oldest buffered sample.

use crate::error::{EngineError, Result};
use ringbuf::{traits::*, HeapRb};
use streamsync_common::{
    MarkerId, MarkerList, MarkerPool, MediaFormat, PropagationInfo, Shift, StreamData, StreamFlags,
};
use tracing::{debug, trace};

/// Result of moving data into the delay line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes per channel taken from the input
    pub written: u32,
    /// End-of-stream that entered the delay line
    pub eos: Option<MarkerId>,
}

/// Result of draining the delay line into an output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes per channel appended to the output
    pub read: u32,
    /// End-of-stream that reached the output
    pub eos: Option<MarkerId>,
    /// Deferred media format that took effect once the line drained
    pub applied_format: Option<MediaFormat>,
}

pub struct DelayBuffer {
    channels: Vec<HeapRb<u8>>,
    markers: MarkerList,
    flags: StreamFlags,
    format: MediaFormat,
    pending_format: Option<MediaFormat>,
    delay_ms: u32,
}

impl DelayBuffer {
    /// Allocate a delay line of `delay_ms` for `format`
    pub fn new(format: MediaFormat, delay_ms: u32) -> Result<Self> {
        let channels = allocate(&format, delay_ms)?;
        Ok(Self {
            channels,
            markers: MarkerList::new(),
            flags: StreamFlags::default(),
            format,
            pending_format: None,
            delay_ms,
        })
    }

    pub fn format(&self) -> MediaFormat {
        self.format
    }

    pub fn pending_format(&self) -> Option<MediaFormat> {
        self.pending_format
    }

    pub fn len_per_ch(&self) -> u32 {
        self.channels
            .first()
            .map_or(0, |rb| u32::try_from(rb.occupied_len()).unwrap_or(u32::MAX))
    }

    pub fn capacity_per_ch(&self) -> u32 {
        self.channels
            .first()
            .map_or(0, |rb| u32::try_from(rb.capacity().get()).unwrap_or(u32::MAX))
    }

    pub fn is_empty(&self) -> bool {
        self.len_per_ch() == 0
    }

    pub fn is_full(&self) -> bool {
        self.channels.first().is_some_and(|rb| rb.is_full())
    }

    /// Nothing buffered and no markers waiting
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.markers.is_empty()
    }

    pub fn markers(&self) -> &MarkerList {
        &self.markers
    }

    /// Switch to `format`. Applied at once when the line is empty, otherwise
    /// deferred until the buffered data has drained.
    ///
    /// # Returns
    /// True when the format took effect immediately
    pub fn set_format(&mut self, format: MediaFormat) -> Result<bool> {
        if self.is_empty() {
            self.apply_format(format)?;
            return Ok(true);
        }
        if format != self.format {
            debug!("Delay buffer holds data, deferring format {}", format);
            self.pending_format = Some(format);
        } else {
            self.pending_format = None;
        }
        Ok(false)
    }

    fn apply_format(&mut self, format: MediaFormat) -> Result<()> {
        self.pending_format = None;
        if format == self.format {
            return Ok(());
        }
        self.channels = allocate(&format, self.delay_ms)?;
        self.format = format;
        debug!("Delay buffer now {} ({} bytes per channel)", format, self.capacity_per_ch());
        Ok(())
    }

    /// Move as much of `input` as fits and carry its markers along.
    ///
    /// On return the input's valid length is the number of bytes taken.
    pub fn write(&mut self, pool: &mut MarkerPool, input: &mut StreamData) -> Result<WriteOutcome> {
        let in_len = input.len_per_ch();
        let before = self.len_per_ch();
        let room = self
            .channels
            .first()
            .map_or(0, |rb| u32::try_from(rb.vacant_len()).unwrap_or(u32::MAX));
        let take = in_len.min(room);

        let mut written = 0;
        for (rb, src) in self.channels.iter_mut().zip(input.bufs.iter()) {
            written = rb.push_slice(src.head(take as usize));
        }
        let written = u32::try_from(written).unwrap_or(0);

        let in_info = PropagationInfo::new(&self.format, in_len, written);
        let out_info = PropagationInfo::new(&self.format, before, written);
        let outcome = pool.propagate(
            &mut input.metadata,
            &mut input.flags,
            &mut self.markers,
            &mut self.flags,
            &in_info,
            &out_info,
        )?;

        input.set_len_per_ch(written);
        if input.flags.end_of_frame && written == in_len {
            input.flags.end_of_frame = false;
            self.flags.end_of_frame = true;
        }

        trace!("Delay buffer took {} of {} bytes per channel", written, in_len);
        Ok(WriteOutcome {
            written,
            eos: outcome.moved_eos,
        })
    }

    /// Append buffered data to `output` until it is full or the line is empty
    pub fn read(&mut self, pool: &mut MarkerPool, output: &mut StreamData) -> Result<ReadOutcome> {
        let out_before = output.len_per_ch();
        let before = self.len_per_ch();
        let count = before.min(output.space_per_ch());

        let mut read = 0;
        for (rb, dst) in self.channels.iter_mut().zip(output.bufs.iter_mut()) {
            let spare = dst.spare_mut();
            let n = spare.len().min(count as usize);
            read = rb.pop_slice(&mut spare[..n]);
            dst.advance(read);
        }
        let read = u32::try_from(read).unwrap_or(0);

        let in_info = PropagationInfo::new(&self.format, before, read);
        let out_info = PropagationInfo::new(&self.format, out_before, read);
        let outcome = pool.propagate(
            &mut self.markers,
            &mut self.flags,
            &mut output.metadata,
            &mut output.flags,
            &in_info,
            &out_info,
        )?;
        pool.shift_offsets(&self.markers, self.format.bytes_to_offset_units(read), Shift::Left);

        if self.is_empty() && self.flags.end_of_frame {
            self.flags.end_of_frame = false;
            output.flags.end_of_frame = true;
        }

        let mut applied_format = None;
        if self.is_empty() {
            if let Some(format) = self.pending_format {
                self.apply_format(format)?;
                applied_format = Some(format);
            }
        }

        Ok(ReadOutcome {
            read,
            eos: outcome.moved_eos,
            applied_format,
        })
    }

    /// Forget a pending end-of-frame that belonged to an ended stream
    pub fn clear_end_of_frame(&mut self) {
        self.flags.end_of_frame = false;
    }

    /// Discard buffered data; undelivered markers are destroyed as dropped
    pub fn clear(&mut self, pool: &mut MarkerPool) {
        for rb in &mut self.channels {
            while rb.try_pop().is_some() {}
        }
        pool.destroy_all(&mut self.markers, true);
        self.flags = StreamFlags::default();
    }
}

fn allocate(format: &MediaFormat, delay_ms: u32) -> Result<Vec<HeapRb<u8>>> {
    let capacity = format.us_to_bytes_per_ch(u64::from(delay_ms) * 1_000) as usize;
    if capacity == 0 {
        return Err(EngineError::Config(format!(
            "{}ms delay holds no samples at {}",
            delay_ms, format
        )));
    }

    let mut channels = Vec::new();
    channels
        .try_reserve_exact(usize::from(format.num_channels))
        .map_err(|e| EngineError::ResourceExhausted(format!("delay buffer channels: {}", e)))?;
    for _ in 0..format.num_channels {
        let rb = HeapRb::<u8>::try_new(capacity)
            .map_err(|e| {
                EngineError::ResourceExhausted(format!("{} byte delay buffer: {}", capacity, e))
            })?;
        channels.push(rb);
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamsync_common::Marker;

    fn mono() -> MediaFormat {
        MediaFormat::pcm(48_000, 16, 1)
    }

    #[test]
    fn test_capacity_matches_delay() {
        let buffer = DelayBuffer::new(mono(), 10).unwrap();
        assert_eq!(buffer.capacity_per_ch(), 960);
        assert!(buffer.is_idle());
    }

    #[test]
    fn test_write_stops_when_full() {
        let mut pool = MarkerPool::new();
        let mut buffer = DelayBuffer::new(mono(), 1).unwrap();
        let mut input = StreamData::from_channels(vec![vec![7; 150]]);

        let outcome = buffer.write(&mut pool, &mut input).unwrap();
        assert_eq!(outcome.written, 96);
        assert_eq!(input.len_per_ch(), 96, "Input reports only what was taken");
        assert!(buffer.is_full());
    }

    #[test]
    fn test_short_trailing_channel_is_clamped() {
        let mut pool = MarkerPool::new();
        let mut buffer = DelayBuffer::new(MediaFormat::pcm(48_000, 16, 2), 10).unwrap();
        let mut input = StreamData::from_channels(vec![vec![1; 40], vec![2; 10]]);

        buffer.write(&mut pool, &mut input).unwrap();
        assert!(!buffer.is_empty());

        let mut output = StreamData::new(2, 64);
        buffer.read(&mut pool, &mut output).unwrap();
        assert_eq!(output.bufs[0].as_slice(), &[1; 40][..]);
        assert_eq!(output.bufs[1].as_slice(), &[2; 10][..]);
    }

    #[test]
    fn test_eos_travels_through_line() {
        let mut pool = MarkerPool::new();
        let mut buffer = DelayBuffer::new(mono(), 10).unwrap();
        let mut input = StreamData::from_channels(vec![vec![1; 40]]);
        input.flags.marker_eos = true;
        pool.push_back(&mut input.metadata, Marker::eos(true, true).with_offset(20))
            .unwrap();

        let written = buffer.write(&mut pool, &mut input).unwrap();
        assert!(written.eos.is_some());

        let mut output = StreamData::new(1, 16);
        let first = buffer.read(&mut pool, &mut output).unwrap();
        assert_eq!(first.read, 16);
        assert!(first.eos.is_none());
        assert_eq!(pool.iter(buffer.markers()).next().unwrap().1.offset, 12);

        let mut output = StreamData::new(1, 64);
        let second = buffer.read(&mut pool, &mut output).unwrap();
        assert_eq!(second.read, 24);
        assert!(second.eos.is_some());
        assert!(output.flags.marker_eos);
        assert!(buffer.is_idle());
    }

    #[test]
    fn test_format_deferred_until_drained() {
        let mut pool = MarkerPool::new();
        let mut buffer = DelayBuffer::new(mono(), 10).unwrap();
        let mut input = StreamData::from_channels(vec![vec![1; 8]]);
        buffer.write(&mut pool, &mut input).unwrap();

        let stereo = MediaFormat::pcm(48_000, 16, 2);
        assert!(!buffer.set_format(stereo).unwrap());
        assert_eq!(buffer.pending_format(), Some(stereo));

        let mut output = StreamData::new(1, 64);
        let outcome = buffer.read(&mut pool, &mut output).unwrap();
        assert_eq!(outcome.applied_format, Some(stereo));
        assert_eq!(buffer.format(), stereo);
    }
}
