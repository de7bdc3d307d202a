//! Media format description and unit conversions
//!
//! Stream buffers carry bytes per channel. Engines reason in time (µs) for
//! thresholds and delays, and markers carry offsets in samples per channel for
//! PCM data or bytes for raw data. All conversions live here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum channel count accepted by the engines
pub const MAX_CHANNELS: u16 = 32;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Sample data representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Signed fixed point PCM
    FixedPoint,
    /// Floating point PCM
    FloatingPoint,
    /// Packetized PCM (e.g. IEC 61937 framing)
    Packetized,
    /// Compressed or otherwise opaque bytes
    Raw,
}

impl DataFormat {
    /// Marker offsets are expressed in samples per channel for these formats,
    /// and in bytes for everything else.
    pub fn uses_sample_offsets(self) -> bool {
        matches!(
            self,
            DataFormat::FixedPoint | DataFormat::FloatingPoint | DataFormat::Packetized
        )
    }

    pub fn is_pcm(self) -> bool {
        matches!(self, DataFormat::FixedPoint | DataFormat::FloatingPoint)
    }
}

/// Channel layout in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interleaving {
    /// One buffer per channel
    Deinterleaved,
    /// All channels in one buffer
    Interleaved,
}

/// Format of the data flowing through a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub data_format: DataFormat,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub num_channels: u16,
    pub interleaving: Interleaving,
}

impl MediaFormat {
    /// Deinterleaved signed fixed point PCM
    pub fn pcm(sample_rate: u32, bits_per_sample: u16, num_channels: u16) -> Self {
        Self {
            data_format: DataFormat::FixedPoint,
            sample_rate,
            bits_per_sample,
            num_channels,
            interleaving: Interleaving::Deinterleaved,
        }
    }

    /// Bytes occupied by one sample of one channel
    pub fn bytes_per_sample(&self) -> u32 {
        u32::from(self.bits_per_sample) / 8
    }

    /// True when every field needed for time conversion is known
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.bytes_per_sample() > 0 && self.num_channels > 0
    }

    /// Whether the sync and gapless engines can process this format
    ///
    /// Both engines move whole per-channel buffers, so they require
    /// fixed point 16 or 32 bit data laid out one buffer per channel.
    pub fn is_supported_pcm(&self) -> bool {
        self.is_valid()
            && self.data_format == DataFormat::FixedPoint
            && matches!(self.bits_per_sample, 16 | 32)
            && (self.interleaving == Interleaving::Deinterleaved || self.num_channels == 1)
            && self.num_channels <= MAX_CHANNELS
    }

    /// Duration of `bytes_per_ch` bytes of one channel, in microseconds
    pub fn bytes_to_us(&self, bytes_per_ch: u32) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        let samples = u64::from(self.bytes_to_samples_per_ch(bytes_per_ch));
        samples * MICROS_PER_SECOND / u64::from(self.sample_rate)
    }

    /// Bytes per channel covering `us` microseconds (rounded down to whole samples)
    pub fn us_to_bytes_per_ch(&self, us: u64) -> u32 {
        if !self.is_valid() {
            return 0;
        }
        let samples = us * u64::from(self.sample_rate) / MICROS_PER_SECOND;
        let bytes = samples * u64::from(self.bytes_per_sample());
        u32::try_from(bytes).unwrap_or(u32::MAX)
    }

    pub fn bytes_to_samples_per_ch(&self, bytes_per_ch: u32) -> u32 {
        match self.bytes_per_sample() {
            0 => 0,
            bps => bytes_per_ch / bps,
        }
    }

    pub fn samples_to_bytes_per_ch(&self, samples: u32) -> u32 {
        samples.saturating_mul(self.bytes_per_sample())
    }

    /// Marker offset units corresponding to `bytes_per_ch`
    pub fn bytes_to_offset_units(&self, bytes_per_ch: u32) -> u32 {
        if self.data_format.uses_sample_offsets() {
            self.bytes_to_samples_per_ch(bytes_per_ch)
        } else {
            bytes_per_ch
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}Hz {}bit {}ch {:?}",
            self.data_format,
            self.sample_rate,
            self.bits_per_sample,
            self.num_channels,
            self.interleaving
        )
    }
}
