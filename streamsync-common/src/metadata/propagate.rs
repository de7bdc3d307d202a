//! Marker propagation across buffer copies
//!
//! Whenever an operation consumes bytes from one buffer and produces bytes in
//! another, the markers that now sit inside the consumed region move to the
//! produced region with their offsets rescaled into output coordinates.
//! Markers beyond the consumed region stay where they are; the owner of the
//! input shifts them afterwards with [`MarkerPool::shift_offsets`].

use super::marker::MarkerKind;
use super::pool::{MarkerId, MarkerList, MarkerPool};
use super::MetadataError;
use crate::media_format::{DataFormat, MediaFormat};
use crate::stream::StreamFlags;
use tracing::{error, trace, warn};

/// Buffer description for one side of a propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationInfo {
    pub data_format: DataFormat,
    /// Bytes per channel consumed (input side) or produced (output side)
    pub len_per_ch: u32,
    /// Bytes per channel present before the operation
    pub initial_len_per_ch: u32,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

impl PropagationInfo {
    pub fn new(format: &MediaFormat, initial_len_per_ch: u32, len_per_ch: u32) -> Self {
        Self {
            data_format: format.data_format,
            len_per_ch,
            initial_len_per_ch,
            bits_per_sample: format.bits_per_sample,
            sample_rate: format.sample_rate,
        }
    }

    fn to_units(&self, bytes: u32) -> u32 {
        if self.data_format.uses_sample_offsets() {
            bytes / (u32::from(self.bits_per_sample) / 8).max(1)
        } else {
            bytes
        }
    }

    fn validate(&self) -> Result<(), MetadataError> {
        if self.data_format.uses_sample_offsets() && self.bits_per_sample < 8 {
            return Err(MetadataError::InvalidFormat(format!(
                "{:?} with {} bits per sample",
                self.data_format, self.bits_per_sample
            )));
        }
        Ok(())
    }
}

/// Summary of one propagation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationOutcome {
    /// Markers moved to the output
    pub moved: usize,
    /// First end-of-stream marker that moved, if any
    pub moved_eos: Option<MarkerId>,
    /// A flushing end-of-stream reached the output
    pub moved_flushing_eos: bool,
    /// A flushing end-of-stream is still waiting in the input
    pub eos_remaining: bool,
}

/// Direction of an offset shift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    /// Data was removed from the front
    Left,
    /// Data was inserted at the front
    Right,
}

impl MarkerPool {
    /// Move markers covered by the consumed input region to `output`.
    ///
    /// # Arguments
    /// * `input` / `input_flags` - source list and its stream flags
    /// * `output` / `output_flags` - destination list and its stream flags
    /// * `in_info` - bytes consumed and bytes present before consumption
    /// * `out_info` - bytes produced and bytes present before production
    ///
    /// # Returns
    /// What moved. Input `marker_eos` reflects whether a flushing EOS remains;
    /// output `marker_eos` is only ever set here, never cleared.
    pub fn propagate(
        &mut self,
        input: &mut MarkerList,
        input_flags: &mut StreamFlags,
        output: &mut MarkerList,
        output_flags: &mut StreamFlags,
        in_info: &PropagationInfo,
        out_info: &PropagationInfo,
    ) -> Result<PropagationOutcome, MetadataError> {
        in_info.validate()?;
        out_info.validate()?;

        let mut outcome = PropagationOutcome::default();
        if input.is_empty() {
            return Ok(outcome);
        }

        let in_data_present = in_info.initial_len_per_ch > 0;
        let in_consumed = in_info.to_units(in_info.len_per_ch);
        let in_initial = in_info.to_units(in_info.initial_len_per_ch);
        let out_produced = out_info.to_units(out_info.len_per_ch);
        let out_initial = out_info.to_units(out_info.initial_len_per_ch);
        let linear = in_info.data_format.uses_sample_offsets()
            && in_info.data_format == out_info.data_format;

        for id in self.ids(input) {
            let Some(marker) = self.get_mut(id) else {
                continue;
            };

            if marker.offset > in_initial {
                warn!(
                    "{:?} marker offset {} beyond buffer end {}, clamping",
                    marker.kind, marker.offset, in_initial
                );
                marker.offset = in_initial;
            }

            let moves = if in_data_present {
                in_consumed != 0 && marker.offset <= in_consumed
            } else {
                marker.offset == 0
            };

            if !moves {
                if marker.kind.is_flushing_eos() {
                    outcome.eos_remaining = true;
                }
                continue;
            }

            let translated = if in_consumed == 0 {
                if marker.begin_associated {
                    0
                } else {
                    out_produced
                }
            } else if linear {
                let scaled = (u64::from(marker.offset) * u64::from(out_produced))
                    .div_ceil(u64::from(in_consumed));
                u32::try_from(scaled).unwrap_or(u32::MAX).min(out_produced)
            } else if marker.offset == 0 {
                0
            } else {
                out_produced
            };

            marker.offset = translated.saturating_add(out_initial);
            let kind = marker.kind;

            if let MarkerKind::EndOfStream(flags) = kind {
                if outcome.moved_eos.is_none() {
                    outcome.moved_eos = Some(id);
                }
                if flags.flushing {
                    outcome.moved_flushing_eos = true;
                }
            }

            self.move_to(input, output, id)?;
            outcome.moved += 1;
            trace!("Propagated {:?} to output offset {}", kind, translated + out_initial);
        }

        input_flags.marker_eos = outcome.eos_remaining;
        if outcome.moved_flushing_eos {
            output_flags.marker_eos = true;
        }

        Ok(outcome)
    }

    /// Shift every offset in `list` by `units`.
    ///
    /// Left shifts saturate at zero; a marker that would go negative is logged
    /// as an error since it should have been propagated out already.
    pub fn shift_offsets(&mut self, list: &MarkerList, units: u32, direction: Shift) {
        if units == 0 {
            return;
        }
        for id in self.ids(list) {
            let Some(marker) = self.get_mut(id) else {
                continue;
            };
            match direction {
                Shift::Left => {
                    if marker.offset < units {
                        error!(
                            "{:?} marker offset {} shifted left by {}, saturating at 0",
                            marker.kind, marker.offset, units
                        );
                        marker.offset = 0;
                    } else {
                        marker.offset -= units;
                    }
                }
                Shift::Right => marker.offset = marker.offset.saturating_add(units),
            }
        }
    }

    /// Move flushing end-of-stream and data-flow-gap markers to the tail of
    /// `list` at `end_offset`, so zero padding never strands them mid-buffer.
    pub fn move_flushing_to_end(
        &mut self,
        list: &mut MarkerList,
        end_offset: u32,
    ) -> Result<(), MetadataError> {
        for id in self.ids(list) {
            let Some(marker) = self.get_mut(id) else {
                continue;
            };
            if marker.kind.is_flushing_eos() || marker.kind.is_dfg() {
                marker.offset = end_offset;
                let mut detached = MarkerList::new();
                self.move_to(list, &mut detached, id)?;
                self.append(list, &mut detached)?;
            }
        }
        Ok(())
    }

    /// First end-of-stream marker in `list`
    pub fn find_eos(&self, list: &MarkerList) -> Option<MarkerId> {
        self.iter(list).find(|(_, m)| m.kind.is_eos()).map(|(id, _)| id)
    }

    pub fn has_dfg(&self, list: &MarkerList) -> bool {
        self.iter(list).any(|(_, m)| m.kind.is_dfg())
    }

    pub fn has_flushing_eos(&self, list: &MarkerList) -> bool {
        self.iter(list).any(|(_, m)| m.kind.is_flushing_eos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Marker;

    fn pcm16(initial: u32, len: u32) -> PropagationInfo {
        PropagationInfo::new(&MediaFormat::pcm(48_000, 16, 1), initial, len)
    }

    #[test]
    fn test_partial_consume_moves_covered_markers() {
        let mut pool = MarkerPool::new();
        let mut input = MarkerList::new();
        let mut output = MarkerList::new();
        let mut in_flags = StreamFlags::default();
        let mut out_flags = StreamFlags::default();

        // 100 samples in, markers at 10 and 80; consume 50 samples
        pool.push_back(&mut input, Marker::new(MarkerKind::TimingMarker).with_offset(10)).unwrap();
        pool.push_back(&mut input, Marker::new(MarkerKind::TimingMarker).with_offset(80)).unwrap();

        let outcome = pool
            .propagate(
                &mut input,
                &mut in_flags,
                &mut output,
                &mut out_flags,
                &pcm16(200, 100),
                &pcm16(0, 100),
            )
            .unwrap();

        assert_eq!(outcome.moved, 1);
        assert_eq!(pool.iter(&output).map(|(_, m)| m.offset).collect::<Vec<_>>(), vec![10]);
        assert_eq!(pool.iter(&input).map(|(_, m)| m.offset).collect::<Vec<_>>(), vec![80]);
    }

    #[test]
    fn test_output_initial_length_added() {
        let mut pool = MarkerPool::new();
        let mut input = MarkerList::new();
        let mut output = MarkerList::new();
        let mut in_flags = StreamFlags::default();
        let mut out_flags = StreamFlags::default();

        pool.push_back(&mut input, Marker::new(MarkerKind::TimingMarker).with_offset(4)).unwrap();

        // 20 bytes (10 samples) already in output
        pool.propagate(
            &mut input,
            &mut in_flags,
            &mut output,
            &mut out_flags,
            &pcm16(20, 20),
            &pcm16(20, 20),
        )
        .unwrap();

        let (_, m) = pool.iter(&output).next().unwrap();
        assert_eq!(m.offset, 14);
    }

    #[test]
    fn test_flushing_eos_sets_output_flag() {
        let mut pool = MarkerPool::new();
        let mut input = MarkerList::new();
        let mut output = MarkerList::new();
        let mut in_flags = StreamFlags { marker_eos: true, ..Default::default() };
        let mut out_flags = StreamFlags::default();

        pool.push_back(&mut input, Marker::eos(true, false).with_offset(50)).unwrap();

        let outcome = pool
            .propagate(
                &mut input,
                &mut in_flags,
                &mut output,
                &mut out_flags,
                &pcm16(100, 100),
                &pcm16(0, 100),
            )
            .unwrap();

        assert!(outcome.moved_flushing_eos);
        assert!(outcome.moved_eos.is_some());
        assert!(!in_flags.marker_eos);
        assert!(out_flags.marker_eos);
    }

    #[test]
    fn test_stuck_eos_keeps_input_flag() {
        let mut pool = MarkerPool::new();
        let mut input = MarkerList::new();
        let mut output = MarkerList::new();
        let mut in_flags = StreamFlags { marker_eos: true, ..Default::default() };
        let mut out_flags = StreamFlags { marker_eos: true, ..Default::default() };

        pool.push_back(&mut input, Marker::eos(true, false).with_offset(50)).unwrap();

        let outcome = pool
            .propagate(
                &mut input,
                &mut in_flags,
                &mut output,
                &mut out_flags,
                &pcm16(100, 20),
                &pcm16(0, 20),
            )
            .unwrap();

        assert!(outcome.eos_remaining);
        assert!(in_flags.marker_eos);
        assert!(out_flags.marker_eos, "Output flag is never cleared by propagation");
    }

    #[test]
    fn test_no_data_moves_offset_zero_only() {
        let mut pool = MarkerPool::new();
        let mut input = MarkerList::new();
        let mut output = MarkerList::new();
        let mut in_flags = StreamFlags::default();
        let mut out_flags = StreamFlags::default();

        pool.push_back(&mut input, Marker::new(MarkerKind::DataFlowGap).begin_associated())
            .unwrap();

        let outcome = pool
            .propagate(
                &mut input,
                &mut in_flags,
                &mut output,
                &mut out_flags,
                &pcm16(0, 0),
                &pcm16(0, 0),
            )
            .unwrap();
        assert_eq!(outcome.moved, 1);
        assert!(pool.has_dfg(&output));
    }

    #[test]
    fn test_shift_left_saturates() {
        let mut pool = MarkerPool::new();
        let mut list = MarkerList::new();
        pool.push_back(&mut list, Marker::new(MarkerKind::TimingMarker).with_offset(3)).unwrap();
        pool.push_back(&mut list, Marker::new(MarkerKind::TimingMarker).with_offset(30)).unwrap();

        pool.shift_offsets(&list, 10, Shift::Left);
        assert_eq!(pool.iter(&list).map(|(_, m)| m.offset).collect::<Vec<_>>(), vec![0, 20]);

        pool.shift_offsets(&list, 5, Shift::Right);
        assert_eq!(pool.iter(&list).map(|(_, m)| m.offset).collect::<Vec<_>>(), vec![5, 25]);
    }

    #[test]
    fn test_move_flushing_to_end() {
        let mut pool = MarkerPool::new();
        let mut list = MarkerList::new();
        pool.push_back(&mut list, Marker::eos(true, true).with_offset(2)).unwrap();
        pool.push_back(&mut list, Marker::new(MarkerKind::TimingMarker).with_offset(4)).unwrap();

        pool.move_flushing_to_end(&mut list, 100).unwrap();

        let kinds: Vec<(bool, u32)> =
            pool.iter(&list).map(|(_, m)| (m.kind.is_eos(), m.offset)).collect();
        assert_eq!(kinds, vec![(false, 4), (true, 100)]);
    }

    #[test]
    fn test_invalid_format_rejected() {
        let mut pool = MarkerPool::new();
        let mut input = MarkerList::new();
        let mut output = MarkerList::new();
        let mut flags = StreamFlags::default();
        let mut out_flags = StreamFlags::default();
        let mut bad = pcm16(10, 10);
        bad.bits_per_sample = 0;

        let result = pool.propagate(
            &mut input,
            &mut flags,
            &mut output,
            &mut out_flags,
            &bad,
            &pcm16(0, 10),
        );
        assert!(matches!(result, Err(MetadataError::InvalidFormat(_))));
    }
}
