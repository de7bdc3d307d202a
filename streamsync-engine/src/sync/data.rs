//! Data path of the synchronization engine

use super::port::{PortMask, SyncState};
use super::SyncEngine;
use crate::error::{EngineError, Result};
use streamsync_common::{
    DataFormat, Interleaving, Marker, MarkerPool, MediaFormat, PortState, PropagationInfo, Shift,
    StreamData,
};
use tracing::{debug, info, trace, warn};

/// Used to propagate markers on ports that have no media format yet; every
/// length involved is zero so only the byte unit matters
const FORMATLESS: MediaFormat = MediaFormat {
    data_format: DataFormat::Raw,
    sample_rate: 0,
    bits_per_sample: 8,
    num_channels: 1,
    interleaving: Interleaving::Deinterleaved,
};

fn us_to_i64(us: u64) -> i64 {
    i64::try_from(us).unwrap_or(i64::MAX)
}

impl SyncEngine {
    pub(super) fn reset_cycle_flags(&mut self) {
        for port in self.inputs.iter_mut() {
            port.ext.pending_dfg = false;
            port.ext.pending_eof = false;
        }
    }

    /// Record per-port markers and flags, and start stopped ports that
    /// received data.
    ///
    /// # Returns
    /// True when any connected input carries data, or is ending a frame
    /// with data still buffered.
    pub(super) fn validate_io(
        &mut self,
        pool: &MarkerPool,
        inputs: &mut [Option<StreamData>],
    ) -> bool {
        let mut any_data = false;

        for index in 0..self.inputs.max_ports() {
            let Some(input) = inputs.get_mut(index).and_then(Option::as_mut) else {
                continue;
            };
            let Some(port) = self.inputs.get_mut(index) else {
                continue;
            };
            if !port.is_open() {
                continue;
            }
            if port.peer().is_none() {
                if input.has_data() {
                    warn!("Input port {} has no connected output, leaving data unconsumed", index);
                    input.mark_unconsumed();
                }
                continue;
            }

            let state = port.state();
            let ext = &mut port.ext;

            if pool.has_dfg(&input.metadata) {
                ext.pending_dfg = true;
                if !input.flags.end_of_frame {
                    ext.pending_eof = true;
                }
            }
            if input.flags.marker_eos {
                ext.pending_eos = true;
                if !input.flags.end_of_frame {
                    ext.pending_eof = true;
                }
            }
            if input.flags.end_of_frame {
                ext.pending_eof = true;
            }

            let mut data_start = false;
            if input.has_data() {
                if state == PortState::Stopped {
                    if ext.buffer.is_none() {
                        warn!(
                            "Input port {} received data before media format and frame duration",
                            index
                        );
                        input.mark_unconsumed();
                        continue;
                    }
                    ext.output_sent_once = false;
                    ext.emitted_since_start = false;
                    data_start = true;
                }
                ext.eos_received = false;
                any_data = true;
            } else if ext.pending_eof && ext.buffered_bytes_per_ch() > 0 {
                any_data = true;
            }

            if data_start {
                self.inputs.set_state(index, PortState::Started);
                self.sync_state = SyncState::Starting;
                info!("Input port {} started by incoming data", index);
            }
        }

        any_data
    }

    /// Started ports that have delivered a full frame and are not ending
    pub(super) fn synced_mask(&self) -> PortMask {
        let mut mask = PortMask::default();
        for port in self.inputs.iter() {
            let ext = &port.ext;
            if port.is_started()
                && port.peer().is_some()
                && !ext.threshold_disabled
                && ext.output_sent_once
                && !ext.eos_received
            {
                mask.set(port.index());
            }
        }
        mask
    }

    /// Started ports still waiting for their first full frame
    pub(super) fn waiting_mask(&self) -> PortMask {
        let mut mask = PortMask::default();
        for port in self.inputs.iter() {
            let ext = &port.ext;
            if port.is_started()
                && port.peer().is_some()
                && !ext.eos_received
                && (ext.threshold_disabled || !ext.output_sent_once)
            {
                mask.set(port.index());
            }
        }
        mask
    }

    pub(super) fn stopped_with_metadata(&self, inputs: &[Option<StreamData>]) -> PortMask {
        let mut mask = PortMask::default();
        for port in self.inputs.iter() {
            let has_metadata = inputs
                .get(port.index())
                .and_then(Option::as_ref)
                .is_some_and(|i| !i.metadata.is_empty());
            if port.state() == PortState::Stopped && port.peer().is_some() && has_metadata {
                mask.set(port.index());
            }
        }
        mask
    }

    /// Move an input's markers and end-of-frame straight to its output
    pub(super) fn pass_through_port(
        &mut self,
        pool: &mut MarkerPool,
        index: usize,
        inputs: &mut [Option<StreamData>],
        outputs: &mut [Option<StreamData>],
    ) -> Result<()> {
        let Some(port) = self.inputs.get(index) else {
            return Ok(());
        };
        let Some(peer) = port.peer() else {
            return Ok(());
        };
        let format = port.ext.media_format.unwrap_or(FORMATLESS);

        let Some(input) = inputs.get_mut(index).and_then(Option::as_mut) else {
            return Ok(());
        };
        if input.metadata.is_empty() && !input.flags.end_of_frame && !input.flags.marker_eos {
            return Ok(());
        }
        let Some(output) = outputs.get_mut(peer.index).and_then(Option::as_mut) else {
            return Ok(());
        };
        if input.has_data() {
            return Err(EngineError::Internal(format!(
                "metadata pass-through on input port {} which carries data",
                index
            )));
        }

        let previous_eos = output.flags.marker_eos;
        output.flags.marker_eos = false;

        let in_info = PropagationInfo::new(&format, 0, 0);
        let out_info = PropagationInfo::new(&format, output.len_per_ch(), 0);
        let outcome = pool.propagate(
            &mut input.metadata,
            &mut input.flags,
            &mut output.metadata,
            &mut output.flags,
            &in_info,
            &out_info,
        )?;

        output.flags.marker_eos |= previous_eos;
        output.flags.end_of_frame |= input.flags.end_of_frame;
        input.flags.end_of_frame = false;

        if outcome.moved_flushing_eos {
            debug!("End-of-stream passed through on input port {}", index);
            self.mark_port_stopped(index);
        }
        Ok(())
    }

    /// Ports to consume from this cycle, and ports that carry data at all
    pub(super) fn setup_input(&self, inputs: &[Option<StreamData>]) -> (PortMask, PortMask) {
        let mut to_process = PortMask::default();
        let mut data_available = PortMask::default();

        for port in self.inputs.iter() {
            if !port.is_open() || port.peer().is_none() {
                continue;
            }
            let index = port.index();
            let Some(input) = inputs.get(index).and_then(Option::as_ref) else {
                continue;
            };

            if input.has_data() {
                data_available.set(index);
                if port.ext.has_buffer_space() {
                    to_process.set(index);
                }
            } else if port.ext.pending_eof && port.is_started() {
                to_process.set(index);
            }
        }
        (to_process, data_available)
    }

    /// Copy new input into the internal buffer and carry its markers along
    pub(super) fn buffer_new_data(
        &mut self,
        pool: &mut MarkerPool,
        index: usize,
        inputs: &mut [Option<StreamData>],
    ) -> Result<()> {
        let num_open = self.inputs.num_open();
        let Some(input) = inputs.get_mut(index).and_then(Option::as_mut) else {
            return Ok(());
        };
        let Some(port) = self.inputs.get_mut(index) else {
            return Ok(());
        };
        let ext = &mut port.ext;
        let (Some(format), Some(buffer)) = (ext.media_format, ext.buffer.as_mut()) else {
            return Err(EngineError::Internal(format!(
                "input port {} has no internal buffer",
                index
            )));
        };

        let in_len = input.len_per_ch();
        // A lone input never needs slack; it drains as soon as a frame is in
        let limit = if num_open == 1 {
            ext.threshold_bytes_per_ch
        } else {
            buffer.capacity_per_ch()
        };
        let room = limit.saturating_sub(buffer.len_per_ch());
        let mut int_before = buffer.len_per_ch();
        let mut consumed = in_len;
        let appended;

        if in_len <= room {
            appended = buffer.fill_from(input, 0, limit);
        } else if ext.best_effort {
            let excess = (int_before + in_len).saturating_sub(limit);
            let drop_int = excess.min(int_before);
            let skip = excess - drop_int;
            warn!(
                "Best-effort input port {} overflowed, dropping {} bytes per channel",
                index, excess
            );

            if drop_int > 0 {
                buffer.drop_oldest(drop_int);
                let units = format.bytes_to_offset_units(drop_int);
                for id in pool.ids(&ext.int_markers) {
                    if let Some(marker) = pool.get_mut(id) {
                        marker.offset = marker.offset.max(units);
                    }
                }
                pool.shift_offsets(&ext.int_markers, units, Shift::Left);
                ext.buffer_timestamp = ext
                    .buffer_timestamp
                    .map(|ts| ts.saturating_add(us_to_i64(format.bytes_to_us(drop_int))));
                int_before -= drop_int;
            }
            appended = buffer.fill_from(input, skip, limit);
        } else {
            appended = buffer.fill_from(input, 0, limit);
            consumed = appended;
            input.set_len_per_ch(consumed);
            trace!(
                "Input port {} buffer full, consumed {} of {} bytes per channel",
                index, consumed, in_len
            );
        }

        let in_info = PropagationInfo::new(&format, in_len, consumed);
        let out_info = PropagationInfo::new(&format, int_before, appended);
        let outcome = pool.propagate(
            &mut input.metadata,
            &mut input.flags,
            &mut ext.int_markers,
            &mut ext.int_flags,
            &in_info,
            &out_info,
        )?;

        if outcome.moved_flushing_eos || input.flags.marker_eos {
            ext.pending_eos = true;
            ext.eos_received = true;
        }

        if ext.buffer_timestamp.is_none() && input.flags.timestamp_valid && appended > 0 {
            let already = us_to_i64(format.bytes_to_us(int_before));
            ext.buffer_timestamp = Some(input.timestamp.saturating_sub(already));
        }

        if input.flags.end_of_frame && consumed == in_len {
            input.flags.end_of_frame = false;
            ext.int_flags.end_of_frame = true;
        }

        trace!(
            "Input port {} buffered {} bytes per channel ({} total)",
            index,
            appended,
            int_before + appended
        );
        Ok(())
    }

    /// Decide which outputs to render this cycle.
    ///
    /// With only waiting ports, any one reaching the threshold (or ending a
    /// frame) drains them all. Otherwise every synced port that is not ending
    /// must reach the threshold, and then synced and waiting ports drain
    /// together.
    pub(super) fn setup_output(
        &self,
        synced: PortMask,
        waiting: PortMask,
        outputs: &[Option<StreamData>],
    ) -> Result<PortMask> {
        let ready = if synced.is_empty() {
            waiting.iter().any(|i| {
                self.inputs.get(i).is_some_and(|p| {
                    p.ext.meets_threshold() || p.ext.pending_eof || p.ext.int_flags.end_of_frame
                })
            })
        } else {
            synced.iter().all(|i| {
                self.inputs.get(i).is_some_and(|p| {
                    p.ext.eos_received || p.ext.meets_threshold() || p.ext.pending_eof
                })
            })
        };

        let mut to_render = PortMask::default();
        if !ready {
            trace!("Holding output, synced {} waiting {}", synced, waiting);
            return Ok(to_render);
        }

        for index in synced.union(waiting).iter() {
            if let Some(peer) = self.inputs.get(index).and_then(|p| p.peer()) {
                to_render.set(peer.index);
            }
        }

        for out_index in to_render.iter() {
            if !self.can_output_be_filled(out_index, waiting, outputs) {
                return Err(EngineError::ProtocolViolation(format!(
                    "output port {} cannot take a full frame",
                    out_index
                )));
            }
        }
        Ok(to_render)
    }

    fn can_output_be_filled(
        &self,
        out_index: usize,
        waiting: PortMask,
        outputs: &[Option<StreamData>],
    ) -> bool {
        let Some(peer) = self.outputs.get(out_index).and_then(|p| p.peer()) else {
            return false;
        };
        let Some(port) = self.inputs.get(peer.index) else {
            return false;
        };
        let ext = &port.ext;

        if ext.pending_eof {
            return true;
        }
        if ext.buffer.is_none() {
            return false;
        }
        let Some(output) = outputs.get(out_index).and_then(Option::as_ref) else {
            return false;
        };
        let space = output.space_per_ch();
        if space == 0 || space < ext.threshold_bytes_per_ch {
            return false;
        }
        waiting.contains(peer.index) || ext.meets_threshold()
    }

    /// Hand end-of-frame back to inputs after a failed output setup
    pub(super) fn restore_input_eof(&mut self, inputs: &mut [Option<StreamData>]) {
        for port in self.inputs.iter_mut() {
            if !port.ext.int_flags.end_of_frame {
                continue;
            }
            if let Some(input) = inputs.get_mut(port.index()).and_then(Option::as_mut) {
                input.flags.end_of_frame = true;
                port.ext.int_flags.end_of_frame = false;
            }
        }
    }

    /// Drain up to one threshold frame from an input's buffer to its output.
    ///
    /// # Returns
    /// Whether the output was rendered.
    pub(super) fn send_buffered_data(
        &mut self,
        pool: &mut MarkerPool,
        out_index: usize,
        inputs: &mut [Option<StreamData>],
        outputs: &mut [Option<StreamData>],
    ) -> Result<bool> {
        let Some(peer) = self.outputs.get(out_index).and_then(|p| p.peer()) else {
            return Ok(false);
        };
        let index = peer.index;
        let Some(output) = outputs.get_mut(out_index).and_then(Option::as_mut) else {
            return Ok(false);
        };
        let mut input = inputs.get_mut(index).and_then(Option::as_mut);
        let sync_state = self.sync_state;
        let tolerance = i64::from(self.config.timestamp_tolerance_us);

        let Some(port) = self.inputs.get_mut(index) else {
            return Ok(false);
        };
        let ext = &mut port.ext;
        let (Some(format), Some(buffer)) = (ext.media_format, ext.buffer.as_mut()) else {
            return Ok(false);
        };
        let threshold = ext.threshold_bytes_per_ch;

        if output.capacity_per_ch() < threshold && !ext.pending_eof {
            return Err(EngineError::ProtocolViolation(format!(
                "output port {} holds {} bytes per channel, frame needs {}",
                out_index,
                output.capacity_per_ch(),
                threshold
            )));
        }

        output.set_len_per_ch(0);
        let before = buffer.len_per_ch();
        let read = before.min(threshold);
        let int_eof = ext.int_flags.end_of_frame;
        let starting_relaxed = sync_state == SyncState::Starting && ext.threshold_disabled;
        let ending = int_eof || ext.pending_eof || ext.pending_eos || ext.int_flags.marker_eos;
        let first_frame = !ext.output_sent_once && read > 0;

        let mut timestamp = ext.buffer_timestamp;
        if starting_relaxed && int_eof {
            timestamp = None;
        }

        // A port that has not yet delivered a full frame is padded at the
        // front so its first sample lines up with the other ports
        let mut zeros = 0;
        if (starting_relaxed || first_frame) && !ending {
            let want = threshold.saturating_sub(read).min(output.capacity_per_ch());
            for buf in &mut output.bufs {
                zeros = u32::try_from(buf.push_zeros(want as usize)).unwrap_or(0);
            }
            if let Some(ts) = timestamp.as_mut() {
                *ts = ts.saturating_sub(us_to_i64(format.bytes_to_us(zeros)));
            }
        }

        let copied = buffer.copy_to(output, read);
        let consumed = if ext.pending_eos || ext.int_flags.marker_eos {
            before
        } else {
            copied
        };

        if consumed > 0 {
            if consumed < before {
                buffer.drop_oldest(consumed);
                ext.buffer_timestamp = ext
                    .buffer_timestamp
                    .map(|ts| ts.saturating_add(us_to_i64(format.bytes_to_us(consumed))));
            } else {
                buffer.clear();
                ext.buffer_timestamp = None;
            }
        }

        if buffer.is_empty() && consumed > 0 && ext.pending_eos {
            let want = threshold.saturating_sub(output.len_per_ch());
            for buf in &mut output.bufs {
                buf.push_zeros(want as usize);
            }
        }

        let in_info = PropagationInfo::new(&format, before, consumed);
        let out_info = PropagationInfo::new(&format, zeros, copied);
        pool.propagate(
            &mut ext.int_markers,
            &mut ext.int_flags,
            &mut output.metadata,
            &mut output.flags,
            &in_info,
            &out_info,
        )?;
        pool.shift_offsets(&ext.int_markers, format.bytes_to_offset_units(consumed), Shift::Left);

        let out_len = output.len_per_ch();
        pool.move_flushing_to_end(&mut output.metadata, format.bytes_to_offset_units(out_len))?;

        if !ext.output_sent_once && out_len == threshold {
            ext.output_sent_once = true;
        }
        if out_len > 0 {
            ext.emitted_since_start = true;
        }

        output.timestamp = timestamp.unwrap_or(0);
        output.flags.timestamp_valid = timestamp.is_some();

        let sent_eos = output.flags.marker_eos;
        if sent_eos {
            output.flags.end_of_frame = true;
            ext.int_flags.end_of_frame = false;
            ext.pending_eos = false;
            ext.eos_received = true;
            if let Some(input) = input.as_deref_mut() {
                input.flags.end_of_frame = false;
            }
        } else {
            ext.pending_eos = false;
            ext.eos_received = false;
        }

        if ext.int_flags.end_of_frame && consumed == before {
            ext.int_flags.end_of_frame = false;
            if let Some(input) = input.as_deref_mut() {
                input.flags.end_of_frame = false;
            }
            output.flags.end_of_frame = true;
        }

        if starting_relaxed && ext.output_sent_once {
            ext.threshold_disabled = false;
            debug!("Input port {} delivered its first frame, threshold restored", index);
        }

        if out_len > 0 && out_len < threshold {
            output.flags.end_of_frame = true;
        }

        let duration = us_to_i64(format.bytes_to_us(output.len_per_ch()));
        if let Some(out_port) = self.outputs.get_mut(out_index) {
            let expected = &mut out_port.ext.expected_timestamp;
            if output.flags.end_of_frame {
                *expected = None;
            } else if let Some(exp) = *expected {
                match timestamp {
                    Some(ts) if ts.saturating_sub(exp).abs() < tolerance => {
                        *expected = Some(ts.saturating_add(duration));
                    }
                    _ => {
                        warn!(
                            "Output port {} timestamp discontinuity (expected {}us, got {:?}), dropping frame",
                            out_index, exp, timestamp
                        );
                        output.set_len_per_ch(0);
                        output.flags.end_of_frame = true;
                        *expected = None;
                    }
                }
            } else if let Some(ts) = timestamp {
                *expected = Some(ts.saturating_add(duration));
            }
        }

        trace!(
            "Output port {}: {} bytes per channel (zeros {}, copied {}, eos {})",
            out_index,
            out_len,
            zeros,
            copied,
            sent_eos
        );

        if sent_eos {
            info!("End-of-stream sent on output port {}", out_index);
            self.mark_port_stopped(index);
        }
        Ok(true)
    }

    /// Synthesize a flushing end-of-stream on outputs whose input closed
    /// while started
    pub(super) fn push_eos_at_close(
        &mut self,
        pool: &mut MarkerPool,
        outputs: &mut [Option<StreamData>],
    ) -> Result<()> {
        for port in self.outputs.iter_mut() {
            if !port.is_open() || !port.ext.needs_eos_at_close {
                continue;
            }
            // Retried next cycle when the scheduler gave no buffer
            let Some(output) = outputs.get_mut(port.index()).and_then(Option::as_mut) else {
                continue;
            };
            if !output.has_data() {
                pool.push_back(&mut output.metadata, Marker::eos(true, true))?;
                output.flags.marker_eos = true;
                output.flags.end_of_frame = true;
                info!("Pushed end-of-stream on output port {} after input close", port.index());
            }
            port.ext.needs_eos_at_close = false;
        }
        Ok(())
    }

    /// Stop inputs that delivered a data-flow gap this cycle
    pub(super) fn handle_dfg(&mut self, pool: &mut MarkerPool) {
        let gapped: Vec<usize> = self
            .inputs
            .iter()
            .filter(|p| p.is_open() && p.ext.pending_dfg)
            .map(|p| p.index())
            .collect();
        for index in gapped {
            debug!("Data-flow gap on input port {}", index);
            self.in_port_stop(pool, index);
        }
    }

    /// Drop buffered bytes and markers of one input
    pub(super) fn clear_buffered_data(&mut self, pool: &mut MarkerPool, index: usize) {
        let Some(port) = self.inputs.get_mut(index) else {
            return;
        };
        let ext = &mut port.ext;
        if let Some(buffer) = ext.buffer.as_mut() {
            if !buffer.is_empty() {
                debug!(
                    "Input port {} dropping {} buffered bytes per channel",
                    index,
                    buffer.len_per_ch()
                );
            }
            buffer.clear();
        }
        ext.buffer_timestamp = None;
        pool.destroy_all(&mut ext.int_markers, true);
        ext.int_flags = Default::default();
        ext.pending_eos = false;
    }

    /// Return a started input to Stopped after end-of-stream or a gap
    pub(super) fn mark_port_stopped(&mut self, index: usize) {
        let Some(port) = self.inputs.get_mut(index) else {
            return;
        };
        let peer = port.peer();
        port.ext.will_start_received = false;
        port.ext.output_sent_once = false;
        port.ext.pending_eos = false;
        if port.state() == PortState::Started {
            self.inputs.set_state(index, PortState::Stopped);
            debug!("Input port {} stopped", index);
        }
        if let Some(out) = peer.and_then(|p| self.outputs.get_mut(p.index)) {
            out.ext.expected_timestamp = None;
        }
    }

    /// Leave the relaxed threshold once every late joiner has delivered a
    /// full frame, or enter it when one appears
    pub(super) fn update_threshold_state(&mut self, output_rendered: bool) {
        let should_disable = self.inputs.iter().any(|p| {
            p.is_open() && p.ext.threshold_disabled && (p.is_started() || p.ext.will_start_received)
        });
        if should_disable == self.threshold_disabled || !output_rendered {
            return;
        }
        if !should_disable {
            self.sync_state = SyncState::Synced;
        }
        self.set_threshold_disabled(should_disable);
    }

    /// With a single input there is nothing to align; the module only needs
    /// to run while that input is relaxed or holds data
    pub(super) fn update_module_enable(&mut self) {
        if self.threshold_disabled || self.inputs.num_open() != 1 {
            return;
        }
        let Some(port) = self.inputs.iter().find(|p| p.is_open()) else {
            return;
        };
        let idle = !port.ext.threshold_disabled
            && port.ext.buffered_bytes_per_ch() == 0
            && !port.ext.int_flags.end_of_frame;
        self.set_module_enable(!idle);
    }
}
