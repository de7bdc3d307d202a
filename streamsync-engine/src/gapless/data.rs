//! Data path of the gapless engine

use super::port::SwitchMode;
use super::{GaplessEngine, NUM_INPUTS, OUTPUT_INDEX};
use crate::error::{EngineError, Result};
use streamsync_common::{EngineEvent, Marker, MarkerId, MarkerPool, PropagationInfo, StreamData};
use tracing::{debug, info, trace, warn};

/// Stream switches handled within one output frame
const MAX_SWITCHES_PER_CYCLE: usize = NUM_INPUTS + 1;

impl GaplessEngine {
    /// Pick an active port if none is set, then (in buffered mode) move new
    /// input into the delay lines
    pub(super) fn buffer_input(
        &mut self,
        pool: &mut MarkerPool,
        inputs: &mut [Option<StreamData>],
    ) -> Result<()> {
        self.ignore_input_timestamps(inputs);

        if self.active.is_none() {
            self.assign_active_port(inputs)?;
        }
        if self.mode == SwitchMode::PassThrough {
            // Only the active input is read; the rest waits for its turn
            for (index, input) in inputs.iter_mut().enumerate().take(NUM_INPUTS) {
                if Some(index) != self.active {
                    if let Some(input) = input.as_mut() {
                        input.mark_unconsumed();
                    }
                }
            }
            return Ok(());
        }

        for index in 0..NUM_INPUTS {
            let Some(input) = inputs.get_mut(index).and_then(Option::as_mut) else {
                continue;
            };
            let Some(port) = self.inputs.get_mut(index) else {
                continue;
            };
            if !input.has_anything() {
                continue;
            }
            if !port.is_started() {
                input.mark_unconsumed();
                continue;
            }
            let port_id = port.id().unwrap_or_default();
            let Some(delay) = port.ext.delay.as_mut() else {
                warn!("Input port {} has data but no media format, leaving it unconsumed", index);
                input.mark_unconsumed();
                continue;
            };

            let outcome = delay.write(pool, input)?;
            let full = delay.is_full();
            trace!("Input port {} buffered {} bytes per channel", index, outcome.written);

            if let Some(eos) = outcome.eos {
                info!("End-of-stream entered delay line of input port {}", index);
                self.raise_early_eos(pool, index, port_id, eos);
                if self.duty_cycling {
                    self.raise(EngineEvent::AllowDutyCycling { allowed: false });
                }
            }
            if self.duty_cycling && full {
                self.raise(EngineEvent::AllowDutyCycling { allowed: true });
            }
        }
        Ok(())
    }

    /// Send the end-of-stream armed by closing the active input mid-stream.
    ///
    /// # Returns
    /// True when it was sent; the cycle then carries nothing else
    pub(super) fn push_eos_at_close(
        &mut self,
        pool: &mut MarkerPool,
        outputs: &mut [Option<StreamData>],
    ) -> Result<bool> {
        if !self.eos_at_close_pending {
            return Ok(false);
        }
        let open = self.outputs.get(OUTPUT_INDEX).is_some_and(|p| p.is_open());
        if !open {
            debug!("Output closed, dropping end-of-stream armed at input close");
            self.eos_at_close_pending = false;
            return Ok(false);
        }
        // Retried next cycle when the scheduler gave no buffer
        let Some(output) = outputs.get_mut(OUTPUT_INDEX).and_then(Option::as_mut) else {
            return Ok(false);
        };
        if output.has_data() {
            return Ok(false);
        }

        pool.push_back(&mut output.metadata, Marker::eos(true, true))?;
        output.flags.marker_eos = true;
        output.flags.end_of_frame = true;
        self.eos_at_close_pending = false;
        self.sent_eos_this_call = true;
        info!("Pushed end-of-stream on output after active input close");
        Ok(true)
    }

    /// Valid timestamps cannot be honored across a switch; drop them
    fn ignore_input_timestamps(&mut self, inputs: &mut [Option<StreamData>]) {
        for port in self.inputs.iter_mut() {
            let Some(input) = inputs.get_mut(port.index()).and_then(Option::as_mut) else {
                continue;
            };
            if !input.flags.timestamp_valid {
                continue;
            }
            if !port.ext.timestamp_warned {
                warn!("Input port {} carries valid timestamps, ignoring them", port.index());
                port.ext.timestamp_warned = true;
            }
            input.flags.timestamp_valid = false;
        }
    }

    /// First started port with data (or buffered data) becomes active and
    /// sets the operating format
    fn assign_active_port(&mut self, inputs: &[Option<StreamData>]) -> Result<()> {
        let candidate = self.inputs.iter().filter(|p| p.is_started()).find(|p| {
            let has_input = inputs
                .get(p.index())
                .and_then(Option::as_ref)
                .is_some_and(|sd| sd.has_data() || sd.flags.end_of_frame);
            has_input || p.ext.has_buffered_data()
        });
        let Some(port) = candidate else {
            return Ok(());
        };
        let index = port.index();
        let format = match &port.ext.delay {
            Some(delay) => delay.format(),
            None => port.ext.media_format.ok_or_else(|| {
                EngineError::ProtocolViolation(format!(
                    "data on input port {} before its media format",
                    index
                ))
            })?,
        };

        self.active = Some(index);
        info!("Input port {} is now active", index);
        self.set_operating_format(format);
        Ok(())
    }

    /// Drain the active stream into the output, switching streams at a
    /// flushing end-of-stream
    pub(super) fn write_output(
        &mut self,
        pool: &mut MarkerPool,
        inputs: &mut [Option<StreamData>],
        outputs: &mut [Option<StreamData>],
    ) -> Result<()> {
        let Some(output) = outputs.get_mut(OUTPUT_INDEX).and_then(Option::as_mut) else {
            if let Some(active) = self.active {
                if let Some(input) = inputs.get_mut(active).and_then(Option::as_mut) {
                    if self.mode == SwitchMode::PassThrough {
                        input.mark_unconsumed();
                    }
                }
            }
            return Ok(());
        };

        for _ in 0..MAX_SWITCHES_PER_CYCLE {
            if self.format_change_pending {
                return Ok(());
            }
            let Some(active) = self.active else {
                return Ok(());
            };

            let eos = match self.mode {
                SwitchMode::PassThrough => self.pass_through(pool, active, inputs, output)?,
                SwitchMode::Buffered => self.read_delay_buffer(pool, active, output)?,
            };
            let Some(eos) = eos else {
                return Ok(());
            };

            self.sent_eos_this_call = true;
            self.check_eos_tracking(pool, eos)?;

            let active_has_more = self.buffered_bytes(active) > 0;
            if active_has_more {
                debug!("Input port {} has more data after end-of-stream, downgrading", active);
                downgrade_eos(pool, eos, output);
                let delay = self.inputs.get_mut(active).and_then(|p| p.ext.delay.as_mut());
                if let Some(delay) = delay {
                    delay.clear_end_of_frame();
                }
                continue;
            }

            // Downstream has seen this stream end
            if let Some(port) = self.inputs.get_mut(active) {
                port.ext.emitted_since_start = false;
            }

            let other = (0..NUM_INPUTS).find(|&i| i != active && self.buffered_bytes(i) > 0);
            let Some(other) = other else {
                info!("Stream on input port {} ended, no stream waiting", active);
                self.active = None;
                return Ok(());
            };

            self.active = Some(other);
            let same_format = self.delay_format(active).is_some()
                && self.delay_format(active) == self.delay_format(other);
            if same_format {
                info!("Switching from input port {} to {} without a gap", active, other);
                downgrade_eos(pool, eos, output);
                continue;
            }

            info!(
                "Switching from input port {} to {}, output format changes next cycle",
                active, other
            );
            self.format_change_pending = true;
            output.flags.end_of_frame = true;
            return Ok(());
        }

        warn!("Too many stream switches in one cycle, continuing next cycle");
        Ok(())
    }

    /// Copy the active input straight to the output.
    ///
    /// # Returns
    /// End-of-stream that reached the output, if any
    fn pass_through(
        &mut self,
        pool: &mut MarkerPool,
        active: usize,
        inputs: &mut [Option<StreamData>],
        output: &mut StreamData,
    ) -> Result<Option<MarkerId>> {
        let Some(input) = inputs.get_mut(active).and_then(Option::as_mut) else {
            return Ok(None);
        };
        if output.has_data() {
            input.mark_unconsumed();
            return Ok(None);
        }
        let Some(port) = self.inputs.get(active) else {
            return Ok(None);
        };
        let port_id = port.id().unwrap_or_default();
        let Some(format) = port.ext.media_format else {
            input.mark_unconsumed();
            return Ok(None);
        };

        let in_len = input.len_per_ch();
        let count = in_len.min(output.capacity_per_ch());
        for (src, dst) in input.bufs.iter().zip(output.bufs.iter_mut()) {
            dst.clear();
            dst.push_slice(src.head(count as usize));
        }
        input.set_len_per_ch(count);

        let had_eos = pool.find_eos(&input.metadata).is_some();
        let in_info = PropagationInfo::new(&format, in_len, count);
        let out_info = PropagationInfo::new(&format, 0, count);
        let outcome = pool.propagate(
            &mut input.metadata,
            &mut input.flags,
            &mut output.metadata,
            &mut output.flags,
            &in_info,
            &out_info,
        )?;

        let move_eof = if had_eos {
            outcome.moved_eos.is_some()
        } else {
            count == in_len
        };
        if move_eof && input.flags.end_of_frame {
            input.flags.end_of_frame = false;
            output.flags.end_of_frame = true;
        }

        if count > 0 {
            if let Some(port) = self.inputs.get_mut(active) {
                port.ext.emitted_since_start = true;
            }
        }
        trace!("Passed {} bytes per channel from input port {}", count, active);

        if let Some(eos) = outcome.moved_eos {
            self.raise_early_eos(pool, active, port_id, eos);
            if self.duty_cycling {
                self.raise(EngineEvent::AllowDutyCycling { allowed: false });
            }
        }
        Ok(outcome.moved_eos)
    }

    fn read_delay_buffer(
        &mut self,
        pool: &mut MarkerPool,
        active: usize,
        output: &mut StreamData,
    ) -> Result<Option<MarkerId>> {
        let Some(port) = self.inputs.get_mut(active) else {
            return Ok(None);
        };
        let Some(delay) = port.ext.delay.as_mut() else {
            return Ok(None);
        };
        let outcome = delay.read(pool, output)?;
        if outcome.read > 0 {
            port.ext.emitted_since_start = true;
        }
        trace!("Read {} bytes per channel from delay line {}", outcome.read, active);

        if let Some(format) = outcome.applied_format {
            if self.operating_format != Some(format) {
                debug!("Input port {} drained, output format changes next cycle", active);
                self.format_change_pending = true;
            }
        }
        Ok(outcome.eos)
    }

    pub(super) fn buffered_bytes(&self, index: usize) -> u32 {
        if self.mode == SwitchMode::PassThrough {
            return 0;
        }
        self.inputs
            .get(index)
            .and_then(|p| p.ext.delay.as_ref())
            .map_or(0, |d| d.len_per_ch())
    }

    pub(super) fn delay_format(&self, index: usize) -> Option<streamsync_common::MediaFormat> {
        self.inputs.get(index)?.ext.delay.as_ref().map(|d| d.format())
    }

    /// Upstream end-of-stream must carry tracking so the switch can be
    /// reported back to its producer
    fn check_eos_tracking(&self, pool: &MarkerPool, eos: MarkerId) -> Result<()> {
        let Some(marker) = pool.get(eos) else {
            return Ok(());
        };
        let internal = marker.eos_flags().is_some_and(|f| f.internal);
        if !internal && marker.tracking.is_none() {
            tracing::error!("External end-of-stream without tracking reached the output");
            return Err(EngineError::ProtocolViolation(
                "external end-of-stream carries no tracking".into(),
            ));
        }
        Ok(())
    }

    fn raise_early_eos(
        &mut self,
        pool: &MarkerPool,
        port_index: usize,
        port_id: u32,
        eos: MarkerId,
    ) {
        let Some(client_id) = self.client_id else {
            debug!("End-of-stream on input port {}, no early end-of-stream client", port_index);
            return;
        };
        let token = pool.get(eos).and_then(|m| m.tracking.as_ref()).map(|t| t.token());
        let module_id = self.config.module_id;
        self.raise(EngineEvent::EarlyEos {
            module_id,
            port_index,
            port_id,
            client_id,
            token,
        });
    }
}

/// The next stream follows seamlessly; downstream must not flush
fn downgrade_eos(pool: &mut MarkerPool, eos: MarkerId, output: &mut StreamData) {
    if let Some(marker) = pool.get_mut(eos) {
        marker.set_flushing(false);
    }
    output.flags.end_of_frame = false;
    output.flags.marker_eos = pool.has_flushing_eos(&output.metadata);
}
