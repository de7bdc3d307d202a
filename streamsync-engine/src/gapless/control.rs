//! Port lifecycle and delay line configuration

use super::delay_buffer::DelayBuffer;
use super::port::SwitchMode;
use super::{GaplessEngine, NUM_INPUTS};
use crate::config::MAX_EARLY_EOS_DELAY_MS;
use crate::error::{EngineError, Result};
use streamsync_common::{
    EngineEvent, MarkerPool, MediaFormat, PortDirection, PortError, PortId, PortState,
};
use tracing::{debug, info};

impl GaplessEngine {
    pub(super) fn open_port(
        &mut self,
        direction: PortDirection,
        index: usize,
        id: PortId,
    ) -> Result<()> {
        match direction {
            PortDirection::Input => {
                self.inputs.open(index, id)?;
                info!("Gapless input port {} opened (id {})", index, id);
            }
            PortDirection::Output => {
                self.outputs.open(index, id)?;
                info!("Gapless output port {} opened (id {})", index, id);
                if let Some(format) = self.operating_format {
                    self.raise(EngineEvent::OutputMediaFormat {
                        port_index: index,
                        format,
                    });
                }
            }
        }
        self.publish_trigger_policy();
        Ok(())
    }

    pub(super) fn start_port(&mut self, direction: PortDirection, index: usize) -> Result<()> {
        match direction {
            PortDirection::Input => {
                let previous = self.inputs.start(index)?;
                if let Some(port) = self.inputs.get_mut(index) {
                    port.ext.timestamp_warned = false;
                    if previous != PortState::Started {
                        port.ext.emitted_since_start = false;
                    }
                }
            }
            PortDirection::Output => {
                self.outputs.start(index)?;
            }
        }
        self.publish_trigger_policy();
        Ok(())
    }

    pub(super) fn stop_port(&mut self, direction: PortDirection, index: usize) -> Result<()> {
        match direction {
            PortDirection::Input => self.inputs.stop(index)?,
            PortDirection::Output => self.outputs.stop(index)?,
        };
        self.publish_trigger_policy();
        Ok(())
    }

    pub(super) fn close_port(
        &mut self,
        pool: &mut MarkerPool,
        direction: PortDirection,
        index: usize,
    ) -> Result<()> {
        match direction {
            PortDirection::Input => {
                let Some(port) = self.inputs.get(index) else {
                    return Err(PortError::IndexOutOfRange {
                        direction,
                        index,
                        max: self.inputs.max_ports(),
                    }
                    .into());
                };
                let was_active = self.active == Some(index);
                let mid_stream = was_active && port.is_started() && port.ext.emitted_since_start;
                let closed_format = self.delay_format(index);

                if let Some(delay) = self.inputs.get_mut(index).and_then(|p| p.ext.delay.as_mut()) {
                    delay.clear(pool);
                }
                let closed = self.inputs.close(index)?;

                if was_active {
                    self.active = None;
                    let waiting = (0..NUM_INPUTS)
                        .find(|&i| i != index && self.buffered_bytes(i) > 0)
                        .filter(|&i| {
                            closed_format.is_some() && self.delay_format(i) == closed_format
                        });
                    match waiting {
                        Some(other) => {
                            info!(
                                "Active input port {} closed, input port {} continues",
                                index, other
                            );
                            self.active = Some(other);
                        }
                        None if mid_stream => {
                            debug!(
                                "Active input port {} closed mid-stream, end-of-stream armed",
                                index
                            );
                            self.eos_at_close_pending = true;
                        }
                        None => debug!("Active input port {} closed", index),
                    }
                }
                info!("Gapless input port {} closed (id {})", index, closed.id);
            }
            PortDirection::Output => {
                let closed = self.outputs.close(index)?;
                info!("Gapless output port {} closed (id {})", index, closed.id);
            }
        }
        self.publish_trigger_policy();
        Ok(())
    }

    pub(super) fn apply_input_media_format(
        &mut self,
        index: usize,
        format: MediaFormat,
    ) -> Result<()> {
        let port = self.inputs.get(index).ok_or(PortError::IndexOutOfRange {
            direction: PortDirection::Input,
            index,
            max: self.inputs.max_ports(),
        })?;
        if !port.is_open() {
            return Err(PortError::NotOpen {
                direction: PortDirection::Input,
                index,
            }
            .into());
        }
        if !format.is_supported_pcm() {
            return Err(EngineError::UnsupportedFormat(format.to_string()));
        }

        if let Some(port) = self.inputs.get_mut(index) {
            port.ext.media_format = Some(format);
        }
        info!("Gapless input port {} media format {}", index, format);
        self.check_create_delay_buffers()?;

        let is_active = self.active == Some(index);
        let mut applied = false;
        let mut has_delay = false;
        if let Some(delay) = self.inputs.get_mut(index).and_then(|p| p.ext.delay.as_mut()) {
            has_delay = true;
            applied = delay.set_format(format)?;
        }

        if has_delay {
            if applied && is_active {
                self.set_operating_format(format);
            }
        } else if self.operating_format.is_none() || is_active {
            self.set_operating_format(format);
        }
        self.publish_trigger_policy();
        Ok(())
    }

    pub(super) fn apply_frame_duration(&mut self, frame_us: u32) -> Result<()> {
        if frame_us == 0 {
            return Err(EngineError::Config("container frame duration must be positive".into()));
        }
        if self.frame_duration_us != Some(frame_us) {
            info!("Gapless container frame duration {}us", frame_us);
            self.frame_duration_us = Some(frame_us);
        }
        self.check_create_delay_buffers()?;
        self.publish_trigger_policy();
        Ok(())
    }

    /// Change the delay line length. Rejected while a stream is active.
    pub fn set_early_eos_delay(&mut self, pool: &mut MarkerPool, delay_ms: u32) -> Result<()> {
        if delay_ms > MAX_EARLY_EOS_DELAY_MS {
            return Err(EngineError::Config(format!(
                "early end-of-stream delay {}ms exceeds {}ms",
                delay_ms, MAX_EARLY_EOS_DELAY_MS
            )));
        }
        if let Some(active) = self.active {
            return Err(EngineError::ProtocolViolation(format!(
                "delay change while input port {} is active",
                active
            )));
        }
        if delay_ms == self.early_eos_delay_ms {
            return Ok(());
        }

        info!("Early end-of-stream delay {}ms -> {}ms", self.early_eos_delay_ms, delay_ms);
        self.early_eos_delay_ms = delay_ms;
        self.destroy_delay_buffers(pool);
        self.check_create_delay_buffers()?;
        self.publish_trigger_policy();
        Ok(())
    }

    pub fn register_early_eos_client(&mut self, client_id: u32) -> Result<()> {
        if let Some(existing) = self.client_id {
            return Err(EngineError::ProtocolViolation(format!(
                "early end-of-stream client {} already registered",
                existing
            )));
        }
        self.client_id = Some(client_id);
        info!("Early end-of-stream client {} registered", client_id);
        self.check_create_delay_buffers()?;
        self.publish_trigger_policy();
        Ok(())
    }

    pub fn deregister_early_eos_client(&mut self) -> Result<()> {
        let Some(client_id) = self.client_id.take() else {
            return Err(EngineError::ProtocolViolation(
                "no early end-of-stream client registered".into(),
            ));
        };
        info!("Early end-of-stream client {} deregistered", client_id);
        Ok(())
    }

    pub fn set_duty_cycling(&mut self, enabled: bool) {
        self.duty_cycling = enabled;
        debug!("Duty cycling {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Drop everything buffered for the active stream
    pub fn algorithmic_reset(&mut self, pool: &mut MarkerPool) {
        let Some(active) = self.active else {
            return;
        };
        if let Some(delay) = self.inputs.get_mut(active).and_then(|p| p.ext.delay.as_mut()) {
            delay.clear(pool);
            info!("Delay buffer of input port {} reset", active);
        }
        self.publish_trigger_policy();
    }

    /// Leave pass-through once a delay, a listener and the container frame
    /// are all known, and give every configured input its delay line
    fn check_create_delay_buffers(&mut self) -> Result<()> {
        if self.mode == SwitchMode::PassThrough {
            let ready = self.early_eos_delay_ms > 0
                && self.client_id.is_some()
                && self.frame_duration_us.is_some();
            if !ready {
                debug!(
                    "Staying in pass-through (delay {}ms, client {:?}, frame {:?})",
                    self.early_eos_delay_ms, self.client_id, self.frame_duration_us
                );
                return Ok(());
            }
            self.mode = SwitchMode::Buffered;
            info!("Gapless engine buffered with {}ms delay", self.early_eos_delay_ms);
        }

        let delay_ms = self.early_eos_delay_ms;
        for port in self.inputs.iter_mut() {
            if !port.is_open() || port.ext.delay.is_some() {
                continue;
            }
            let Some(format) = port.ext.media_format else {
                continue;
            };
            port.ext.delay = Some(DelayBuffer::new(format, delay_ms)?);
            debug!("Input port {} delay line created for {}", port.index(), format);
        }
        Ok(())
    }

    fn destroy_delay_buffers(&mut self, pool: &mut MarkerPool) {
        for port in self.inputs.iter_mut() {
            if let Some(mut delay) = port.ext.delay.take() {
                delay.clear(pool);
            }
        }
        self.mode = SwitchMode::PassThrough;
    }
}
