//! Port lifecycle, media format and threshold control

use super::buffer::InternalBuffer;
use super::port::SyncState;
use super::SyncEngine;
use crate::error::{EngineError, Result};
use streamsync_common::{
    EngineEvent, MarkerPool, MediaFormat, PeerLink, PortDirection, PortError, PortId,
};
use tracing::{debug, info, warn};

impl SyncEngine {
    pub(super) fn open_port(
        &mut self,
        direction: PortDirection,
        index: usize,
        id: PortId,
    ) -> Result<()> {
        match direction {
            PortDirection::Input => {
                self.inputs.open(index, id)?;
                let best_effort = self.config.best_effort_port_ids.contains(&id);
                if let Some(port) = self.inputs.get_mut(index) {
                    port.ext.best_effort = best_effort;
                }
                let out_index = id.checked_sub(1).and_then(|out_id| self.outputs.index_of(out_id));
                if let Some(out_index) = out_index {
                    self.link(index, out_index);
                }
                if self.inputs.num_open() > 1 {
                    self.set_module_enable(true);
                }
                info!("Sync input port {} opened (id {}, best-effort {})", index, id, best_effort);
            }
            PortDirection::Output => {
                self.outputs.open(index, id)?;
                let in_index = id.checked_add(1).and_then(|in_id| self.inputs.index_of(in_id));
                if let Some(in_index) = in_index {
                    self.link(in_index, index);
                }
                info!("Sync output port {} opened (id {})", index, id);
            }
        }
        self.publish_trigger_policy();
        Ok(())
    }

    /// Pair an input with its output; the output inherits the input's format
    fn link(&mut self, in_index: usize, out_index: usize) {
        let in_id = self.inputs.get(in_index).and_then(|p| p.id());
        let out_id = self.outputs.get(out_index).and_then(|p| p.id());
        let (Some(in_id), Some(out_id)) = (in_id, out_id) else {
            return;
        };

        self.inputs.set_peer(in_index, Some(PeerLink { index: out_index, id: out_id }));
        self.outputs.set_peer(out_index, Some(PeerLink { index: in_index, id: in_id }));
        debug!("Linked input port {} to output port {}", in_index, out_index);

        let format = self.inputs.get(in_index).and_then(|p| p.ext.media_format);
        if let Some(format) = format {
            self.raise(EngineEvent::OutputMediaFormat {
                port_index: out_index,
                format,
            });
        }
    }

    pub(super) fn start_port(&mut self, direction: PortDirection, index: usize) -> Result<()> {
        match direction {
            PortDirection::Input => {
                let previous = self.inputs.start(index)?;
                if previous != streamsync_common::PortState::Started {
                    if let Some(port) = self.inputs.get_mut(index) {
                        port.ext.output_sent_once = false;
                        port.ext.emitted_since_start = false;
                    }
                    self.sync_state = SyncState::Starting;
                }
                // Scheduler may have reset its view of the threshold mode
                if self.threshold_disabled {
                    self.raise(EngineEvent::ThresholdToggled { enabled: false });
                }
            }
            PortDirection::Output => {
                self.outputs.start(index)?;
            }
        }
        self.publish_trigger_policy();
        Ok(())
    }

    pub(super) fn stop_port(
        &mut self,
        pool: &mut MarkerPool,
        direction: PortDirection,
        index: usize,
    ) -> Result<()> {
        match direction {
            PortDirection::Input => {
                self.inputs.stop(index)?;
                self.in_port_stop(pool, index);
                if let Some(port) = self.inputs.get_mut(index) {
                    port.ext.threshold_disabled = false;
                }
                self.update_threshold_state(true);
            }
            PortDirection::Output => {
                self.outputs.stop(index)?;
                if let Some(port) = self.outputs.get_mut(index) {
                    port.ext.expected_timestamp = None;
                }
            }
        }
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
                let peer = port.peer();
                let arm_eos = port.is_started() && port.ext.emitted_since_start;

                self.clear_buffered_data(pool, index);
                let closed = self.inputs.close(index)?;

                if let Some(peer) = peer {
                    self.outputs.set_peer(peer.index, None);
                    if arm_eos {
                        if let Some(out) = self.outputs.get_mut(peer.index) {
                            out.ext.needs_eos_at_close = true;
                            debug!(
                                "Output port {} will carry end-of-stream for closed input",
                                peer.index
                            );
                        }
                    }
                }
                self.update_threshold_state(true);
                info!("Sync input port {} closed (id {})", index, closed.id);
            }
            PortDirection::Output => {
                let peer = self.outputs.get(index).and_then(|p| p.peer());
                let closed = self.outputs.close(index)?;
                if let Some(peer) = peer {
                    self.inputs.set_peer(peer.index, None);
                }
                info!("Sync output port {} closed (id {})", index, closed.id);
            }
        }
        self.publish_trigger_policy();
        Ok(())
    }

    /// Drop an input's buffered state and stop it
    pub(super) fn in_port_stop(&mut self, pool: &mut MarkerPool, index: usize) {
        self.clear_buffered_data(pool, index);
        self.mark_port_stopped(index);
    }

    pub(super) fn apply_input_media_format(
        &mut self,
        pool: &mut MarkerPool,
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
        if port.ext.media_format == Some(format) {
            return Ok(());
        }
        let peer = port.peer();

        for other in self.inputs.iter() {
            if let Some(other_format) = other.ext.media_format {
                if other.index() != index && other_format.sample_rate != format.sample_rate {
                    warn!(
                        "Input port {} sample rate {} differs from port {} ({})",
                        index,
                        format.sample_rate,
                        other.index(),
                        other_format.sample_rate
                    );
                }
            }
        }

        self.clear_buffered_data(pool, index);
        if let Some(port) = self.inputs.get_mut(index) {
            port.ext.media_format = Some(format);
            port.ext.buffer = None;
        }
        self.configure_port_buffer(index)?;
        info!("Sync input port {} media format {}", index, format);

        if let Some(peer) = peer {
            self.raise(EngineEvent::OutputMediaFormat {
                port_index: peer.index,
                format,
            });
        }
        if self.threshold_disabled {
            self.raise(EngineEvent::ThresholdToggled { enabled: false });
        }
        Ok(())
    }

    pub(super) fn apply_frame_duration(
        &mut self,
        pool: &mut MarkerPool,
        frame_us: u32,
    ) -> Result<()> {
        if frame_us == 0 {
            return Err(EngineError::Config("container frame duration must be positive".into()));
        }
        if self.frame_duration_us == Some(frame_us) {
            return Ok(());
        }
        info!("Sync container frame duration {}us", frame_us);
        self.frame_duration_us = Some(frame_us);

        let configured: Vec<usize> = self
            .inputs
            .iter()
            .filter(|p| p.is_open() && p.ext.media_format.is_some())
            .map(|p| p.index())
            .collect();
        for index in configured {
            self.clear_buffered_data(pool, index);
            self.configure_port_buffer(index)?;
        }
        Ok(())
    }

    /// Size the threshold and allocate the internal buffer once both the
    /// media format and the frame duration are known
    fn configure_port_buffer(&mut self, index: usize) -> Result<()> {
        let Some(frame_us) = self.frame_duration_us else {
            return Ok(());
        };
        let upstream_us = self.config.upstream_frame_us;
        let Some(port) = self.inputs.get_mut(index) else {
            return Ok(());
        };
        let Some(format) = port.ext.media_format else {
            return Ok(());
        };

        let threshold = format.us_to_bytes_per_ch(u64::from(frame_us));
        let frame_size = format.us_to_bytes_per_ch(u64::from(upstream_us));
        let capacity = threshold.saturating_add(frame_size);
        port.ext.buffer = None;
        let buffer = InternalBuffer::allocate(usize::from(format.num_channels), capacity as usize)?;

        port.ext.threshold_bytes_per_ch = threshold;
        port.ext.frame_size_bytes_per_ch = frame_size;
        port.ext.buffer = Some(buffer);
        debug!(
            "Input port {} threshold {} bytes, buffer {} bytes per channel",
            index, threshold, capacity
        );
        Ok(())
    }

    /// Upstream announced that `index` is about to start.
    ///
    /// Relaxes the threshold so the joining port's first frame can be padded
    /// with leading zeros and line up with ports already running. Ignored for
    /// a port that is already started and synced.
    pub fn port_will_start(&mut self, pool: &mut MarkerPool, index: usize) -> Result<()> {
        let Some(port) = self.inputs.get(index) else {
            return Err(PortError::IndexOutOfRange {
                direction: PortDirection::Input,
                index,
                max: self.inputs.max_ports(),
            }
            .into());
        };
        if !port.is_open() {
            return Err(PortError::NotOpen {
                direction: PortDirection::Input,
                index,
            }
            .into());
        }
        if port.is_started() && port.ext.output_sent_once && !port.ext.threshold_disabled {
            debug!("Input port {} already synced, ignoring will-start", index);
            return Ok(());
        }

        self.clear_buffered_data(pool, index);
        if let Some(port) = self.inputs.get_mut(index) {
            port.ext.threshold_disabled = true;
            port.ext.output_sent_once = false;
            port.ext.will_start_received = true;
        }
        self.sync_state = SyncState::Starting;
        info!("Input port {} will start, relaxing threshold", index);

        if !self.threshold_disabled {
            self.set_threshold_disabled(true);
        }
        self.publish_trigger_policy();
        Ok(())
    }

    pub(super) fn set_threshold_disabled(&mut self, disabled: bool) {
        self.threshold_disabled = disabled;
        info!("Sync threshold {}", if disabled { "relaxed" } else { "restored" });
        self.raise(EngineEvent::ThresholdToggled { enabled: !disabled });
    }

    pub(super) fn set_module_enable(&mut self, enabled: bool) {
        if self.module_enabled == Some(enabled) {
            return;
        }
        self.module_enabled = Some(enabled);
        self.raise(EngineEvent::ModuleEnable { enabled });
    }
}
