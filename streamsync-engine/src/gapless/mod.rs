//! Gapless switchover engine
//!
//! Two inputs, one output. At most one input (the active port) drives the
//! output at a time. When the active stream ends with a flushing
//! end-of-stream and the other input already has data waiting, the output
//! continues with the other stream in the same frame and the end-of-stream is
//! downgraded so downstream never drains a gap.
//!
//! Until an early end-of-stream listener, a delay and the container frame are
//! all known the engine runs in [`SwitchMode::PassThrough`]. Afterwards each
//! input feeds a [`DelayBuffer`], which lets the end-of-stream be announced
//! `early_eos_delay_ms` before it reaches the output.

mod control;
mod data;
mod delay_buffer;
mod port;

pub use delay_buffer::{DelayBuffer, ReadOutcome, WriteOutcome};
pub use port::{GaplessInPort, SwitchMode};

use crate::config::GaplessConfig;
use crate::engine::{ProcessOutcome, StreamEngine};
use crate::error::{EngineError, Result};
use crate::trigger_policy::TriggerPolicyCoordinator;
use streamsync_common::{
    Affinity, EngineEvent, EventSink, Marker, MarkerKind, MarkerPool, MediaFormat, Port,
    PortDirection, PortId, PortState, PortTable, StreamData, TriggerPolicy,
};
use tracing::{debug, info, trace};

/// Inputs of the gapless engine
pub const NUM_INPUTS: usize = 2;
/// The single output
pub const OUTPUT_INDEX: usize = 0;

pub struct GaplessEngine {
    config: GaplessConfig,
    pub(crate) inputs: PortTable<GaplessInPort>,
    pub(crate) outputs: PortTable<()>,

    mode: SwitchMode,
    active: Option<usize>,
    operating_format: Option<MediaFormat>,
    /// Output format switches on the next cycle, before any data flows
    format_change_pending: bool,

    early_eos_delay_ms: u32,
    frame_duration_us: Option<u32>,
    client_id: Option<u32>,
    duty_cycling: bool,

    sent_eos_this_call: bool,
    send_reset_session_time: bool,
    /// Active input closed mid-stream; the output owes downstream an
    /// end-of-stream
    eos_at_close_pending: bool,

    coordinator: TriggerPolicyCoordinator,
    events: Box<dyn EventSink>,
    cycles: u64,
}

impl GaplessEngine {
    pub fn new(config: GaplessConfig, events: Box<dyn EventSink>) -> Result<Self> {
        if config.early_eos_delay_ms > crate::config::MAX_EARLY_EOS_DELAY_MS {
            return Err(EngineError::Config(format!(
                "early_eos_delay_ms {} exceeds {}",
                config.early_eos_delay_ms,
                crate::config::MAX_EARLY_EOS_DELAY_MS
            )));
        }
        if config.frame_duration_us == Some(0) {
            return Err(EngineError::Config("frame duration must be positive".into()));
        }

        info!(
            "Gapless engine: module {}, delay {}ms, duty cycling {}",
            config.module_id, config.early_eos_delay_ms, config.duty_cycling
        );

        Ok(Self {
            inputs: PortTable::new(PortDirection::Input, NUM_INPUTS),
            outputs: PortTable::new(PortDirection::Output, 1),
            mode: SwitchMode::PassThrough,
            active: None,
            operating_format: None,
            format_change_pending: false,
            early_eos_delay_ms: config.early_eos_delay_ms,
            frame_duration_us: config.frame_duration_us,
            client_id: config.early_eos_client,
            duty_cycling: config.duty_cycling,
            sent_eos_this_call: false,
            send_reset_session_time: false,
            eos_at_close_pending: false,
            coordinator: TriggerPolicyCoordinator::new(),
            events,
            cycles: 0,
            config,
        })
    }

    pub fn mode(&self) -> SwitchMode {
        self.mode
    }

    /// Input currently driving the output
    pub fn active_port(&self) -> Option<usize> {
        self.active
    }

    pub fn operating_format(&self) -> Option<MediaFormat> {
        self.operating_format
    }

    pub fn is_format_change_pending(&self) -> bool {
        self.format_change_pending
    }

    pub fn input(&self, index: usize) -> Option<&Port<GaplessInPort>> {
        self.inputs.get(index)
    }

    pub fn early_eos_delay_ms(&self) -> u32 {
        self.early_eos_delay_ms
    }

    pub fn early_eos_client(&self) -> Option<u32> {
        self.client_id
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn published_policy(&self) -> Option<&TriggerPolicy> {
        self.coordinator.current()
    }

    fn run_cycle(
        &mut self,
        pool: &mut MarkerPool,
        inputs: &mut [Option<StreamData>],
        outputs: &mut [Option<StreamData>],
    ) -> Result<ProcessOutcome> {
        self.cycles += 1;
        if self.sent_eos_this_call {
            self.send_reset_session_time = true;
        }
        self.sent_eos_this_call = false;

        if self.format_change_pending {
            self.publish_pending_format(inputs);
            self.publish_trigger_policy();
            return Ok(ProcessOutcome::OutputFormatChanged);
        }

        if self.push_eos_at_close(pool, outputs)? {
            self.hold_inputs(inputs);
            self.publish_trigger_policy();
            return Ok(ProcessOutcome::Completed);
        }

        let result = match self.mode {
            SwitchMode::PassThrough => self
                .buffer_input(pool, inputs)
                .and_then(|()| self.write_output(pool, inputs, outputs)),
            SwitchMode::Buffered => self
                .write_output(pool, inputs, outputs)
                .and_then(|()| self.buffer_input(pool, inputs))
                .and_then(|()| {
                    if self.format_change_pending {
                        Ok(())
                    } else {
                        self.write_output(pool, inputs, outputs)
                    }
                }),
        };

        if let Err(e) = &result {
            tracing::error!("Gapless cycle {} failed: {}", self.cycles, e);
        }

        if let Some(output) = outputs.get_mut(OUTPUT_INDEX).and_then(Option::as_mut) {
            output.flags.timestamp_valid = false;
            if self.send_reset_session_time && output.has_data() {
                let reset = Marker::new(MarkerKind::ResetSessionTime);
                pool.insert_sorted(&mut output.metadata, reset)?;
                self.send_reset_session_time = false;
                debug!("Reset session time inserted on output");
            }
        }

        self.publish_trigger_policy();
        result.map(|()| ProcessOutcome::Completed)
    }

    /// Announce the active port's format and hold all input for this cycle
    fn publish_pending_format(&mut self, inputs: &mut [Option<StreamData>]) {
        self.format_change_pending = false;
        if let Some(format) = self.active_format() {
            self.set_operating_format(format);
        }
        self.hold_inputs(inputs);
        trace!("Cycle {}: output format change published", self.cycles);
    }

    fn hold_inputs(&self, inputs: &mut [Option<StreamData>]) {
        for port in self.inputs.iter().filter(|p| p.is_started()) {
            if let Some(input) = inputs.get_mut(port.index()).and_then(Option::as_mut) {
                input.mark_unconsumed();
            }
        }
    }

    /// Format of the data the active port will emit next
    fn active_format(&self) -> Option<MediaFormat> {
        let port = self.inputs.get(self.active?)?;
        match &port.ext.delay {
            Some(delay) => Some(delay.format()),
            None => port.ext.media_format,
        }
    }

    pub(crate) fn set_operating_format(&mut self, format: MediaFormat) {
        if self.operating_format == Some(format) {
            return;
        }
        self.operating_format = Some(format);
        info!("Gapless operating format {}", format);
        if self.outputs.get(OUTPUT_INDEX).is_some_and(|p| p.is_open()) {
            self.raise(EngineEvent::OutputMediaFormat {
                port_index: OUTPUT_INDEX,
                format,
            });
        }
    }

    /// Policy for the current mode.
    ///
    /// Started inputs must fire unless their delay line is full. The output
    /// must fire in pass-through, while the active delay line holds data, or
    /// while an end-of-stream for a closed input is owed.
    /// Pass-through with both inputs open triggers on `(in0 || in1) && out`;
    /// buffered mode triggers on any port.
    fn compute_policy(&self) -> TriggerPolicy {
        let buffered = self.mode == SwitchMode::Buffered;

        let inputs: Vec<Affinity> = self
            .inputs
            .iter()
            .map(|p| match p.state() {
                PortState::Closed => Affinity::NonExistent,
                PortState::Stopped => Affinity::Optional,
                PortState::Started => {
                    if buffered && p.ext.delay.as_ref().is_some_and(|d| d.is_full()) {
                        Affinity::Blocked
                    } else {
                        Affinity::MustFire
                    }
                }
            })
            .collect();

        let active_has_data = self
            .active
            .and_then(|i| self.inputs.get(i))
            .and_then(|p| p.ext.delay.as_ref())
            .is_some_and(|d| !d.is_empty());

        let outputs: Vec<Affinity> = self
            .outputs
            .iter()
            .map(|p| match p.state() {
                PortState::Closed => Affinity::NonExistent,
                PortState::Stopped => Affinity::Optional,
                PortState::Started => {
                    if !buffered || active_has_data || self.eos_at_close_pending {
                        Affinity::MustFire
                    } else {
                        Affinity::Optional
                    }
                }
            })
            .collect();

        let all_closed = self.inputs.num_open() == 0 && self.outputs.num_open() == 0;
        if buffered || all_closed || self.eos_at_close_pending {
            TriggerPolicy::any_port(inputs, outputs)
        } else if self.inputs.num_open() > 1 {
            TriggerPolicy::any_input_and_output(inputs, outputs)
        } else {
            TriggerPolicy::all_ports(inputs, outputs)
        }
    }

    pub(crate) fn publish_trigger_policy(&mut self) {
        let desired = self.compute_policy();
        self.coordinator.update(desired, self.events.as_mut());
    }

    pub(crate) fn raise(&mut self, event: EngineEvent) {
        debug!("Raising {}", event.event_type());
        self.events.raise(event);
    }
}

impl StreamEngine for GaplessEngine {
    fn name(&self) -> &'static str {
        "gapless"
    }

    fn process(
        &mut self,
        pool: &mut MarkerPool,
        inputs: &mut [Option<StreamData>],
        outputs: &mut [Option<StreamData>],
    ) -> Result<ProcessOutcome> {
        self.run_cycle(pool, inputs, outputs)
    }

    fn port_open(&mut self, direction: PortDirection, index: usize, id: PortId) -> Result<()> {
        self.open_port(direction, index, id)
    }

    fn port_start(&mut self, direction: PortDirection, index: usize) -> Result<()> {
        self.start_port(direction, index)
    }

    fn port_stop(
        &mut self,
        _pool: &mut MarkerPool,
        direction: PortDirection,
        index: usize,
    ) -> Result<()> {
        self.stop_port(direction, index)
    }

    fn port_close(
        &mut self,
        pool: &mut MarkerPool,
        direction: PortDirection,
        index: usize,
    ) -> Result<()> {
        self.close_port(pool, direction, index)
    }

    fn set_input_media_format(
        &mut self,
        _pool: &mut MarkerPool,
        index: usize,
        format: MediaFormat,
    ) -> Result<()> {
        self.apply_input_media_format(index, format)
    }

    fn set_container_frame_duration(
        &mut self,
        _pool: &mut MarkerPool,
        frame_us: u32,
    ) -> Result<()> {
        self.apply_frame_duration(frame_us)
    }

    fn desired_trigger_policy(&self) -> TriggerPolicy {
        self.compute_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamsync_common::{EventLog, GroupMode};

    #[test]
    fn test_rejects_excessive_delay() {
        let config = GaplessConfig {
            early_eos_delay_ms: 501,
            ..GaplessConfig::default()
        };
        assert!(matches!(
            GaplessEngine::new(config, Box::new(EventLog::new())),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_pass_through_policy_groups() {
        let mut engine =
            GaplessEngine::new(GaplessConfig::default(), Box::new(EventLog::new())).unwrap();
        engine.port_open(PortDirection::Input, 0, 10).unwrap();
        engine.port_open(PortDirection::Output, 0, 1).unwrap();
        assert_eq!(engine.desired_trigger_policy().mode, GroupMode::AllPorts);

        engine.port_open(PortDirection::Input, 1, 11).unwrap();
        let policy = engine.desired_trigger_policy();
        assert_eq!(policy.groups.len(), 2, "Inputs and output trigger as separate groups");
        assert_eq!(engine.mode(), SwitchMode::PassThrough);
    }
}
