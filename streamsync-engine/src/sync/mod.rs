//! Synchronization engine
//!
//! Aligns up to N independently arriving input streams so that their first
//! samples leave the module in the same cycle. Each input owns an internal
//! buffer holding one threshold frame (the container frame duration) plus one
//! upstream frame of slack. Input `n` feeds the output whose id is `n - 1`.
//!
//! A cycle runs:
//! 1. Scan inputs for end-of-stream, data-flow-gap and end-of-frame, and start
//!    stopped ports that received data.
//! 2. With no data anywhere, pass markers straight through.
//! 3. Buffer new data, then drain every port in lock-step once all synced
//!    ports (or any waiting port) reach the threshold.
//! 4. Push end-of-stream on outputs whose input closed mid-stream, handle
//!    data-flow gaps, and re-evaluate threshold mode and module enable.

mod buffer;
mod control;
mod data;
mod port;

pub use buffer::InternalBuffer;
pub use port::{PortMask, SyncInPort, SyncOutPort, SyncState};

use crate::config::SyncConfig;
use crate::engine::{ProcessOutcome, StreamEngine};
use crate::error::{EngineError, Result};
use crate::trigger_policy::TriggerPolicyCoordinator;
use streamsync_common::media_format::MAX_CHANNELS;
use streamsync_common::{
    Affinity, EngineEvent, EventSink, MarkerPool, MediaFormat, Port, PortDirection, PortId,
    PortState, PortTable, StreamData, TriggerPolicy,
};
use tracing::{debug, info, trace};

/// N-input stream synchronizer
pub struct SyncEngine {
    config: SyncConfig,
    pub(crate) inputs: PortTable<SyncInPort>,
    pub(crate) outputs: PortTable<SyncOutPort>,

    frame_duration_us: Option<u32>,
    sync_state: SyncState,

    /// Module-level threshold mode, mirrored to the scheduler
    threshold_disabled: bool,
    module_enabled: Option<bool>,

    coordinator: TriggerPolicyCoordinator,
    events: Box<dyn EventSink>,
    cycles: u64,
}

impl SyncEngine {
    /// Create an engine with every port closed
    pub fn new(config: SyncConfig, events: Box<dyn EventSink>) -> Result<Self> {
        if config.max_input_ports == 0 || config.max_input_ports > usize::from(MAX_CHANNELS) {
            return Err(EngineError::Config(format!(
                "max_input_ports {} outside 1..={}",
                config.max_input_ports, MAX_CHANNELS
            )));
        }
        if config.frame_duration_us == Some(0) {
            return Err(EngineError::Config("frame duration must be positive".into()));
        }

        info!(
            "Sync engine: {} ports, frame {:?}us, best-effort ids {:?}",
            config.max_input_ports, config.frame_duration_us, config.best_effort_port_ids
        );

        Ok(Self {
            inputs: PortTable::new(PortDirection::Input, config.max_input_ports),
            outputs: PortTable::new(PortDirection::Output, config.max_input_ports),
            frame_duration_us: config.frame_duration_us,
            sync_state: SyncState::Starting,
            threshold_disabled: false,
            module_enabled: None,
            coordinator: TriggerPolicyCoordinator::new(),
            events,
            cycles: 0,
            config,
        })
    }

    pub fn input(&self, index: usize) -> Option<&Port<SyncInPort>> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&Port<SyncOutPort>> {
        self.outputs.get(index)
    }

    pub fn frame_duration_us(&self) -> Option<u32> {
        self.frame_duration_us
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn is_threshold_disabled(&self) -> bool {
        self.threshold_disabled
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Last policy handed to the scheduler
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
        self.reset_cycle_flags();

        let any_data = self.validate_io(pool, inputs);
        let synced = self.synced_mask();
        let waiting = self.waiting_mask();

        let mut first_error: Option<EngineError> = None;
        let mut rendered = PortMask::default();

        if !any_data || (synced.is_empty() && waiting.is_empty()) {
            trace!("Cycle {}: no buffered work, passing metadata through", self.cycles);
            for index in 0..self.inputs.max_ports() {
                record(&mut first_error, self.pass_through_port(pool, index, inputs, outputs));
            }
        } else {
            trace!("Cycle {}: synced {} waiting {}", self.cycles, synced, waiting);

            for index in self.stopped_with_metadata(inputs).iter() {
                record(&mut first_error, self.pass_through_port(pool, index, inputs, outputs));
            }

            let (to_process, data_available) = self.setup_input(inputs);
            for index in to_process.iter() {
                record(&mut first_error, self.buffer_new_data(pool, index, inputs));
            }
            for index in data_available.difference(to_process).iter() {
                if let Some(input) = inputs.get_mut(index).and_then(Option::as_mut) {
                    input.mark_unconsumed();
                }
            }

            match self.setup_output(synced, waiting, outputs) {
                Ok(to_render) => {
                    for out_index in to_render.iter() {
                        match self.send_buffered_data(pool, out_index, inputs, outputs) {
                            Ok(true) => rendered.set(out_index),
                            Ok(false) => {}
                            Err(e) => record(&mut first_error, Err(e)),
                        }
                    }
                }
                Err(e) => {
                    self.restore_input_eof(inputs);
                    record(&mut first_error, Err(e));
                }
            }
        }

        record(&mut first_error, self.push_eos_at_close(pool, outputs));
        self.handle_dfg(pool);
        self.update_threshold_state(!rendered.is_empty());
        self.update_module_enable();
        self.publish_trigger_policy();

        if let Some(e) = first_error {
            return Err(e);
        }

        if self.threshold_disabled || (any_data && rendered.is_empty()) {
            Ok(ProcessOutcome::NeedMoreData)
        } else {
            Ok(ProcessOutcome::Completed)
        }
    }

    /// Policy for the current port states.
    ///
    /// Started inputs must fire, stopped ones may. An output must fire when
    /// its input is started. While the threshold is relaxed any input with
    /// any output triggers; otherwise every must-fire port is required.
    fn compute_policy(&self) -> TriggerPolicy {
        let inputs: Vec<Affinity> = self
            .inputs
            .iter()
            .map(|p| match p.state() {
                PortState::Closed => Affinity::NonExistent,
                PortState::Started => Affinity::MustFire,
                PortState::Stopped => Affinity::Optional,
            })
            .collect();

        let outputs: Vec<Affinity> = self
            .outputs
            .iter()
            .map(|p| {
                if !p.is_open() {
                    Affinity::NonExistent
                } else if p
                    .peer()
                    .is_some_and(|peer| self.inputs.state(peer.index) == PortState::Started)
                {
                    Affinity::MustFire
                } else {
                    Affinity::Optional
                }
            })
            .collect();

        if self.threshold_disabled {
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

/// Keep the first error of a cycle; later ones are only logged
fn record(first: &mut Option<EngineError>, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!("Sync cycle error: {}", e);
        if first.is_none() {
            *first = Some(e);
        }
    }
}

impl StreamEngine for SyncEngine {
    fn name(&self) -> &'static str {
        "sync"
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
        pool: &mut MarkerPool,
        direction: PortDirection,
        index: usize,
    ) -> Result<()> {
        self.stop_port(pool, direction, index)
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
        pool: &mut MarkerPool,
        index: usize,
        format: MediaFormat,
    ) -> Result<()> {
        self.apply_input_media_format(pool, index, format)
    }

    fn set_container_frame_duration(&mut self, pool: &mut MarkerPool, frame_us: u32) -> Result<()> {
        self.apply_frame_duration(pool, frame_us)
    }

    fn desired_trigger_policy(&self) -> TriggerPolicy {
        self.compute_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamsync_common::EventLog;

    fn engine() -> SyncEngine {
        let config = SyncConfig {
            max_input_ports: 2,
            ..SyncConfig::default()
        };
        SyncEngine::new(config, Box::new(EventLog::new())).unwrap()
    }

    #[test]
    fn test_rejects_bad_port_count() {
        let config = SyncConfig {
            max_input_ports: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            SyncEngine::new(config, Box::new(EventLog::new())),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_policy_follows_port_states() {
        let mut engine = engine();
        engine.port_open(PortDirection::Input, 0, 1).unwrap();
        engine.port_open(PortDirection::Output, 0, 0).unwrap();

        let policy = engine.desired_trigger_policy();
        assert_eq!(policy.inputs, vec![Affinity::Optional, Affinity::NonExistent]);
        assert_eq!(policy.outputs, vec![Affinity::Optional, Affinity::NonExistent]);

        engine.port_start(PortDirection::Input, 0).unwrap();
        let policy = engine.desired_trigger_policy();
        assert_eq!(policy.input(0), Affinity::MustFire);
        assert_eq!(policy.output(0), Affinity::MustFire, "Paired output follows its input");
        assert_eq!(policy.mode, streamsync_common::GroupMode::AllPorts);
    }
}
