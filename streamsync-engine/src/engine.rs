//! Common contract of the stream composition engines
//!
//! The scheduler drives an engine synchronously, once per cycle, and
//! forwards port lifecycle notifications between cycles. Nothing here
//! blocks; "waiting" is expressed by returning [`ProcessOutcome::NeedMoreData`]
//! and being invoked again on the next cycle.

use crate::error::Result;
use streamsync_common::{MarkerPool, MediaFormat, PortDirection, PortId, StreamData, TriggerPolicy};

/// Non-error result of one processing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Inputs consumed and/or outputs produced normally
    Completed,
    /// Still buffering; unconsumed input was left in place for the next cycle
    NeedMoreData,
    /// Output suppressed while a new output media format is announced
    OutputFormatChanged,
}

/// Engine invoked by the scheduler
pub trait StreamEngine {
    fn name(&self) -> &'static str;

    /// Run one cycle.
    ///
    /// `inputs[i]` / `outputs[i]` are `None` when the scheduler has no buffer
    /// for that port this cycle. On return each input's valid length is the
    /// number of bytes consumed, each output's valid length the number of
    /// bytes produced.
    fn process(
        &mut self,
        pool: &mut MarkerPool,
        inputs: &mut [Option<StreamData>],
        outputs: &mut [Option<StreamData>],
    ) -> Result<ProcessOutcome>;

    fn port_open(&mut self, direction: PortDirection, index: usize, id: PortId) -> Result<()>;

    fn port_start(&mut self, direction: PortDirection, index: usize) -> Result<()>;

    fn port_stop(
        &mut self,
        pool: &mut MarkerPool,
        direction: PortDirection,
        index: usize,
    ) -> Result<()>;

    /// Close a port, discarding its buffered data; undelivered markers are
    /// destroyed as dropped
    fn port_close(
        &mut self,
        pool: &mut MarkerPool,
        direction: PortDirection,
        index: usize,
    ) -> Result<()>;

    fn set_input_media_format(
        &mut self,
        pool: &mut MarkerPool,
        index: usize,
        format: MediaFormat,
    ) -> Result<()>;

    /// Container frame duration supplied by the scheduler
    fn set_container_frame_duration(&mut self, pool: &mut MarkerPool, frame_us: u32) -> Result<()>;

    /// Policy the engine wants the scheduler to apply from now on
    fn desired_trigger_policy(&self) -> TriggerPolicy;
}
