//! Trigger-policy publication
//!
//! Engines recompute their desired policy after every cycle and port
//! operation. The coordinator forwards it to the scheduler only when it
//! differs from what was last published, and always publishes the first one.

use streamsync_common::{EngineEvent, EventSink, TriggerPolicy};
use tracing::debug;

/// Tracks the last policy handed to the scheduler
#[derive(Debug, Default)]
pub struct TriggerPolicyCoordinator {
    last: Option<TriggerPolicy>,
    publications: u64,
}

impl TriggerPolicyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `desired` if it changed. Returns true when an event was raised.
    pub fn update(&mut self, desired: TriggerPolicy, sink: &mut dyn EventSink) -> bool {
        if self.last.as_ref() == Some(&desired) {
            return false;
        }

        debug!(
            "Publishing trigger policy {:?}: inputs {:?} outputs {:?} ({} groups)",
            desired.mode,
            desired.inputs,
            desired.outputs,
            desired.groups.len()
        );
        sink.raise(EngineEvent::TriggerPolicyChanged {
            policy: desired.clone(),
        });
        self.last = Some(desired);
        self.publications += 1;
        true
    }

    pub fn current(&self) -> Option<&TriggerPolicy> {
        self.last.as_ref()
    }

    pub fn has_published(&self) -> bool {
        self.last.is_some()
    }

    pub fn publications(&self) -> u64 {
        self.publications
    }

    /// Forget the last publication so the next update always publishes
    pub fn reset(&mut self) {
        self.last = None;
    }
}
