//! Events raised by engines to the scheduler

use crate::media_format::MediaFormat;
use crate::port::PortId;
use crate::trigger::TriggerPolicy;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Engine to scheduler notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// New trigger policy for the next cycles
    TriggerPolicyChanged { policy: TriggerPolicy },

    /// Output port carries a new media format
    OutputMediaFormat { port_index: usize, format: MediaFormat },

    /// End-of-stream left a delay buffer ahead of the audible gap
    EarlyEos {
        module_id: u32,
        port_index: usize,
        port_id: PortId,
        client_id: u32,
        /// Tracking token of the end-of-stream marker, when tracked
        token: Option<Uuid>,
    },

    /// Module has (or no longer has) work to do
    ModuleEnable { enabled: bool },

    /// Threshold-sized triggering required (or relaxed while syncing)
    ThresholdToggled { enabled: bool },

    /// Scheduler may (or may not) duty cycle the graph
    AllowDutyCycling { allowed: bool },
}

impl EngineEvent {
    /// Get event type as string
    pub fn event_type(&self) -> &str {
        match self {
            EngineEvent::TriggerPolicyChanged { .. } => "TriggerPolicyChanged",
            EngineEvent::OutputMediaFormat { .. } => "OutputMediaFormat",
            EngineEvent::EarlyEos { .. } => "EarlyEos",
            EngineEvent::ModuleEnable { .. } => "ModuleEnable",
            EngineEvent::ThresholdToggled { .. } => "ThresholdToggled",
            EngineEvent::AllowDutyCycling { .. } => "AllowDutyCycling",
        }
    }
}

/// Destination for engine events
pub trait EventSink: Send {
    fn raise(&mut self, event: EngineEvent);
}

impl EventSink for mpsc::Sender<EngineEvent> {
    fn raise(&mut self, event: EngineEvent) {
        if self.send(event).is_err() {
            warn!("Event receiver dropped, event discarded");
        }
    }
}

/// In-memory event sink
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<EngineEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }
}

impl EventSink for EventLog {
    fn raise(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}
