//! Drop/consume notification for tracked markers
//!
//! A producer that wants to know the fate of a marker attaches a
//! [`TrackingHandle`]. The handle's sink is told exactly once whether the
//! marker was dropped or consumed: either explicitly through
//! [`TrackingHandle::complete`] or, if the handle is simply dropped, as
//! [`TrackingEvent::Dropped`].

use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::trace;
use uuid::Uuid;

/// Final fate of a tracked marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEvent {
    Dropped,
    Consumed,
}

/// Receiver of tracking notifications
pub trait TrackingSink: Send + Sync {
    fn notify(&self, token: Uuid, event: TrackingEvent);
}

/// Owned tracking reference carried by a marker
pub struct TrackingHandle {
    token: Uuid,
    sink: Option<Arc<dyn TrackingSink>>,
}

impl TrackingHandle {
    pub fn new(sink: Arc<dyn TrackingSink>) -> Self {
        Self::with_token(Uuid::new_v4(), sink)
    }

    pub fn with_token(token: Uuid, sink: Arc<dyn TrackingSink>) -> Self {
        Self {
            token,
            sink: Some(sink),
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Deliver the final notification and release the handle
    pub fn complete(mut self, event: TrackingEvent) {
        self.fire(event);
    }

    fn fire(&mut self, event: TrackingEvent) {
        if let Some(sink) = self.sink.take() {
            trace!("Tracking {} -> {:?}", self.token, event);
            sink.notify(self.token, event);
        }
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        self.fire(TrackingEvent::Dropped);
    }
}

impl fmt::Debug for TrackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingHandle")
            .field("token", &self.token)
            .field("pending", &self.sink.is_some())
            .finish()
    }
}

/// Sink that records every notification it receives
#[derive(Debug, Default)]
pub struct TrackingRecorder {
    events: Mutex<Vec<(Uuid, TrackingEvent)>>,
}

impl TrackingRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(Uuid, TrackingEvent)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Notifications received for `token`
    pub fn events_for(&self, token: Uuid) -> Vec<TrackingEvent> {
        self.events()
            .into_iter()
            .filter(|(t, _)| *t == token)
            .map(|(_, e)| e)
            .collect()
    }
}

impl TrackingSink for TrackingRecorder {
    fn notify(&self, token: Uuid, event: TrackingEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((token, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_notifies_once() {
        let recorder = TrackingRecorder::new();
        let handle = TrackingHandle::new(recorder.clone());
        let token = handle.token();

        handle.complete(TrackingEvent::Consumed);

        assert_eq!(recorder.events_for(token), vec![TrackingEvent::Consumed]);
    }

    #[test]
    fn test_implicit_drop_reports_dropped() {
        let recorder = TrackingRecorder::new();
        let token = {
            let handle = TrackingHandle::new(recorder.clone());
            handle.token()
        };

        assert_eq!(recorder.events_for(token), vec![TrackingEvent::Dropped]);
    }
}
