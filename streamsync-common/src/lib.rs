//! # StreamSync Common Library
//!
//! Shared building blocks for the stream composition engines:
//! - Error type and config file resolution
//! - Media format arithmetic
//! - Stream buffers and the offset-tagged marker list model
//! - Port lifecycle table
//! - Trigger policy and engine event types

pub mod config;
pub mod error;
pub mod events;
pub mod media_format;
pub mod metadata;
pub mod port;
pub mod stream;
pub mod trigger;

pub use error::{Error, Result};
pub use events::{EngineEvent, EventLog, EventSink};
pub use media_format::{DataFormat, Interleaving, MediaFormat};
pub use metadata::{
    EosFlags, Marker, MarkerId, MarkerKind, MarkerList, MarkerPool, MetadataError, Payload,
    PropagationInfo, PropagationOutcome, Shift, Storage, TrackingEvent, TrackingHandle,
    TrackingRecorder, TrackingSink,
};
pub use port::{Closed, PeerLink, Port, PortDirection, PortError, PortId, PortState, PortTable};
pub use stream::{ChannelBuffer, StreamData, StreamFlags};
pub use trigger::{Affinity, GroupMode, TriggerGroup, TriggerPolicy};
