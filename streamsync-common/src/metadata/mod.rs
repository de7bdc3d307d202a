//! Offset-tagged control marker lists
//!
//! Markers (end-of-stream, data-flow-gap, timing, ...) ride alongside sample
//! data. Each marker carries an offset into the buffer it is attached to. The
//! offset must never point past the end of that buffer and is renormalized by
//! every copy, split or shift of the underlying data.
//!
//! Lists are index-linked nodes inside a [`MarkerPool`] arena. The pool is an
//! ordinary owned value passed by reference to whoever moves markers around;
//! a [`MarkerList`] is just a small head/tail/len handle.

mod marker;
mod pool;
mod propagate;
mod tracking;

pub use marker::{EosFlags, Marker, MarkerKind, Payload, Storage};
pub use pool::{MarkerId, MarkerIter, MarkerList, MarkerPool};
pub use propagate::{PropagationInfo, PropagationOutcome, Shift};
pub use tracking::{TrackingEvent, TrackingHandle, TrackingRecorder, TrackingSink};

use thiserror::Error;

/// Errors raised by marker list operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// Arena reached its configured node limit
    #[error("Marker pool exhausted: {limit} markers live")]
    PoolExhausted { limit: usize },

    /// Id refers to a freed or never-allocated node
    #[error("Unknown marker {0:?}")]
    UnknownMarker(MarkerId),

    /// Node is not linked into the list it was used with
    #[error("Marker {0:?} is not a member of this list")]
    ForeignMarker(MarkerId),

    /// Propagation format description cannot be used for offset math
    #[error("Invalid propagation format: {0}")]
    InvalidFormat(String),
}
