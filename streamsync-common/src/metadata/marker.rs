//! Marker value types

use super::tracking::TrackingHandle;
use std::sync::Arc;

/// End-of-stream qualifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EosFlags {
    /// Downstream must drain all data before treating the stream as closed
    pub flushing: bool,
    /// Synthesized by a module rather than received from upstream
    pub internal: bool,
}

/// What a marker signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    EndOfStream(EosFlags),
    DataFlowGap,
    TimingMarker,
    /// Downstream should restart its session clock at this sample
    ResetSessionTime,
    Custom { id: u32 },
}

impl MarkerKind {
    pub fn is_eos(&self) -> bool {
        matches!(self, MarkerKind::EndOfStream(_))
    }

    pub fn is_flushing_eos(&self) -> bool {
        matches!(self, MarkerKind::EndOfStream(EosFlags { flushing: true, .. }))
    }

    pub fn is_dfg(&self) -> bool {
        matches!(self, MarkerKind::DataFlowGap)
    }
}

/// Where the payload bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    InBand,
    OutOfBand,
}

/// Marker payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Stored inline with the marker
    InBand(Vec<u8>),
    /// Owned elsewhere; the marker holds a shared reference
    OutOfBand(Arc<[u8]>),
}

impl Payload {
    pub fn storage(&self) -> Storage {
        match self {
            Payload::InBand(_) => Storage::InBand,
            Payload::OutOfBand(_) => Storage::OutOfBand,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::InBand(bytes) => bytes,
            Payload::OutOfBand(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::InBand(Vec::new())
    }
}

/// A control event attached to a point in the sample stream
#[derive(Debug)]
pub struct Marker {
    pub kind: MarkerKind,
    pub payload: Payload,
    /// Samples per channel for PCM, bytes for raw data
    pub offset: u32,
    pub tracking: Option<TrackingHandle>,
    /// Stays with the first sample when no data is consumed
    pub begin_associated: bool,
}

impl Marker {
    pub fn new(kind: MarkerKind) -> Self {
        Self {
            kind,
            payload: Payload::default(),
            offset: 0,
            tracking: None,
            begin_associated: false,
        }
    }

    pub fn eos(flushing: bool, internal: bool) -> Self {
        Self::new(MarkerKind::EndOfStream(EosFlags { flushing, internal }))
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_tracking(mut self, tracking: TrackingHandle) -> Self {
        self.tracking = Some(tracking);
        self
    }

    pub fn begin_associated(mut self) -> Self {
        self.begin_associated = true;
        self
    }

    pub fn storage(&self) -> Storage {
        self.payload.storage()
    }

    /// EOS flags, if this is an end-of-stream marker
    pub fn eos_flags(&self) -> Option<EosFlags> {
        match self.kind {
            MarkerKind::EndOfStream(flags) => Some(flags),
            _ => None,
        }
    }

    /// Change the flushing qualifier of an end-of-stream marker.
    ///
    /// Returns false when the marker is not an end-of-stream.
    pub fn set_flushing(&mut self, flushing: bool) -> bool {
        match &mut self.kind {
            MarkerKind::EndOfStream(flags) => {
                flags.flushing = flushing;
                true
            }
            _ => false,
        }
    }
}
