//! Stream composition engines (streamsync-engine)
//!
//! Two engines share one contract ([`StreamEngine`]):
//! - [`sync::SyncEngine`] aligns N independently arriving inputs into
//!   threshold-sized output frames.
//! - [`gapless::GaplessEngine`] feeds two logical streams into one output and
//!   switches between them at the exact end-of-stream sample.

pub mod config;
pub mod engine;
pub mod error;
pub mod gapless;
pub mod sync;
pub mod trigger_policy;

pub use config::EngineConfig;
pub use engine::{ProcessOutcome, StreamEngine};
pub use error::{EngineError, Result};
pub use gapless::GaplessEngine;
pub use sync::SyncEngine;
pub use trigger_policy::TriggerPolicyCoordinator;
