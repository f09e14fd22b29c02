//! Replayable event log for the groove learning pipeline.
//!
//! Consumers pull bounded batches, apply their effects, and only then commit
//! the offset of the last event they handled. A consumer re-created for the
//! same group resumes after its last committed offset, which gives
//! at-least-once delivery.
//!
//! # Key Types
//!
//! - [`EventLog`] - Trait for appending events and creating consumers
//! - [`EventConsumer`] - Trait for polling events with offset tracking
//! - [`InMemoryEventLog`] - Shared in-process implementation

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Error, Result};
pub use memory::InMemoryEventLog;
pub use traits::{EventBatch, EventConsumer, EventLog, Offset, SeekPosition};
