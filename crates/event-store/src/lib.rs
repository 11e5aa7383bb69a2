//! Append-only, per-execution event history.
//!
//! The history of a workflow execution is the source of truth for recovery:
//! the engine never stores derived state, it re-folds the ordered events.
//! Appends are guarded by an expected last sequence number so that at most
//! one writer wins a race on the same execution.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::ExecutionKey;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, SequenceNo};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::EventQuery;
pub use store::{AppendOptions, EventStore, EventStoreExt};
