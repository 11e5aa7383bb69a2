//! Saga compensation for durable workflows.
//!
//! Every workflow execution owns a compensation stack. Each compensable step
//! that completes pushes its undo action; on the first irrecoverable failure
//! the stack is unwound in reverse, one compensation at a time:
//!
//! ```text
//! Idle ──► Unwinding ──► Drained
//! ```
//!
//! A compensation that exhausts its retries is recorded and the unwind goes
//! on with the remaining entries; the resulting [`CompensationReport`]
//! surfaces `CompensationIncomplete` instead of pretending the rollback
//! succeeded.
//!
//! The stack is never stored directly. It is folded from [`SagaEvent`]s that
//! the workflow crate derives from an execution's history, so a crash in the
//! middle of an unwind resumes without scheduling any compensation twice.

pub mod compensation;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod report;
pub mod stack;
pub mod state;

pub use compensation::{CompensationInput, CompensationRef};
pub use error::SagaError;
pub use events::SagaEvent;
pub use orchestrator::{UnwindStep, next_step};
pub use report::{CompensationOutcome, CompensationReport};
pub use stack::{CompensationStack, EntryStatus, StackEntry};
pub use state::SagaPhase;
