//! Execution runtime for durable saga workflows.
//!
//! This crate provides:
//! - The workflow driver: replays an execution's history through its code
//!   and appends the commands it produced, under optimistic concurrency
//! - The activity dispatcher: queues, retries with backoff and timeouts
//! - A timer service for durable timers and retry backoff
//! - Startup recovery and history retention
//! - [`WorkflowClient`] and [`ActivityTaskClient`], the public surface
//!
//! ```text
//! client ──► history ──► workflow worker ──► commands ──► history
//!                ▲                                           │
//!                └──── activity outcome ◄── activity worker ◄┘
//! ```
//!
//! History is the only state that survives a restart. Everything in memory
//! (queues, timers, in-flight attempts) is rebuilt from it by
//! [`RuntimeBuilder::start`].

mod activity;
mod client;
mod config;
mod dispatch;
mod driver;
mod error;
mod queue;
mod recovery;
mod runtime;
mod task;
mod timer;
mod worker;

pub use activity::{Activity, ActivityContext, ActivityRegistry, FnActivity};
pub use client::{ActivityTaskClient, StartWorkflowOptions, WorkflowClient, WorkflowOutcome};
pub use config::RuntimeOptions;
pub use dispatch::DispatchOutcome;
pub use driver::{CHILD_CANCELLED, CHILD_TERMINATED, outcome_result};
pub use error::{Result, RuntimeError};
pub use recovery::RecoveryReport;
pub use runtime::{Runtime, RuntimeBuilder};
pub use task::ActivityTask;
