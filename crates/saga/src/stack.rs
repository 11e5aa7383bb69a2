//! The per-execution compensation stack, rebuilt by folding saga events.

use std::collections::BTreeMap;

use common::ActivityError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compensation::CompensationRef;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::report::{CompensationOutcome, CompensationReport};
use crate::state::SagaPhase;

/// Progress of one stack entry's compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Not scheduled yet.
    Pending,
    /// Compensation activity in flight.
    Scheduled { activity_id: u64 },
    /// Compensation succeeded.
    Compensated { attempts: u32 },
    /// Compensation exhausted its retries.
    Failed { error: ActivityError, attempts: u32 },
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Compensated { .. } | EntryStatus::Failed { .. }
        )
    }
}

/// A completed compensable step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEntry {
    /// Command id of the forward step.
    pub step_id: u64,
    pub compensation: CompensationRef,
    /// Input the compensation activity will be scheduled with.
    pub input: Value,
    pub status: EntryStatus,
}

/// An event-sourced compensation stack.
///
/// Entries are pushed in completion order and unwound LIFO, one at a time.
/// Since the whole structure is derived from history, resuming an unwind
/// after a crash never schedules an entry twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompensationStack {
    phase: SagaPhase,
    /// Scheduled compensable steps awaiting their outcome.
    pending: BTreeMap<u64, CompensationRef>,
    entries: Vec<StackEntry>,
    /// Entry indices in the order their compensations were scheduled.
    unwind_order: Vec<usize>,
    unwind_reason: Option<String>,
}

impl CompensationStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event to the stack.
    ///
    /// Fails if the event cannot follow the current state, which means the
    /// history it came from is corrupt or was produced by different code.
    pub fn apply(&mut self, event: SagaEvent) -> Result<()> {
        match event {
            SagaEvent::CompensableStepScheduled {
                step_id,
                compensation,
            } => {
                self.pending.insert(step_id, compensation);
            }
            SagaEvent::StepCompleted { step_id, result } => {
                if let Some(compensation) = self.pending.remove(&step_id)
                    && !self.phase.is_terminal()
                {
                    let input = compensation
                        .compensation_input
                        .resolve(&compensation.input, &result);
                    self.entries.push(StackEntry {
                        step_id,
                        compensation,
                        input,
                        status: EntryStatus::Pending,
                    });
                }
            }
            SagaEvent::StepFailed { step_id } => {
                self.pending.remove(&step_id);
            }
            SagaEvent::UnwindStarted { reason } => {
                if !self.phase.can_unwind() {
                    return Err(SagaError::InvalidPhase {
                        operation: "start unwinding",
                        actual: self.phase,
                    });
                }
                self.phase = SagaPhase::Unwinding;
                self.unwind_reason = Some(reason);
            }
            SagaEvent::CompensationScheduled { index, activity_id } => {
                if self.phase != SagaPhase::Unwinding {
                    return Err(SagaError::InvalidPhase {
                        operation: "schedule compensation",
                        actual: self.phase,
                    });
                }
                let entry = self
                    .entries
                    .get_mut(index)
                    .ok_or(SagaError::UnknownEntry(index))?;
                if entry.status != EntryStatus::Pending {
                    return Err(SagaError::AlreadyScheduled(index));
                }
                entry.status = EntryStatus::Scheduled { activity_id };
                self.unwind_order.push(index);
            }
            SagaEvent::CompensationCompleted {
                activity_id,
                attempts,
            } => {
                let entry = self.in_flight_mut(activity_id)?;
                entry.status = EntryStatus::Compensated { attempts };
            }
            SagaEvent::CompensationFailed {
                activity_id,
                error,
                attempts,
            } => {
                let entry = self.in_flight_mut(activity_id)?;
                entry.status = EntryStatus::Failed { error, attempts };
            }
        }

        self.refresh_phase();
        Ok(())
    }

    /// Applies multiple events in sequence.
    pub fn apply_events(&mut self, events: impl IntoIterator<Item = SagaEvent>) -> Result<()> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    fn in_flight_mut(&mut self, activity_id: u64) -> Result<&mut StackEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.status == EntryStatus::Scheduled { activity_id })
            .ok_or(SagaError::UnknownCompensation(activity_id))
    }

    fn refresh_phase(&mut self) {
        if self.phase == SagaPhase::Unwinding
            && self.pending.is_empty()
            && self.entries.iter().all(|e| e.status.is_terminal())
        {
            self.phase = SagaPhase::Drained;
        }
    }
}

// Query methods
impl CompensationStack {
    /// Returns the current phase.
    pub fn phase(&self) -> SagaPhase {
        self.phase
    }

    /// Returns the pushed entries, bottom of the stack first.
    pub fn entries(&self) -> &[StackEntry] {
        &self.entries
    }

    /// Returns true if no compensable step has completed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pushed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the command id belongs to a compensable step still in flight.
    pub fn is_pending_step(&self, step_id: u64) -> bool {
        self.pending.contains_key(&step_id)
    }

    /// Returns the lowest command id of a compensable step still in flight.
    pub fn first_pending_step(&self) -> Option<u64> {
        self.pending.keys().next().copied()
    }

    /// Returns the reason unwinding started, if it did.
    pub fn unwind_reason(&self) -> Option<&str> {
        self.unwind_reason.as_deref()
    }

    /// Returns the index and activity id of the in-flight compensation.
    pub fn in_flight(&self) -> Option<(usize, u64)> {
        self.entries
            .iter()
            .enumerate()
            .find_map(|(index, e)| match e.status {
                EntryStatus::Scheduled { activity_id } => Some((index, activity_id)),
                _ => None,
            })
    }

    /// Returns the top-most entry that has not been scheduled yet.
    pub fn next_unscheduled(&self) -> Option<(usize, &StackEntry)> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| e.status == EntryStatus::Pending)
    }

    /// Builds the report of the compensations that reached a terminal outcome.
    pub fn report(&self) -> CompensationReport {
        let mut report = CompensationReport::default();

        for &index in &self.unwind_order {
            let Some(entry) = self.entries.get(index) else {
                continue;
            };
            let outcome = |attempts: u32, error: Option<ActivityError>| CompensationOutcome {
                step: entry.compensation.activity_name.clone(),
                compensation_activity: entry.compensation.compensation_activity_name.clone(),
                attempts,
                error,
            };
            match &entry.status {
                EntryStatus::Compensated { attempts } => {
                    report.compensated.push(outcome(*attempts, None));
                }
                EntryStatus::Failed { error, attempts } => {
                    report.failed.push(outcome(*attempts, Some(error.clone())));
                }
                EntryStatus::Pending | EntryStatus::Scheduled { .. } => {}
            }
        }

        report
    }
}
