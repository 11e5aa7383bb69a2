//! Compensation phase machine.

use serde::{Deserialize, Serialize};

/// The phase of one execution's compensation stack.
///
/// State transitions:
/// ```text
/// Idle ──► Unwinding ──► Drained
/// ```
/// `Idle → Unwinding` happens at most once, on the first failure the
/// workflow treats as terminal. `Drained` is reached once every pushed
/// entry has a terminal compensation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaPhase {
    /// Forward execution; completed compensable steps are pushed.
    #[default]
    Idle,

    /// Compensations are being scheduled one at a time, top of stack first.
    Unwinding,

    /// Every compensation reached a terminal outcome (terminal phase).
    Drained,
}

impl SagaPhase {
    /// Returns true if entries may still be pushed.
    pub fn can_push(&self) -> bool {
        matches!(self, SagaPhase::Idle)
    }

    /// Returns true if unwinding may begin.
    pub fn can_unwind(&self) -> bool {
        matches!(self, SagaPhase::Idle)
    }

    /// Returns true once unwinding began (including after it finished).
    pub fn has_unwound(&self) -> bool {
        matches!(self, SagaPhase::Unwinding | SagaPhase::Drained)
    }

    /// Returns true if this is the terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaPhase::Drained)
    }

    /// Returns the phase name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaPhase::Idle => "Idle",
            SagaPhase::Unwinding => "Unwinding",
            SagaPhase::Drained => "Drained",
        }
    }
}

impl std::fmt::Display for SagaPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
