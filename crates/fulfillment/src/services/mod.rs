//! External service traits and in-memory implementations for the order saga.

pub mod inventory;
pub mod notification;
pub mod payment;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::ServiceError;

pub use inventory::{InMemoryInventoryService, InventoryService};
pub use notification::{InMemoryNotifier, Notifier};
pub use payment::{InMemoryPaymentGateway, PaymentGateway};

/// Scripted outages, keyed by activity name.
///
/// Each armed failure makes one attempt of that activity fail with a
/// transient [`ServiceError::Unavailable`] before it reaches its service.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pending: Arc<Mutex<HashMap<String, u32>>>,
}

impl Faults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` attempts of `activity`.
    pub async fn fail_next(&self, activity: &str, times: u32) {
        *self.pending.lock().await.entry(activity.to_string()).or_default() += times;
    }

    /// Consumes one armed failure for `activity`, if any.
    pub async fn check(&self, activity: &str) -> Result<(), ServiceError> {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(activity) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ServiceError::Unavailable(activity.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Failures armed for `activity` that have not fired yet.
    pub async fn remaining(&self, activity: &str) -> u32 {
        self.pending.lock().await.get(activity).copied().unwrap_or(0)
    }
}

/// The services the saga's activities call.
#[derive(Clone)]
pub struct Services {
    pub payments: Arc<dyn PaymentGateway>,
    pub inventory: Arc<dyn InventoryService>,
    pub notifier: Arc<dyn Notifier>,
    pub faults: Faults,
}

impl Services {
    pub fn new(
        payments: Arc<dyn PaymentGateway>,
        inventory: Arc<dyn InventoryService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            payments,
            inventory,
            notifier,
            faults: Faults::new(),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Fresh in-memory services with default limits.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryPaymentGateway::new()),
            Arc::new(InMemoryInventoryService::new()),
            Arc::new(InMemoryNotifier::new()),
        )
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").field("faults", &self.faults).finish()
    }
}
