//! Payment gateway trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ServiceError;

/// Amounts above this are declined by the in-memory gateway.
pub const DEFAULT_FUNDS_LIMIT: f64 = 10_000.0;

/// Card payment operations. Every call is safe to repeat.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Places a hold for `amount` and returns the authorization id.
    async fn authorize(&self, payment_id: &str, amount: f64) -> Result<String, ServiceError>;

    /// Captures a held authorization and returns the capture id.
    async fn capture(&self, payment_id: &str, authorization_id: &str) -> Result<String, ServiceError>;

    /// Returns captured funds.
    async fn refund(&self, capture_id: &str) -> Result<(), ServiceError>;

    /// Releases a hold that was never captured.
    async fn void(&self, authorization_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug)]
struct GatewayState {
    /// Open holds by authorization id, with the payment they cover.
    authorizations: HashMap<String, (String, f64)>,
    /// Captures by capture id, with their authorization id.
    captures: HashMap<String, String>,
    /// Ids already issued per payment, so repeated calls return the same id.
    issued: HashMap<(String, &'static str), String>,
    refunded: Vec<String>,
    voided: Vec<String>,
    declined: u32,
    next_id: u32,
    funds_limit: f64,
}

impl Default for GatewayState {
    fn default() -> Self {
        Self {
            authorizations: HashMap::new(),
            captures: HashMap::new(),
            issued: HashMap::new(),
            refunded: Vec::new(),
            voided: Vec::new(),
            declined: 0,
            next_id: 0,
            funds_limit: DEFAULT_FUNDS_LIMIT,
        }
    }
}

impl GatewayState {
    fn issue(&mut self, payment_id: &str, prefix: &'static str) -> String {
        let key = (payment_id.to_string(), prefix);
        if let Some(id) = self.issued.get(&key) {
            return id.clone();
        }
        self.next_id += 1;
        let id = format!("{prefix}-{:04}", self.next_id);
        self.issued.insert(key, id.clone());
        id
    }
}

/// In-memory payment gateway for tests and the demo binary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines authorizations above `limit`.
    pub async fn set_funds_limit(&self, limit: f64) {
        self.state.lock().await.funds_limit = limit;
    }

    /// Holds placed and neither captured nor voided.
    pub async fn open_authorizations(&self) -> usize {
        let state = self.state.lock().await;
        state
            .authorizations
            .keys()
            .filter(|auth| !state.captures.values().any(|captured| captured == *auth))
            .count()
    }

    /// Captures not refunded.
    pub async fn capture_count(&self) -> usize {
        self.state.lock().await.captures.len()
    }

    pub async fn refunded(&self) -> Vec<String> {
        self.state.lock().await.refunded.clone()
    }

    pub async fn voided(&self) -> Vec<String> {
        self.state.lock().await.voided.clone()
    }

    /// Number of authorizations declined for lack of funds.
    pub async fn declined(&self) -> u32 {
        self.state.lock().await.declined
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn authorize(&self, payment_id: &str, amount: f64) -> Result<String, ServiceError> {
        let mut state = self.state.lock().await;
        if amount > state.funds_limit {
            state.declined += 1;
            return Err(ServiceError::InsufficientFunds { amount });
        }

        let authorization_id = state.issue(payment_id, "AUTH");
        state
            .authorizations
            .insert(authorization_id.clone(), (payment_id.to_string(), amount));
        Ok(authorization_id)
    }

    async fn capture(&self, payment_id: &str, authorization_id: &str) -> Result<String, ServiceError> {
        let mut state = self.state.lock().await;
        if !state.authorizations.contains_key(authorization_id) {
            return Err(ServiceError::MissingAuthorization {
                payment_id: payment_id.to_string(),
            });
        }

        let capture_id = state.issue(payment_id, "CAP");
        state
            .captures
            .insert(capture_id.clone(), authorization_id.to_string());
        Ok(capture_id)
    }

    async fn refund(&self, capture_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if let Some(authorization_id) = state.captures.remove(capture_id) {
            state.authorizations.remove(&authorization_id);
            state.refunded.push(capture_id.to_string());
        }
        Ok(())
    }

    async fn void(&self, authorization_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if state.authorizations.remove(authorization_id).is_some() {
            state.voided.push(authorization_id.to_string());
        }
        Ok(())
    }
}
