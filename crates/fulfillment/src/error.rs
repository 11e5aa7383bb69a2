//! Business errors raised by the order saga's services.

use common::ActivityError;
use thiserror::Error;

pub const INVALID_ORDER: &str = "INVALID_ORDER";
pub const INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";
pub const OUT_OF_STOCK: &str = "OUT_OF_STOCK";
pub const MISSING_AUTHORIZATION: &str = "MISSING_AUTHORIZATION";
/// Activity input that does not decode into the expected record.
pub const INVALID_INPUT: &str = "INVALID_INPUT";

/// Errors from the payment, inventory and notification services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("insufficient funds for amount {amount:.2}")]
    InsufficientFunds { amount: f64 },

    #[error("product {product_id} is out of stock")]
    OutOfStock { product_id: String },

    #[error("cannot capture payment {payment_id}: no authorization")]
    MissingAuthorization { payment_id: String },

    /// A transient outage; the attempt may succeed when retried.
    #[error("{0} unavailable")]
    Unavailable(String),
}

impl From<ServiceError> for ActivityError {
    fn from(err: ServiceError) -> Self {
        let kind = match &err {
            ServiceError::InvalidOrder(_) => INVALID_ORDER,
            ServiceError::InsufficientFunds { .. } => INSUFFICIENT_FUNDS,
            ServiceError::OutOfStock { .. } => OUT_OF_STOCK,
            ServiceError::MissingAuthorization { .. } => MISSING_AUTHORIZATION,
            ServiceError::Unavailable(_) => return ActivityError::transient(err.to_string()),
        };
        ActivityError::permanent(kind, err.to_string())
    }
}
