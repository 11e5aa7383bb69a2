//! Order, payment, reservation and notification records exchanged between
//! the order saga's workflows and activities.

use serde::{Deserialize, Serialize};

/// Order statuses, as reported in results and failure details.
pub mod order_status {
    pub const PROCESSING: &str = "processing";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const PAYMENT_FAILED: &str = "payment_failed";
    pub const INVENTORY_FAILED: &str = "inventory_failed";
    pub const COMPLETED: &str = "completed";
}

/// Payment statuses.
pub mod payment_status {
    pub const PENDING: &str = "pending";
    pub const AUTHORIZED: &str = "authorized";
    pub const CAPTURED: &str = "captured";
    pub const AUTHORIZATION_FAILED: &str = "authorization_failed";
    pub const CAPTURE_FAILED: &str = "capture_failed";
    pub const REFUNDED: &str = "refunded";
    pub const VOIDED: &str = "voided";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub price: f64,
}

impl OrderItem {
    pub fn new(product_id: impl Into<String>, quantity: u32, price: f64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub total_amount: f64,
    #[serde(default)]
    pub status: String,
}

impl Order {
    /// Builds an order whose total is the sum of its line items.
    pub fn new(order_id: impl Into<String>, customer_id: impl Into<String>, items: Vec<OrderItem>) -> Self {
        let total_amount = items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum::<f64>();
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            items,
            total_amount: (total_amount * 100.0).round() / 100.0,
            status: String::new(),
        }
    }

    /// The demo order started by the binary: two products, 109.97 in total.
    pub fn sample(order_id: impl Into<String>) -> Self {
        Self::new(
            order_id,
            "customer-123",
            vec![
                OrderItem::new("prod-001", 2, 29.99),
                OrderItem::new("prod-002", 1, 49.99),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub payment_id: String,
    pub order_id: String,
    pub amount: f64,
    pub payment_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
    pub status: String,
}

impl PaymentInfo {
    /// A not yet authorized card payment covering `order`.
    pub fn for_order(order: &Order) -> Self {
        Self {
            payment_id: format!("pay-{}", order.order_id),
            order_id: order.order_id.clone(),
            amount: order.total_amount,
            payment_method: "credit_card".to_string(),
            authorization_id: None,
            capture_id: None,
            status: payment_status::PENDING.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReservation {
    pub reservation_id: String,
    pub order_id: String,
    pub items: Vec<OrderItem>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub order_id: String,
    pub customer_id: String,
    pub message_type: String,
    pub message: String,
}

impl NotificationRequest {
    pub fn confirmation(order: &Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            customer_id: order.customer_id.clone(),
            message_type: "order_confirmation".to_string(),
            message: format!("Your order {} has been confirmed!", order.order_id),
        }
    }
}

/// What a completed order workflow returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: String,
    pub payment: PaymentInfo,
    pub reservation_id: String,
    /// False when the confirmation could not be sent; the order still completes.
    pub notified: bool,
}
