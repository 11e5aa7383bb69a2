//! Order-processing saga hosted on the workflow engine.
//!
//! An order is validated, paid for through a child workflow, reserved in
//! inventory and confirmed to the customer:
//!
//! ```text
//! OrderWorkflow
//!   ValidateOrder
//!   PaymentWorkflow (child)        undo: RefundPayment
//!     AuthorizePayment             undo: VoidAuthorization
//!     CapturePayment
//!   ReserveInventory               undo: CompensateInventory
//!   SendNotification               best effort
//! ```
//!
//! Services are in memory, with scripted outages through [`Faults`].

pub mod activities;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod workflows;

use runtime::RuntimeBuilder;

pub use config::{Config, LogFormat};
pub use error::ServiceError;
pub use models::{InventoryReservation, NotificationRequest, Order, OrderItem, OrderResult, PaymentInfo};
pub use services::{Faults, Services};
pub use workflows::{
    ORDER_TASK_QUEUE, ORDER_WORKFLOW, OrderPolicies, OrderWorkflow, PAYMENT_WORKFLOW,
    PaymentPolicies, PaymentWorkflow, QUERY_ORDER_STATUS, order_start_options,
};

/// Registers both workflows with default policies, and every activity.
pub fn install(builder: RuntimeBuilder, services: &Services) -> RuntimeBuilder {
    install_with_policies(builder, services, OrderPolicies::default(), PaymentPolicies::default())
}

pub fn install_with_policies(
    builder: RuntimeBuilder,
    services: &Services,
    order: OrderPolicies,
    payment: PaymentPolicies,
) -> RuntimeBuilder {
    let builder = builder
        .workflow(OrderWorkflow::new(order))
        .workflow(PaymentWorkflow::new(payment));
    activities::register(builder, services)
}
