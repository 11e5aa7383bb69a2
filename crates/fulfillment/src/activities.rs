//! The order saga's activities and their registration with a runtime.
//!
//! Each activity decodes its input record, consumes any scripted fault,
//! calls one service and returns the updated record.

use std::future::Future;

use common::ActivityError;
use runtime::{ActivityContext, RuntimeBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{INVALID_INPUT, ServiceError};
use crate::models::{
    InventoryReservation, NotificationRequest, Order, PaymentInfo, payment_status,
};
use crate::services::{Faults, Services};

pub const VALIDATE_ORDER: &str = "ValidateOrder";
pub const RESERVE_INVENTORY: &str = "ReserveInventory";
pub const COMPENSATE_INVENTORY: &str = "CompensateInventory";
pub const SEND_NOTIFICATION: &str = "SendNotification";
pub const AUTHORIZE_PAYMENT: &str = "AuthorizePayment";
pub const CAPTURE_PAYMENT: &str = "CapturePayment";
pub const REFUND_PAYMENT: &str = "RefundPayment";
pub const VOID_AUTHORIZATION: &str = "VoidAuthorization";

/// Rejects orders without a customer, without items or with a non-positive total.
pub fn validate_order(order: &Order) -> Result<(), ServiceError> {
    if order.customer_id.trim().is_empty() {
        return Err(ServiceError::InvalidOrder("customer ID is required".into()));
    }
    if order.items.is_empty() {
        return Err(ServiceError::InvalidOrder("no items in order".into()));
    }
    if order.total_amount <= 0.0 {
        return Err(ServiceError::InvalidOrder("invalid total amount".into()));
    }
    Ok(())
}

/// Registers every activity of the order saga on `builder`.
pub fn register(builder: RuntimeBuilder, services: &Services) -> RuntimeBuilder {
    let faults = &services.faults;

    let builder = typed(builder, VALIDATE_ORDER, faults, |order: Order| async move {
        validate_order(&order)?;
        info!(order_id = %order.order_id, "order validated");
        Ok::<_, ServiceError>(order)
    });

    let inventory = services.inventory.clone();
    let builder = typed(builder, RESERVE_INVENTORY, faults, move |order: Order| {
        let inventory = inventory.clone();
        async move {
            let reservation_id = inventory.reserve(&order.order_id, &order.items).await?;
            info!(order_id = %order.order_id, %reservation_id, "inventory reserved");
            Ok::<_, ServiceError>(InventoryReservation {
                reservation_id,
                order_id: order.order_id,
                items: order.items,
                status: "reserved".to_string(),
            })
        }
    });

    let inventory = services.inventory.clone();
    let builder = typed(
        builder,
        COMPENSATE_INVENTORY,
        faults,
        move |mut reservation: InventoryReservation| {
            let inventory = inventory.clone();
            async move {
                inventory.release(&reservation.reservation_id).await?;
                info!(reservation_id = %reservation.reservation_id, "inventory released");
                reservation.status = "released".to_string();
                Ok::<_, ServiceError>(reservation)
            }
        },
    );

    let notifier = services.notifier.clone();
    let builder = typed(
        builder,
        SEND_NOTIFICATION,
        faults,
        move |request: NotificationRequest| {
            let notifier = notifier.clone();
            async move {
                notifier.send(&request).await?;
                info!(order_id = %request.order_id, message_type = %request.message_type, "notification sent");
                Ok::<_, ServiceError>(())
            }
        },
    );

    let payments = services.payments.clone();
    let builder = typed(builder, AUTHORIZE_PAYMENT, faults, move |mut payment: PaymentInfo| {
        let payments = payments.clone();
        async move {
            let authorization_id = payments
                .authorize(&payment.payment_id, payment.amount)
                .await?;
            info!(payment_id = %payment.payment_id, %authorization_id, "payment authorized");
            payment.authorization_id = Some(authorization_id);
            payment.status = payment_status::AUTHORIZED.to_string();
            Ok::<_, ServiceError>(payment)
        }
    });

    let payments = services.payments.clone();
    let builder = typed(builder, CAPTURE_PAYMENT, faults, move |mut payment: PaymentInfo| {
        let payments = payments.clone();
        async move {
            let authorization_id = payment.authorization_id.clone().ok_or_else(|| {
                ServiceError::MissingAuthorization {
                    payment_id: payment.payment_id.clone(),
                }
            })?;
            let capture_id = payments
                .capture(&payment.payment_id, &authorization_id)
                .await?;
            info!(payment_id = %payment.payment_id, %capture_id, "payment captured");
            payment.capture_id = Some(capture_id);
            payment.status = payment_status::CAPTURED.to_string();
            Ok::<_, ServiceError>(payment)
        }
    });

    let payments = services.payments.clone();
    let builder = typed(builder, REFUND_PAYMENT, faults, move |mut payment: PaymentInfo| {
        let payments = payments.clone();
        async move {
            match payment.capture_id.as_deref() {
                Some(capture_id) => {
                    payments.refund(capture_id).await?;
                    info!(payment_id = %payment.payment_id, capture_id, "payment refunded");
                    payment.status = payment_status::REFUNDED.to_string();
                }
                None => debug!(payment_id = %payment.payment_id, "nothing captured, skipping refund"),
            }
            Ok::<_, ServiceError>(payment)
        }
    });

    let payments = services.payments.clone();
    typed(builder, VOID_AUTHORIZATION, faults, move |mut payment: PaymentInfo| {
        let payments = payments.clone();
        async move {
            match payment.authorization_id.as_deref() {
                Some(authorization_id) => {
                    payments.void(authorization_id).await?;
                    info!(payment_id = %payment.payment_id, authorization_id, "authorization voided");
                    payment.status = payment_status::VOIDED.to_string();
                }
                None => debug!(payment_id = %payment.payment_id, "nothing authorized, skipping void"),
            }
            Ok::<_, ServiceError>(payment)
        }
    })
}

/// Registers `f` under `name`, decoding its input and encoding its output.
fn typed<T, R, F, Fut>(builder: RuntimeBuilder, name: &'static str, faults: &Faults, f: F) -> RuntimeBuilder
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
{
    let faults = faults.clone();
    builder.activity_fn(name, move |ctx: ActivityContext, input: Value| {
        let f = f.clone();
        let faults = faults.clone();
        async move {
            metrics::counter!("order_activity_attempts_total", "activity" => name).increment(1);
            faults.check(name).await.inspect_err(|err| {
                debug!(activity = name, attempt = ctx.attempt(), error = %err, "injected fault");
            })?;
            let input: T = serde_json::from_value(input).map_err(|err| {
                ActivityError::permanent(INVALID_INPUT, format!("{name} input: {err}"))
            })?;
            let output = f(input).await?;
            let output = serde_json::to_value(output).map_err(|err| {
                ActivityError::permanent(INVALID_INPUT, format!("{name} output: {err}"))
            })?;
            Ok::<_, ActivityError>(output)
        }
    })
}
