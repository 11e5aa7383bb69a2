//! The order workflow and its payment child workflow.

use std::task::{Poll, ready};
use std::time::Duration;

use common::RetryPolicy;
use runtime::StartWorkflowOptions;
use serde_json::json;
use workflow::{
    ActivityOptions, ChildWorkflowOptions, CompensationSpec, ParentClosePolicy, WorkflowContext,
    WorkflowDefinition, WorkflowFailure, WorkflowResult,
};

use crate::activities::{
    AUTHORIZE_PAYMENT, CAPTURE_PAYMENT, COMPENSATE_INVENTORY, REFUND_PAYMENT, RESERVE_INVENTORY,
    SEND_NOTIFICATION, VALIDATE_ORDER, VOID_AUTHORIZATION,
};
use crate::error::{INSUFFICIENT_FUNDS, INVALID_ORDER, OUT_OF_STOCK};
use crate::models::{
    InventoryReservation, NotificationRequest, Order, OrderResult, PaymentInfo, order_status,
    payment_status,
};

pub const ORDER_WORKFLOW: &str = "OrderWorkflow";
pub const PAYMENT_WORKFLOW: &str = "PaymentWorkflow";

/// Queue every activity of the saga runs on.
pub const ORDER_TASK_QUEUE: &str = "order-processing-queue";

/// Query answered with the order's current status.
pub const QUERY_ORDER_STATUS: &str = "order_status";

/// Start options for an order: workflow id `order-workflow-<order id>`,
/// three runs at most and a ten minute deadline. Business failures end the
/// execution on the first run.
pub fn order_start_options(order: &Order) -> StartWorkflowOptions {
    StartWorkflowOptions::new(format!("order-workflow-{}", order.order_id))
        .retry_policy(
            RetryPolicy::new(3)
                .with_initial_interval(Duration::from_secs(2))
                .with_maximum_interval(Duration::from_secs(60))
                .non_retryable(INVALID_ORDER)
                .non_retryable(INSUFFICIENT_FUNDS)
                .non_retryable(OUT_OF_STOCK),
        )
        .execution_timeout(Duration::from_secs(600))
}

/// Retry and timeout settings of [`OrderWorkflow`].
#[derive(Debug, Clone)]
pub struct OrderPolicies {
    /// Validation and inventory reservation.
    pub activity_retry: RetryPolicy,
    pub start_to_close: Duration,
    pub schedule_to_close: Duration,
    /// Workflow-level retry of the payment child.
    pub payment_retry: RetryPolicy,
    pub payment_timeout: Duration,
    pub notification_retry: RetryPolicy,
    pub notification_timeout: Duration,
    /// Applies to the refund and the inventory release.
    pub compensation_retry: RetryPolicy,
}

impl Default for OrderPolicies {
    fn default() -> Self {
        Self {
            activity_retry: RetryPolicy::new(5)
                .with_initial_interval(Duration::from_secs(1))
                .with_maximum_interval(Duration::from_secs(30)),
            start_to_close: Duration::from_secs(30),
            schedule_to_close: Duration::from_secs(60),
            payment_retry: RetryPolicy::new(3)
                .with_initial_interval(Duration::from_secs(2))
                .with_maximum_interval(Duration::from_secs(60))
                .non_retryable(INSUFFICIENT_FUNDS),
            payment_timeout: Duration::from_secs(300),
            notification_retry: RetryPolicy::new(3).with_initial_interval(Duration::from_secs(1)),
            notification_timeout: Duration::from_secs(20),
            compensation_retry: RetryPolicy::compensation(),
        }
    }
}

impl OrderPolicies {
    /// Starts every backoff at `interval`.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        for policy in [
            &mut self.activity_retry,
            &mut self.payment_retry,
            &mut self.notification_retry,
            &mut self.compensation_retry,
        ] {
            policy.initial_interval = interval;
        }
        self
    }

    fn activity(&self) -> ActivityOptions {
        ActivityOptions::new()
            .task_queue(ORDER_TASK_QUEUE)
            .retry_policy(self.activity_retry.clone())
            .start_to_close_timeout(self.start_to_close)
            .schedule_to_close_timeout(self.schedule_to_close)
    }
}

/// Validates an order, takes payment through [`PaymentWorkflow`], reserves
/// stock and confirms to the customer.
///
/// A failed reservation refunds the payment. The confirmation is best
/// effort: the order completes even when it cannot be sent.
#[derive(Debug, Clone, Default)]
pub struct OrderWorkflow {
    policies: OrderPolicies,
}

impl OrderWorkflow {
    pub fn new(policies: OrderPolicies) -> Self {
        Self { policies }
    }
}

impl WorkflowDefinition for OrderWorkflow {
    fn name(&self) -> &str {
        ORDER_WORKFLOW
    }

    fn execute(&self, ctx: &mut WorkflowContext<'_>) -> Poll<WorkflowResult> {
        let policies = &self.policies;
        let mut order: Order = ctx.input_as()?;
        order.status = order_status::PROCESSING.to_string();
        ctx.expose(QUERY_ORDER_STATUS, json!(order.status));

        let validated = ready!(ctx.activity(VALIDATE_ORDER, serde_json::to_value(&order)?, policies.activity()));
        if let Err(failure) = validated {
            return Poll::Ready(Err(failed(ctx, failure, order_status::VALIDATION_FAILED)));
        }

        let payment = PaymentInfo::for_order(&order);
        let paid = ready!(ctx.child_workflow_with_compensation(
            PAYMENT_WORKFLOW,
            format!("payment-{}", order.order_id),
            serde_json::to_value(&payment)?,
            ChildWorkflowOptions::new()
                .retry_policy(policies.payment_retry.clone())
                .parent_close_policy(ParentClosePolicy::Terminate)
                .execution_timeout(policies.payment_timeout),
            CompensationSpec::new(REFUND_PAYMENT)
                .with_result()
                .retry_policy(policies.compensation_retry.clone())
                .task_queue(ORDER_TASK_QUEUE),
        ));
        let payment: PaymentInfo = match paid {
            Ok(payment) => serde_json::from_value(payment)?,
            Err(failure) => return Poll::Ready(Err(failed(ctx, failure, order_status::PAYMENT_FAILED))),
        };

        let reserved = ready!(ctx.activity_with_compensation(
            RESERVE_INVENTORY,
            serde_json::to_value(&order)?,
            policies.activity(),
            CompensationSpec::new(COMPENSATE_INVENTORY)
                .with_result()
                .retry_policy(policies.compensation_retry.clone()),
        ));
        let reservation: InventoryReservation = match reserved {
            Ok(reservation) => serde_json::from_value(reservation)?,
            Err(failure) => return Poll::Ready(Err(failed(ctx, failure, order_status::INVENTORY_FAILED))),
        };

        let notified = ready!(ctx.activity(
            SEND_NOTIFICATION,
            serde_json::to_value(NotificationRequest::confirmation(&order))?,
            ActivityOptions::new()
                .task_queue(ORDER_TASK_QUEUE)
                .retry_policy(policies.notification_retry.clone())
                .start_to_close_timeout(policies.notification_timeout),
        ))
        .is_ok();

        order.status = order_status::COMPLETED.to_string();
        ctx.expose(QUERY_ORDER_STATUS, json!(order.status));
        Poll::Ready(Ok(serde_json::to_value(OrderResult {
            order_id: order.order_id,
            status: order.status,
            payment,
            reservation_id: reservation.reservation_id,
            notified,
        })?))
    }
}

/// Retry and timeout settings of [`PaymentWorkflow`].
#[derive(Debug, Clone)]
pub struct PaymentPolicies {
    pub activity_retry: RetryPolicy,
    pub start_to_close: Duration,
    pub schedule_to_close: Duration,
    pub void_retry: RetryPolicy,
}

impl Default for PaymentPolicies {
    fn default() -> Self {
        Self {
            activity_retry: RetryPolicy::new(5)
                .with_initial_interval(Duration::from_secs(1))
                .with_maximum_interval(Duration::from_secs(10))
                .non_retryable(INSUFFICIENT_FUNDS),
            start_to_close: Duration::from_secs(30),
            schedule_to_close: Duration::from_secs(60),
            void_retry: RetryPolicy::compensation(),
        }
    }
}

impl PaymentPolicies {
    /// Starts every backoff at `interval`.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.activity_retry.initial_interval = interval;
        self.void_retry.initial_interval = interval;
        self
    }
}

/// Authorizes then captures a card payment. A failed capture voids the
/// authorization.
#[derive(Debug, Clone, Default)]
pub struct PaymentWorkflow {
    policies: PaymentPolicies,
}

impl PaymentWorkflow {
    pub fn new(policies: PaymentPolicies) -> Self {
        Self { policies }
    }

    fn activity(&self) -> ActivityOptions {
        ActivityOptions::new()
            .task_queue(ORDER_TASK_QUEUE)
            .retry_policy(self.policies.activity_retry.clone())
            .start_to_close_timeout(self.policies.start_to_close)
            .schedule_to_close_timeout(self.policies.schedule_to_close)
    }
}

impl WorkflowDefinition for PaymentWorkflow {
    fn name(&self) -> &str {
        PAYMENT_WORKFLOW
    }

    fn execute(&self, ctx: &mut WorkflowContext<'_>) -> Poll<WorkflowResult> {
        let payment: PaymentInfo = ctx.input_as()?;

        let authorized = ready!(ctx.activity_with_compensation(
            AUTHORIZE_PAYMENT,
            serde_json::to_value(&payment)?,
            self.activity(),
            CompensationSpec::new(VOID_AUTHORIZATION)
                .with_result()
                .retry_policy(self.policies.void_retry.clone()),
        ));
        let payment = match authorized {
            Ok(payment) => payment,
            Err(failure) => {
                return Poll::Ready(Err(failed(ctx, failure, payment_status::AUTHORIZATION_FAILED)));
            }
        };

        match ready!(ctx.activity(CAPTURE_PAYMENT, payment, self.activity())) {
            Ok(captured) => Poll::Ready(Ok(captured)),
            Err(failure) => Poll::Ready(Err(failed(ctx, failure, payment_status::CAPTURE_FAILED))),
        }
    }
}

/// Tags a failure with the business status the caller sees.
fn failed(ctx: &mut WorkflowContext<'_>, failure: impl Into<WorkflowFailure>, status: &str) -> WorkflowFailure {
    ctx.expose(QUERY_ORDER_STATUS, json!(status));
    failure.into().with_details(json!({ "status": status }))
}
