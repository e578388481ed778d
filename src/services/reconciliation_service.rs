//! Reconciliation of asynchronous gateway outcomes against payment records.
//!
//! Webhooks may arrive late, duplicated, out of order, or never; the
//! protocol here is verify, record durably, then apply idempotently through
//! the order engine. The periodic sweep resolves payments whose webhook never
//! came.

use std::time::Duration;

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use utoipa::ToSchema;

use crate::{
    dto::{
        orders::WebhookEventList,
        webhooks::{PaymentWebhook, WebhookAck},
    },
    entity::{
        orders::{Column as OrderCol, Entity as Orders},
        payments::{Column as PaymentCol, Entity as Payments},
        webhook_events::{
            ActiveModel as EventActive, Column as EventCol, Entity as WebhookEvents,
            Model as EventModel,
        },
    },
    error::{AppError, AppResult},
    gateway::GatewayPaymentStatus,
    middleware::auth::{Actor, ensure_admin},
    models::WebhookEvent,
    response::{ApiResponse, Meta},
    routes::admin::WebhookEventQuery,
    services::order_service::{self, PaymentApplyOutcome, PaymentOutcome},
    state::AppState,
    status::{OrderStatus, PaymentStatus},
};

pub const OUTCOME_RECEIVED: &str = "received";
pub const OUTCOME_APPLIED: &str = "applied";
pub const OUTCOME_DUPLICATE: &str = "duplicate";
pub const OUTCOME_ORPHAN: &str = "orphan";
pub const OUTCOME_ANOMALY: &str = "anomaly";
pub const OUTCOME_ERROR: &str = "error";

/// Process one inbound gateway webhook.
///
/// An unverifiable payload is rejected with no state change so the caller
/// returns an HTTP error. Everything verified is recorded durably before any
/// business state moves, and acknowledged afterwards even when the outcome is
/// an orphan or an anomaly, so the gateway stops retrying.
pub async fn handle_webhook(
    state: &AppState,
    raw_payload: &[u8],
    signature: Option<&str>,
) -> AppResult<ApiResponse<WebhookAck>> {
    let signature = signature.ok_or(AppError::InvalidSignature)?;
    if !state.gateway.verify_signature(raw_payload, signature) {
        tracing::warn!("dropping webhook with invalid signature");
        return Err(AppError::InvalidSignature);
    }

    let webhook: PaymentWebhook = serde_json::from_slice(raw_payload)
        .map_err(|e| AppError::BadRequest(format!("Malformed webhook payload: {e}")))?;
    let raw_value: Value =
        serde_json::from_slice(raw_payload).unwrap_or(Value::Null);

    let payment = Payments::find()
        .filter(PaymentCol::ExternalTransactionId.eq(webhook.external_transaction_id.clone()))
        .one(&state.orm)
        .await?;

    // Durable record first; only after this insert succeeds is the event
    // acknowledged to the gateway.
    let event = EventActive {
        id: Set(uuid::Uuid::new_v4()),
        external_transaction_id: Set(webhook.external_transaction_id.clone()),
        payment_id: Set(payment.as_ref().map(|p| p.id)),
        raw_payload: Set(raw_value.clone()),
        outcome: Set(OUTCOME_RECEIVED.to_string()),
        detail: Set(None),
        received_at: NotSet,
        processed_at: Set(None),
    }
    .insert(&state.orm)
    .await?;

    let Some(payment) = payment else {
        tracing::warn!(
            external_transaction_id = %webhook.external_transaction_id,
            "orphan webhook: no matching payment"
        );
        finalize_event(state, event, OUTCOME_ORPHAN, Some("no matching payment".into())).await?;
        return Ok(ack(OUTCOME_ORPHAN));
    };

    if webhook.amount != payment.amount || webhook.currency != payment.currency {
        let detail = format!(
            "amount mismatch: webhook {} {} vs payment {} {}",
            webhook.amount, webhook.currency, payment.amount, payment.currency
        );
        tracing::error!(
            payment_id = %payment.id,
            external_transaction_id = %webhook.external_transaction_id,
            %detail,
            "webhook amount mismatch, escalating for manual review"
        );
        finalize_event(state, event, OUTCOME_ANOMALY, Some(detail)).await?;
        return Ok(ack(OUTCOME_ANOMALY));
    }

    let Some(outcome) = map_gateway_status(&webhook.status) else {
        let detail = format!("unrecognized gateway status {:?}", webhook.status);
        finalize_event(state, event, OUTCOME_ANOMALY, Some(detail)).await?;
        return Ok(ack(OUTCOME_ANOMALY));
    };

    match order_service::apply_payment_result(
        state,
        &webhook.external_transaction_id,
        outcome,
        Some(raw_value),
    )
    .await
    {
        Ok(PaymentApplyOutcome::Applied) => {
            finalize_event(state, event, OUTCOME_APPLIED, None).await?;
            Ok(ack(OUTCOME_APPLIED))
        }
        Ok(PaymentApplyOutcome::Duplicate) => {
            tracing::info!(
                external_transaction_id = %webhook.external_transaction_id,
                "duplicate webhook, no-op"
            );
            finalize_event(state, event, OUTCOME_DUPLICATE, None).await?;
            Ok(ack(OUTCOME_DUPLICATE))
        }
        Ok(PaymentApplyOutcome::Ignored(reason)) => {
            tracing::warn!(
                external_transaction_id = %webhook.external_transaction_id,
                %reason,
                "webhook ignored as anomaly"
            );
            finalize_event(state, event, OUTCOME_ANOMALY, Some(reason)).await?;
            Ok(ack(OUTCOME_ANOMALY))
        }
        Err(AppError::NotFound) => {
            finalize_event(state, event, OUTCOME_ORPHAN, Some("payment disappeared".into()))
                .await?;
            Ok(ack(OUTCOME_ORPHAN))
        }
        Err(err) => {
            // Recorded but not applied; surface a server error so the gateway
            // redelivers and the next attempt retries the application.
            if let Err(update_err) =
                finalize_event(state, event, OUTCOME_ERROR, Some(err.to_string())).await
            {
                tracing::error!(error = %update_err, "failed to mark webhook event as errored");
            }
            Err(err)
        }
    }
}

fn ack(outcome: &str) -> ApiResponse<WebhookAck> {
    ApiResponse::success(
        "Acknowledged",
        WebhookAck {
            received: true,
            outcome: outcome.to_string(),
        },
        Some(Meta::empty()),
    )
}

fn map_gateway_status(status: &str) -> Option<PaymentOutcome> {
    match status {
        "completed" | "success" => Some(PaymentOutcome::Completed),
        "failed" | "cancelled" | "expired" => Some(PaymentOutcome::Failed),
        _ => None,
    }
}

async fn finalize_event(
    state: &AppState,
    event: EventModel,
    outcome: &str,
    detail: Option<String>,
) -> AppResult<EventModel> {
    let mut active: EventActive = event.into();
    active.outcome = Set(outcome.to_string());
    active.detail = Set(detail);
    active.processed_at = Set(Some(Utc::now().into()));
    Ok(active.update(&state.orm).await?)
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub stale_orders_cancelled: usize,
}

/// Resolve payments stuck in `pending`/`processing` past the configured
/// timeout. The gateway is asked for the final status first; anything it does
/// not report as completed is settled as failed, and any later webhook for it
/// lands as an anomaly.
pub async fn run_pending_sweep(state: &AppState) -> AppResult<SweepReport> {
    let cutoff =
        Utc::now() - chrono::Duration::minutes(state.config.payment_pending_timeout_minutes);
    let mut report = SweepReport::default();

    let stale = Payments::find()
        .filter(PaymentCol::Status.is_in([
            PaymentStatus::Pending.as_str(),
            PaymentStatus::Processing.as_str(),
        ]))
        .filter(PaymentCol::InitiatedAt.lt(cutoff))
        .order_by_asc(PaymentCol::InitiatedAt)
        .limit(100)
        .all(&state.orm)
        .await?;

    for payment in stale {
        report.examined += 1;
        match payment.external_transaction_id.as_deref() {
            Some(external_id) => match state.gateway.query_status(external_id).await {
                Ok(GatewayPaymentStatus::Completed) => {
                    match order_service::apply_payment_result(
                        state,
                        external_id,
                        PaymentOutcome::Completed,
                        None,
                    )
                    .await
                    {
                        Ok(PaymentApplyOutcome::Applied) => report.completed += 1,
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(payment_id = %payment.id, error = %err, "sweep apply failed");
                        }
                    }
                }
                Ok(GatewayPaymentStatus::Failed | GatewayPaymentStatus::Pending) => {
                    // Still pending at the gateway past the timeout: settle as
                    // failed so the order never sits in pending forever.
                    match order_service::apply_payment_result(
                        state,
                        external_id,
                        PaymentOutcome::Failed,
                        None,
                    )
                    .await
                    {
                        Ok(PaymentApplyOutcome::Applied) => report.failed += 1,
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(payment_id = %payment.id, error = %err, "sweep apply failed");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        payment_id = %payment.id,
                        error = %err,
                        "gateway unreachable during sweep, retrying next round"
                    );
                }
            },
            None => {
                match order_service::fail_payment(
                    state,
                    payment.id,
                    "payment initiation never completed",
                )
                .await
                {
                    Ok(PaymentApplyOutcome::Applied) => report.failed += 1,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(payment_id = %payment.id, error = %err, "sweep fail-payment failed");
                    }
                }
            }
        }
    }

    // Orders left pending after their payment settled as failed (e.g. an
    // initiation that was rejected and never retried).
    let stale_orders = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::Status.eq(OrderStatus::Pending.as_str()))
                .add(OrderCol::PaymentStatus.eq(PaymentStatus::Failed.as_str()))
                .add(OrderCol::UpdatedAt.lt(cutoff)),
        )
        .limit(100)
        .all(&state.orm)
        .await?;

    for order in stale_orders {
        match order_service::cancel_stale_order(state, order.id, "payment timed out").await {
            Ok(true) => report.stale_orders_cancelled += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(order_id = %order.id, error = %err, "stale order cancellation failed");
            }
        }
    }

    Ok(report)
}

/// Background loop driving [`run_pending_sweep`].
pub fn spawn_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(state.config.sweep_interval_seconds));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match run_pending_sweep(&state).await {
                Ok(report) if report.examined > 0 || report.stale_orders_cancelled > 0 => {
                    tracing::info!(
                        examined = report.examined,
                        completed = report.completed,
                        failed = report.failed,
                        stale_orders_cancelled = report.stale_orders_cancelled,
                        "reconciliation sweep finished"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "reconciliation sweep failed");
                }
            }
        }
    })
}

pub async fn list_events(
    state: &AppState,
    actor: &Actor,
    query: WebhookEventQuery,
) -> AppResult<ApiResponse<WebhookEventList>> {
    ensure_admin(actor)?;
    let (page, limit, offset) = query.pagination.normalize();

    let mut condition = Condition::all();
    if let Some(outcome) = query.outcome.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(EventCol::Outcome.eq(outcome.clone()));
    }

    let finder = WebhookEvents::find()
        .filter(condition)
        .order_by_desc(EventCol::ReceivedAt);

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(event_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Webhook events",
        WebhookEventList { items },
        Some(meta),
    ))
}

fn event_from_entity(model: EventModel) -> WebhookEvent {
    WebhookEvent {
        id: model.id,
        external_transaction_id: model.external_transaction_id,
        payment_id: model.payment_id,
        outcome: model.outcome,
        detail: model.detail,
        received_at: model.received_at.with_timezone(&Utc),
        processed_at: model.processed_at.map(|dt| dt.with_timezone(&Utc)),
    }
}
