//! The order engine. Owns every write to `Order.status` and
//! `Order.payment_status`; the delivery engine and the reconciliation worker
//! go through the entry points here instead of touching order rows directly.
//!
//! Row locks are always taken in the fixed order `orders` -> `payments` ->
//! `products`, on every path that holds more than one.

use std::time::Duration;

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseTransaction, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    config::AppConfig,
    dto::orders::{
        AdvanceStatusRequest, CancelOrderRequest, CreateOrderRequest, OrderDetail, OrderList,
    },
    entity::{
        deliveries::{Column as DeliveryCol, Entity as Deliveries},
        delivery_locations::{Column as LocationCol, Entity as DeliveryLocations},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{
            ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel,
        },
        payments::{
            ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments,
            Model as PaymentModel,
        },
    },
    error::{AppError, AppResult},
    gateway::{GatewayError, InitiateRequest},
    middleware::auth::{Actor, ensure_admin},
    models::{Order, OrderItem, Payment},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    services::{delivery_service, inventory_service},
    state::AppState,
    status::{OrderStatus, PaymentStatus},
};

pub const CURRENCY: &str = "TZS";
pub const METHOD_CASH_ON_DELIVERY: &str = "cash_on_delivery";

const SUPPORTED_METHODS: [&str; 3] = ["mobile_money", "card", METHOD_CASH_ON_DELIVERY];

const MAX_INITIATE_ATTEMPTS: u32 = 3;
const INITIATE_BACKOFF: Duration = Duration::from_millis(500);

/// Final payment outcome as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Completed,
    Failed,
}

/// What applying an outcome actually did. Reapplying the same outcome is a
/// `Duplicate`, a conflicting outcome after settlement is `Ignored`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentApplyOutcome {
    Applied,
    Duplicate,
    Ignored(String),
}

pub async fn create_order(
    state: &AppState,
    actor: &Actor,
    payload: CreateOrderRequest,
) -> AppResult<ApiResponse<OrderDetail>> {
    validate_create(&payload)?;

    // Merge duplicate products and fix the lock order.
    let mut requested: Vec<(Uuid, i32)> = Vec::new();
    for item in &payload.items {
        match requested.iter_mut().find(|(id, _)| *id == item.product_id) {
            Some((_, qty)) => *qty += item.quantity,
            None => requested.push((item.product_id, item.quantity)),
        }
    }
    requested.sort_by_key(|(id, _)| *id);

    let txn = state.orm.begin().await?;

    let mut line: Vec<(crate::entity::products::Model, i32)> = Vec::new();
    let mut subtotal: i64 = 0;
    for (product_id, quantity) in &requested {
        let product = inventory_service::lock_product(&txn, *product_id).await?;
        if product.stock < *quantity {
            return Err(AppError::InsufficientStock {
                product_id: product.id,
            });
        }
        subtotal += product.price * (*quantity as i64);
        line.push((product, *quantity));
    }

    let delivery_fee = delivery_fee_for(subtotal, &state.config);
    let tax: i64 = 0;
    let discount: i64 = 0;
    // Computed once here, snapshotted, never recomputed.
    let total_amount = subtotal + delivery_fee + tax - discount;

    let is_cod = payload.payment_method == METHOD_CASH_ON_DELIVERY;
    let now = Utc::now();
    let order_id = Uuid::new_v4();

    let order = OrderActive {
        id: Set(order_id),
        order_number: Set(build_order_number(order_id)),
        customer_id: Set(actor.actor_id),
        subtotal: Set(subtotal),
        tax: Set(tax),
        delivery_fee: Set(delivery_fee),
        discount: Set(discount),
        total_amount: Set(total_amount),
        currency: Set(CURRENCY.into()),
        status: Set(OrderStatus::Pending.as_str().into()),
        payment_status: Set(if is_cod {
            // Cash is collected at the door, there is nothing to reconcile.
            PaymentStatus::Completed.as_str().into()
        } else {
            PaymentStatus::Pending.as_str().into()
        }),
        delivery_address: Set(payload.delivery_address.trim().to_string()),
        delivery_phone: Set(payload.delivery_phone.trim().to_string()),
        delivery_window_start: Set(payload.delivery_window_start.map(Into::into)),
        delivery_window_end: Set(payload.delivery_window_end.map(Into::into)),
        delivery_notes: Set(payload.delivery_notes.clone()),
        inventory_released: Set(false),
        cancel_reason: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    for (product, quantity) in line {
        OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(product.id),
            product_name: Set(product.name.clone()),
            unit_price: Set(product.price),
            quantity: Set(quantity),
            subtotal: Set(product.price * (quantity as i64)),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;

        inventory_service::apply_movement(
            &txn,
            product,
            -quantity,
            inventory_service::REASON_RESERVATION,
            Some(actor.actor_id),
            Some(order.id),
        )
        .await?;
    }

    let payment = PaymentActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        amount: Set(total_amount),
        currency: Set(CURRENCY.into()),
        method: Set(payload.payment_method.clone()),
        external_transaction_id: Set(None),
        checkout_reference: Set(None),
        status: Set(if is_cod {
            PaymentStatus::Completed.as_str().into()
        } else {
            PaymentStatus::Pending.as_str().into()
        }),
        failure_reason: Set(None),
        raw_webhook: Set(None),
        initiated_at: NotSet,
        completed_at: Set(is_cod.then(|| now.into())),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(actor.actor_id),
        "order_created",
        Some("orders"),
        Some(serde_json::json!({
            "order_id": order.id,
            "order_number": order.order_number,
            "total_amount": order.total_amount,
            "payment_method": payload.payment_method,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    if !is_cod {
        if let Err(err) = start_collection(state, &order, payment).await {
            match err {
                AppError::GatewayRejected(_) => return Err(err),
                AppError::GatewayUnavailable(msg) => {
                    tracing::warn!(order_id = %order.id, %msg, "payment initiation exhausted retries");
                }
                other => return Err(other),
            }
        }
    }

    let order = Orders::find_by_id(order.id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    let detail = order_detail(state, order).await?;
    Ok(ApiResponse::success("Order created", detail, Some(Meta::empty())))
}

/// Start a new payment attempt for a pending order whose previous attempt
/// failed (an order may accumulate several payment rows).
pub async fn retry_payment(
    state: &AppState,
    actor: &Actor,
    order_id: Uuid,
) -> AppResult<ApiResponse<OrderDetail>> {
    let txn = state.orm.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    if actor.role != "admin" && order.customer_id != actor.actor_id {
        return Err(AppError::Forbidden);
    }
    if parse_order_status(&order.status)? != OrderStatus::Pending {
        return Err(AppError::illegal_transition(order.status.clone(), "retry_payment"));
    }

    let latest = latest_payment(&txn, order.id).await?;
    let latest = latest.ok_or_else(|| AppError::BadRequest("Order has no payment".into()))?;
    let latest_status = parse_payment_status(&latest.status)?;
    if !matches!(latest_status, PaymentStatus::Failed | PaymentStatus::Cancelled) {
        return Err(AppError::BadRequest(
            "A payment attempt is already open or completed".into(),
        ));
    }

    let payment = PaymentActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        amount: Set(order.total_amount),
        currency: Set(order.currency.clone()),
        method: Set(latest.method.clone()),
        external_transaction_id: Set(None),
        checkout_reference: Set(None),
        status: Set(PaymentStatus::Pending.as_str().into()),
        failure_reason: Set(None),
        raw_webhook: Set(None),
        initiated_at: NotSet,
        completed_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut active: OrderActive = order.clone().into();
    active.payment_status = Set(PaymentStatus::Pending.as_str().into());
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = start_collection(state, &order, payment).await {
        match err {
            AppError::GatewayRejected(_) => return Err(err),
            AppError::GatewayUnavailable(msg) => {
                tracing::warn!(order_id = %order.id, %msg, "payment retry exhausted attempts");
            }
            other => return Err(other),
        }
    }

    let order = Orders::find_by_id(order.id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    let detail = order_detail(state, order).await?;
    Ok(ApiResponse::success("Payment retried", detail, Some(Meta::empty())))
}

/// Initiate collection at the gateway with bounded retry on transient
/// failures. Permanent rejections and exhausted retries settle the payment as
/// failed; the order stays `pending` for the sweep or an explicit retry.
async fn start_collection(
    state: &AppState,
    order: &OrderModel,
    payment: PaymentModel,
) -> AppResult<PaymentModel> {
    let request = InitiateRequest {
        order_id: order.id,
        order_number: order.order_number.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        method: payment.method.clone(),
        customer_phone: order.delivery_phone.clone(),
    };

    let mut attempt: u32 = 0;
    let initiated = loop {
        match state.gateway.initiate(&request).await {
            Ok(initiated) => break Ok(initiated),
            Err(GatewayError::Unavailable(msg)) => {
                attempt += 1;
                if attempt >= MAX_INITIATE_ATTEMPTS {
                    break Err(AppError::GatewayUnavailable(msg));
                }
                tracing::warn!(order_id = %order.id, attempt, %msg, "gateway unavailable, retrying");
                tokio::time::sleep(INITIATE_BACKOFF * 2u32.pow(attempt - 1)).await;
            }
            Err(GatewayError::Rejected(msg)) => break Err(AppError::GatewayRejected(msg)),
        }
    };

    match initiated {
        Ok(init) => {
            let now = Utc::now();
            let mut active: PaymentActive = payment.into();
            active.external_transaction_id = Set(Some(init.external_transaction_id));
            active.checkout_reference = Set(Some(init.checkout_reference));
            active.status = Set(PaymentStatus::Processing.as_str().into());
            active.updated_at = Set(now.into());
            let payment = active.update(&state.orm).await?;

            mirror_payment_status(state, payment.order_id, PaymentStatus::Processing).await?;
            Ok(payment)
        }
        Err(err) => {
            let now = Utc::now();
            let mut active: PaymentActive = payment.into();
            active.status = Set(PaymentStatus::Failed.as_str().into());
            active.failure_reason = Set(Some(err.to_string()));
            active.updated_at = Set(now.into());
            active.update(&state.orm).await?;

            mirror_payment_status(state, order.id, PaymentStatus::Failed).await?;
            Err(err)
        }
    }
}

/// Reflect an initiation result onto the order's payment axis, but only while
/// the axis has not moved past `pending` under our feet.
async fn mirror_payment_status(
    state: &AppState,
    order_id: Uuid,
    to: PaymentStatus,
) -> AppResult<()> {
    let txn = state.orm.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    if parse_payment_status(&order.payment_status)? == PaymentStatus::Pending {
        let mut active: OrderActive = order.into();
        active.payment_status = Set(to.as_str().into());
        active.updated_at = Set(Utc::now().into());
        active.update(&txn).await?;
    }
    txn.commit().await?;
    Ok(())
}

/// Reconciliation-only entry point: apply a gateway outcome to the payment
/// identified by its external transaction id. Idempotent under at-least-once
/// webhook delivery.
pub async fn apply_payment_result(
    state: &AppState,
    external_transaction_id: &str,
    outcome: PaymentOutcome,
    raw_payload: Option<Value>,
) -> AppResult<PaymentApplyOutcome> {
    let txn = state.orm.begin().await?;
    // Unlocked lookup resolves the order id; the locks themselves are taken
    // in the fixed orders -> payments order shared with cancellation.
    let payment = Payments::find()
        .filter(PaymentCol::ExternalTransactionId.eq(external_transaction_id))
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let order = lock_order(&txn, payment.order_id).await?;
    let payment = lock_payment(&txn, payment.id).await?;

    let result = apply_outcome_locked(&txn, order, payment, outcome, raw_payload, None).await?;
    txn.commit().await?;
    Ok(result)
}

/// Settle a payment as failed by primary key; used by the sweep for attempts
/// that never received an external transaction id.
pub async fn fail_payment(
    state: &AppState,
    payment_id: Uuid,
    reason: &str,
) -> AppResult<PaymentApplyOutcome> {
    let txn = state.orm.begin().await?;
    let payment = Payments::find_by_id(payment_id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let order = lock_order(&txn, payment.order_id).await?;
    let payment = lock_payment(&txn, payment.id).await?;

    let result = apply_outcome_locked(
        &txn,
        order,
        payment,
        PaymentOutcome::Failed,
        None,
        Some(reason.to_string()),
    )
    .await?;
    txn.commit().await?;
    Ok(result)
}

/// Settle a gateway outcome on an order/payment pair the caller already holds
/// locked, in that order.
async fn apply_outcome_locked(
    txn: &DatabaseTransaction,
    order: OrderModel,
    payment: PaymentModel,
    outcome: PaymentOutcome,
    raw_payload: Option<Value>,
    reason: Option<String>,
) -> AppResult<PaymentApplyOutcome> {
    let pay_status = parse_payment_status(&payment.status)?;
    let now = Utc::now();

    match outcome {
        PaymentOutcome::Completed => match pay_status {
            PaymentStatus::Completed => Ok(PaymentApplyOutcome::Duplicate),
            PaymentStatus::Failed | PaymentStatus::Cancelled => Ok(PaymentApplyOutcome::Ignored(
                format!("completed outcome for payment already {}", payment.status),
            )),
            PaymentStatus::Pending | PaymentStatus::Processing => {
                match parse_order_status(&order.status)? {
                    OrderStatus::Pending => {
                        let mut active: PaymentActive = payment.into();
                        active.status = Set(PaymentStatus::Completed.as_str().into());
                        active.completed_at = Set(Some(now.into()));
                        if let Some(raw) = raw_payload {
                            active.raw_webhook = Set(Some(raw));
                        }
                        active.updated_at = Set(now.into());
                        active.update(txn).await?;

                        let mut order_active: OrderActive = order.into();
                        order_active.status = Set(OrderStatus::Confirmed.as_str().into());
                        order_active.payment_status =
                            Set(PaymentStatus::Completed.as_str().into());
                        order_active.updated_at = Set(now.into());
                        order_active.update(txn).await?;

                        Ok(PaymentApplyOutcome::Applied)
                    }
                    OrderStatus::Cancelled => Ok(PaymentApplyOutcome::Ignored(
                        "completed outcome for a cancelled order".into(),
                    )),
                    other => Ok(PaymentApplyOutcome::Ignored(format!(
                        "completed outcome but order already {}",
                        other.as_str()
                    ))),
                }
            }
        },
        PaymentOutcome::Failed => match pay_status {
            PaymentStatus::Completed => Ok(PaymentApplyOutcome::Ignored(
                "failed outcome after completed payment".into(),
            )),
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                Ok(PaymentApplyOutcome::Duplicate)
            }
            PaymentStatus::Pending | PaymentStatus::Processing => {
                let mut active: PaymentActive = payment.into();
                active.status = Set(PaymentStatus::Failed.as_str().into());
                active.failure_reason =
                    Set(Some(reason.unwrap_or_else(|| "gateway reported failure".into())));
                if let Some(raw) = raw_payload {
                    active.raw_webhook = Set(Some(raw));
                }
                active.updated_at = Set(now.into());
                active.update(txn).await?;

                if parse_order_status(&order.status)? == OrderStatus::Pending {
                    let order = inventory_service::release_for_order(txn, order, None).await?;
                    let mut order_active: OrderActive = order.into();
                    order_active.status = Set(OrderStatus::Cancelled.as_str().into());
                    order_active.payment_status = Set(PaymentStatus::Failed.as_str().into());
                    order_active.cancel_reason = Set(Some("payment failed".into()));
                    order_active.updated_at = Set(now.into());
                    order_active.update(txn).await?;
                }

                Ok(PaymentApplyOutcome::Applied)
            }
        },
    }
}

pub async fn advance_status(
    state: &AppState,
    actor: &Actor,
    order_id: Uuid,
    payload: AdvanceStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(actor)?;

    match payload.status {
        OrderStatus::OutForDelivery | OrderStatus::Delivered => {
            return Err(AppError::BadRequest(
                "This transition is driven by courier assignment and delivery".into(),
            ));
        }
        OrderStatus::Cancelled => {
            return Err(AppError::BadRequest("Use the cancel endpoint".into()));
        }
        _ => {}
    }

    let txn = state.orm.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    let order = transition_order_locked(&txn, order, payload.status).await?;
    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(actor.actor_id),
        "order_status_advanced",
        Some("orders"),
        Some(serde_json::json!({
            "order_id": order.id,
            "status": order.status,
            "notes": payload.notes,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order updated",
        order_from_entity(order),
        Some(Meta::empty()),
    ))
}

pub async fn cancel_order(
    state: &AppState,
    actor: &Actor,
    order_id: Uuid,
    payload: CancelOrderRequest,
) -> AppResult<ApiResponse<Order>> {
    let txn = state.orm.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    if actor.role != "admin" && order.customer_id != actor.actor_id {
        return Err(AppError::Forbidden);
    }

    let status = parse_order_status(&order.status)?;
    if !status.can_cancel() {
        return Err(AppError::illegal_transition(status.as_str(), "cancelled"));
    }

    // Settle open attempts so a late webhook lands as an anomaly, not a state
    // change.
    Payments::update_many()
        .col_expr(PaymentCol::Status, Expr::value(PaymentStatus::Cancelled.as_str()))
        .col_expr(PaymentCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(PaymentCol::OrderId.eq(order.id))
        .filter(PaymentCol::Status.is_in([
            PaymentStatus::Pending.as_str(),
            PaymentStatus::Processing.as_str(),
        ]))
        .exec(&txn)
        .await?;

    let was_paid = parse_payment_status(&order.payment_status)? == PaymentStatus::Completed;
    let order = inventory_service::release_for_order(&txn, order, Some(actor.actor_id)).await?;

    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled.as_str().into());
    if !was_paid {
        active.payment_status = Set(PaymentStatus::Cancelled.as_str().into());
    }
    active.cancel_reason = Set(Some(payload.reason.clone()));
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(actor.actor_id),
        "order_cancelled",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "reason": payload.reason })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order cancelled",
        order_from_entity(order),
        Some(Meta::empty()),
    ))
}

/// Sweep-side cancellation of an order stuck in `pending`. Returns false when
/// a concurrent actor resolved the order first.
pub async fn cancel_stale_order(
    state: &AppState,
    order_id: Uuid,
    reason: &str,
) -> AppResult<bool> {
    let txn = state.orm.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    if parse_order_status(&order.status)? != OrderStatus::Pending {
        return Ok(false);
    }

    let order = inventory_service::release_for_order(&txn, order, None).await?;
    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled.as_str().into());
    active.payment_status = Set(PaymentStatus::Failed.as_str().into());
    active.cancel_reason = Set(Some(reason.to_string()));
    active.updated_at = Set(Utc::now().into());
    active.update(&txn).await?;
    txn.commit().await?;
    Ok(true)
}

pub async fn list_orders(
    state: &AppState,
    actor: &Actor,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::CustomerId.eq(actor.actor_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Ok", OrderList { items: orders }, Some(meta)))
}

pub async fn list_all_orders(
    state: &AppState,
    actor: &Actor,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_admin(actor)?;
    let (page, limit, offset) = query.pagination.normalize();

    let mut condition = Condition::all();
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Orders", OrderList { items: orders }, Some(meta)))
}

pub async fn get_order(
    state: &AppState,
    actor: &Actor,
    order_id: Uuid,
) -> AppResult<ApiResponse<OrderDetail>> {
    let order = Orders::find_by_id(order_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    if actor.role != "admin" && order.customer_id != actor.actor_id {
        return Err(AppError::NotFound);
    }

    let detail = order_detail(state, order).await?;
    Ok(ApiResponse::success("Ok", detail, Some(Meta::empty())))
}

/// Assemble the polling read projection for one order.
pub async fn order_detail(state: &AppState, order: OrderModel) -> AppResult<OrderDetail> {
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    let payment = latest_payment_conn(state, order.id).await?.map(payment_from_entity);

    let delivery = Deliveries::find()
        .filter(DeliveryCol::OrderId.eq(order.id))
        .one(&state.orm)
        .await?;

    let current_location = match &delivery {
        Some(delivery) => DeliveryLocations::find()
            .filter(LocationCol::DeliveryId.eq(delivery.id))
            .order_by_desc(LocationCol::RecordedAt)
            .one(&state.orm)
            .await?
            .map(delivery_service::location_from_entity),
        None => None,
    };

    Ok(OrderDetail {
        order: order_from_entity(order),
        items,
        payment,
        delivery: delivery.map(delivery_service::delivery_from_entity),
        current_location,
    })
}

/// Compare-and-set transition on a row the caller already holds locked.
pub(crate) async fn transition_order_locked(
    txn: &DatabaseTransaction,
    order: OrderModel,
    to: OrderStatus,
) -> AppResult<OrderModel> {
    let from = parse_order_status(&order.status)?;
    if !from.can_advance_to(to) {
        return Err(AppError::illegal_transition(from.as_str(), to.as_str()));
    }
    if to == OrderStatus::Confirmed
        && parse_payment_status(&order.payment_status)? != PaymentStatus::Completed
    {
        return Err(AppError::BadRequest(
            "Order cannot be confirmed before payment completes".into(),
        ));
    }

    let mut active: OrderActive = order.into();
    active.status = Set(to.as_str().into());
    active.updated_at = Set(Utc::now().into());
    Ok(active.update(txn).await?)
}

pub(crate) async fn lock_order(
    txn: &DatabaseTransaction,
    order_id: Uuid,
) -> AppResult<OrderModel> {
    Orders::find_by_id(order_id)
        .lock(LockType::Update)
        .one(txn)
        .await?
        .ok_or(AppError::NotFound)
}

async fn lock_payment(
    txn: &DatabaseTransaction,
    payment_id: Uuid,
) -> AppResult<PaymentModel> {
    Payments::find_by_id(payment_id)
        .lock(LockType::Update)
        .one(txn)
        .await?
        .ok_or(AppError::NotFound)
}

async fn latest_payment(
    txn: &DatabaseTransaction,
    order_id: Uuid,
) -> AppResult<Option<PaymentModel>> {
    Ok(Payments::find()
        .filter(PaymentCol::OrderId.eq(order_id))
        .order_by_desc(PaymentCol::CreatedAt)
        .one(txn)
        .await?)
}

async fn latest_payment_conn(
    state: &AppState,
    order_id: Uuid,
) -> AppResult<Option<PaymentModel>> {
    Ok(Payments::find()
        .filter(PaymentCol::OrderId.eq(order_id))
        .order_by_desc(PaymentCol::CreatedAt)
        .one(&state.orm)
        .await?)
}

fn validate_create(payload: &CreateOrderRequest) -> AppResult<()> {
    if payload.items.is_empty() {
        return Err(AppError::BadRequest("Cart is empty".into()));
    }
    if payload.items.iter().any(|item| item.quantity <= 0) {
        return Err(AppError::BadRequest("Quantities must be positive".into()));
    }
    if payload.delivery_address.trim().is_empty() {
        return Err(AppError::BadRequest("Delivery address is required".into()));
    }
    if payload.delivery_phone.trim().is_empty() {
        return Err(AppError::BadRequest("Delivery phone is required".into()));
    }
    if let (Some(start), Some(end)) =
        (payload.delivery_window_start, payload.delivery_window_end)
    {
        if end <= start {
            return Err(AppError::BadRequest(
                "Delivery window end must be after its start".into(),
            ));
        }
    }
    if !SUPPORTED_METHODS.contains(&payload.payment_method.as_str()) {
        return Err(AppError::BadRequest("Unsupported payment method".into()));
    }
    Ok(())
}

fn delivery_fee_for(subtotal: i64, config: &AppConfig) -> i64 {
    if config.free_delivery_threshold > 0 && subtotal >= config.free_delivery_threshold {
        0
    } else {
        config.delivery_fee
    }
}

fn build_order_number(order_id: Uuid) -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = order_id.to_string();
    let short = &suffix[..8];
    format!("ORD-{}-{}", date, short)
}

pub(crate) fn parse_order_status(s: &str) -> AppResult<OrderStatus> {
    OrderStatus::parse(s)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown order status {s}")))
}

pub(crate) fn parse_payment_status(s: &str) -> AppResult<PaymentStatus> {
    PaymentStatus::parse(s)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown payment status {s}")))
}

pub fn order_from_entity(model: OrderModel) -> Order {
    Order {
        id: model.id,
        order_number: model.order_number,
        customer_id: model.customer_id,
        subtotal: model.subtotal,
        tax: model.tax,
        delivery_fee: model.delivery_fee,
        discount: model.discount,
        total_amount: model.total_amount,
        currency: model.currency,
        status: model.status,
        payment_status: model.payment_status,
        delivery_address: model.delivery_address,
        delivery_phone: model.delivery_phone,
        delivery_window_start: model.delivery_window_start.map(|dt| dt.with_timezone(&Utc)),
        delivery_window_end: model.delivery_window_end.map(|dt| dt.with_timezone(&Utc)),
        delivery_notes: model.delivery_notes,
        cancel_reason: model.cancel_reason,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        product_name: model.product_name,
        unit_price: model.unit_price,
        quantity: model.quantity,
        subtotal: model.subtotal,
    }
}

pub fn payment_from_entity(model: PaymentModel) -> Payment {
    Payment {
        id: model.id,
        order_id: model.order_id,
        amount: model.amount,
        currency: model.currency,
        method: model.method,
        external_transaction_id: model.external_transaction_id,
        checkout_reference: model.checkout_reference,
        status: model.status,
        failure_reason: model.failure_reason,
        initiated_at: model.initiated_at.with_timezone(&Utc),
        completed_at: model.completed_at.map(|dt| dt.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::orders::OrderItemRequest;

    fn base_request() -> CreateOrderRequest {
        CreateOrderRequest {
            items: vec![OrderItemRequest {
                product_id: Uuid::new_v4(),
                quantity: 2,
            }],
            delivery_address: "Kariakoo, Dar es Salaam".into(),
            delivery_phone: "+255700000001".into(),
            delivery_window_start: None,
            delivery_window_end: None,
            delivery_notes: None,
            payment_method: "mobile_money".into(),
        }
    }

    fn config_with_fee(fee: i64, threshold: i64) -> AppConfig {
        AppConfig {
            database_url: String::new(),
            host: String::new(),
            port: 0,
            gateway_base_url: String::new(),
            gateway_api_key: String::new(),
            gateway_webhook_secret: String::new(),
            payment_pending_timeout_minutes: 15,
            sweep_interval_seconds: 60,
            delivery_fee: fee,
            free_delivery_threshold: threshold,
        }
    }

    #[test]
    fn empty_cart_is_rejected() {
        let mut req = base_request();
        req.items.clear();
        assert!(matches!(validate_create(&req), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let mut req = base_request();
        req.items[0].quantity = 0;
        assert!(matches!(validate_create(&req), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn inverted_delivery_window_is_rejected() {
        let mut req = base_request();
        let start = Utc::now();
        req.delivery_window_start = Some(start);
        req.delivery_window_end = Some(start - chrono::Duration::hours(1));
        assert!(matches!(validate_create(&req), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn unknown_payment_method_is_rejected() {
        let mut req = base_request();
        req.payment_method = "barter".into();
        assert!(matches!(validate_create(&req), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn valid_request_passes() {
        assert!(validate_create(&base_request()).is_ok());
    }

    #[test]
    fn delivery_fee_is_flat_below_threshold() {
        let config = config_with_fee(3000, 0);
        assert_eq!(delivery_fee_for(11_700, &config), 3000);
    }

    #[test]
    fn delivery_fee_waived_at_threshold() {
        let config = config_with_fee(3000, 50_000);
        assert_eq!(delivery_fee_for(49_999, &config), 3000);
        assert_eq!(delivery_fee_for(50_000, &config), 0);
    }

    #[test]
    fn order_number_embeds_date_and_id() {
        let id = Uuid::new_v4();
        let number = build_order_number(id);
        assert!(number.starts_with("ORD-"));
        assert!(number.ends_with(&id.to_string()[..8]));
    }
}
