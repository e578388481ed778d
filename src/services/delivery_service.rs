//! The delivery engine. Owns every write to `Delivery.status` and the
//! location trail; order rows are only touched through the order engine's
//! transition helper so delivery and order updates commit atomically.

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::deliveries::{
        AssignCourierRequest, DeliveryDetail, LocationUpdateRequest, MarkDeliveredRequest,
        MarkFailedRequest, RateDeliveryRequest,
    },
    entity::{
        deliveries::{
            ActiveModel as DeliveryActive, Column as DeliveryCol, Entity as Deliveries,
            Model as DeliveryModel,
        },
        delivery_locations::{
            ActiveModel as LocationActive, Column as LocationCol, Entity as DeliveryLocations,
            Model as LocationModel,
        },
        orders::Entity as Orders,
    },
    error::{AppError, AppResult},
    middleware::auth::{Actor, ensure_admin, ensure_courier},
    models::{Delivery, DeliveryLocation},
    response::{ApiResponse, Meta},
    services::order_service,
    state::AppState,
    status::{DeliveryStatus, OrderStatus},
};

/// Assign a courier to a `ready_for_pickup` order. Creates the delivery and
/// moves the order to `out_for_delivery` in the same transaction.
pub async fn assign_courier(
    state: &AppState,
    actor: &Actor,
    payload: AssignCourierRequest,
) -> AppResult<ApiResponse<Delivery>> {
    ensure_admin(actor)?;
    if payload.courier_phone.trim().is_empty() {
        return Err(AppError::BadRequest("Courier phone is required".into()));
    }

    let txn = state.orm.begin().await?;
    let order = order_service::lock_order(&txn, payload.order_id).await?;

    let existing = Deliveries::find()
        .filter(DeliveryCol::OrderId.eq(order.id))
        .one(&txn)
        .await?;
    if existing.is_some() {
        return Err(AppError::BadRequest("Order already has a delivery".into()));
    }

    // Rejects anything earlier than ready_for_pickup (delivery gating).
    let order =
        order_service::transition_order_locked(&txn, order, OrderStatus::OutForDelivery).await?;

    let delivery = DeliveryActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        courier_id: Set(payload.courier_id),
        courier_phone: Set(payload.courier_phone.trim().to_string()),
        status: Set(DeliveryStatus::Assigned.as_str().into()),
        assigned_at: Set(Utc::now().into()),
        picked_up_at: Set(None),
        delivered_at: Set(None),
        failure_reason: Set(None),
        rating: Set(None),
        feedback: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(actor.actor_id),
        "courier_assigned",
        Some("deliveries"),
        Some(serde_json::json!({
            "delivery_id": delivery.id,
            "order_id": order.id,
            "courier_id": payload.courier_id,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Courier assigned",
        delivery_from_entity(delivery),
        Some(Meta::empty()),
    ))
}

pub async fn get_delivery(
    state: &AppState,
    actor: &Actor,
    delivery_id: Uuid,
) -> AppResult<ApiResponse<DeliveryDetail>> {
    let delivery = Deliveries::find_by_id(delivery_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    authorize_read(state, actor, &delivery).await?;

    let locations: Vec<LocationModel> = DeliveryLocations::find()
        .filter(LocationCol::DeliveryId.eq(delivery.id))
        .order_by_desc(LocationCol::RecordedAt)
        .all(&state.orm)
        .await?;

    let current_location = locations.first().cloned().map(location_from_entity);
    let locations = locations.into_iter().map(location_from_entity).collect();

    Ok(ApiResponse::success(
        "Ok",
        DeliveryDetail {
            delivery: delivery_from_entity(delivery),
            locations,
            current_location,
        },
        Some(Meta::empty()),
    ))
}

pub async fn mark_picked_up(
    state: &AppState,
    actor: &Actor,
    delivery_id: Uuid,
) -> AppResult<ApiResponse<Delivery>> {
    ensure_courier(actor)?;
    let txn = state.orm.begin().await?;
    let delivery = lock_delivery(&txn, delivery_id).await?;
    authorize_courier(actor, &delivery)?;

    let delivery =
        transition_delivery_locked(&txn, delivery, DeliveryStatus::PickedUp, |active| {
            active.picked_up_at = Set(Some(Utc::now().into()));
        })
        .await?;
    txn.commit().await?;

    Ok(ApiResponse::success(
        "Pickup recorded",
        delivery_from_entity(delivery),
        Some(Meta::empty()),
    ))
}

pub async fn mark_in_transit(
    state: &AppState,
    actor: &Actor,
    delivery_id: Uuid,
) -> AppResult<ApiResponse<Delivery>> {
    ensure_courier(actor)?;
    let txn = state.orm.begin().await?;
    let delivery = lock_delivery(&txn, delivery_id).await?;
    authorize_courier(actor, &delivery)?;

    let delivery =
        transition_delivery_locked(&txn, delivery, DeliveryStatus::InTransit, |_| {}).await?;
    txn.commit().await?;

    Ok(ApiResponse::success(
        "In transit",
        delivery_from_entity(delivery),
        Some(Meta::empty()),
    ))
}

/// Append a GPS sample. Late-arriving samples are appended as-is; the current
/// location is derived at read time from the recorded timestamp.
pub async fn record_location(
    state: &AppState,
    actor: &Actor,
    delivery_id: Uuid,
    payload: LocationUpdateRequest,
) -> AppResult<ApiResponse<DeliveryLocation>> {
    ensure_courier(actor)?;
    if !(-90.0..=90.0).contains(&payload.lat) || !(-180.0..=180.0).contains(&payload.lon) {
        return Err(AppError::BadRequest("Invalid coordinates".into()));
    }

    let delivery = Deliveries::find_by_id(delivery_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    authorize_courier(actor, &delivery)?;

    let status = parse_delivery_status(&delivery.status)?;
    if status.is_terminal() {
        return Err(AppError::illegal_transition(status.as_str(), "location_update"));
    }

    let location = LocationActive {
        id: Set(Uuid::new_v4()),
        delivery_id: Set(delivery.id),
        lat: Set(payload.lat),
        lon: Set(payload.lon),
        recorded_at: Set(payload.recorded_at.into()),
        note: Set(payload.note.clone()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(ApiResponse::success(
        "Location recorded",
        location_from_entity(location),
        Some(Meta::empty()),
    ))
}

/// Latest sample by recorded timestamp, which may differ from the latest
/// insertion when updates arrive out of order.
pub async fn current_location(
    state: &AppState,
    delivery_id: Uuid,
) -> AppResult<Option<DeliveryLocation>> {
    Ok(DeliveryLocations::find()
        .filter(LocationCol::DeliveryId.eq(delivery_id))
        .order_by_desc(LocationCol::RecordedAt)
        .one(&state.orm)
        .await?
        .map(location_from_entity))
}

pub async fn mark_delivered(
    state: &AppState,
    actor: &Actor,
    delivery_id: Uuid,
    payload: MarkDeliveredRequest,
) -> AppResult<ApiResponse<Delivery>> {
    ensure_courier(actor)?;
    let txn = state.orm.begin().await?;
    let delivery = lock_delivery(&txn, delivery_id).await?;
    authorize_courier(actor, &delivery)?;

    let delivery =
        transition_delivery_locked(&txn, delivery, DeliveryStatus::Delivered, |active| {
            active.delivered_at = Set(Some(Utc::now().into()));
        })
        .await?;

    let order = order_service::lock_order(&txn, delivery.order_id).await?;
    order_service::transition_order_locked(&txn, order, OrderStatus::Delivered).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(actor.actor_id),
        "delivery_completed",
        Some("deliveries"),
        Some(serde_json::json!({
            "delivery_id": delivery.id,
            "order_id": delivery.order_id,
            "proof": payload.proof,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Delivered",
        delivery_from_entity(delivery),
        Some(Meta::empty()),
    ))
}

/// A failed delivery does not cancel the order; an operator decides between
/// re-assignment and refund.
pub async fn mark_failed(
    state: &AppState,
    actor: &Actor,
    delivery_id: Uuid,
    payload: MarkFailedRequest,
) -> AppResult<ApiResponse<Delivery>> {
    ensure_courier(actor)?;
    let txn = state.orm.begin().await?;
    let delivery = lock_delivery(&txn, delivery_id).await?;
    authorize_courier(actor, &delivery)?;

    let delivery = transition_delivery_locked(&txn, delivery, DeliveryStatus::Failed, |active| {
        active.failure_reason = Set(Some(payload.reason.clone()));
    })
    .await?;
    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(actor.actor_id),
        "delivery_failed",
        Some("deliveries"),
        Some(serde_json::json!({
            "delivery_id": delivery.id,
            "order_id": delivery.order_id,
            "reason": payload.reason,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Delivery failed",
        delivery_from_entity(delivery),
        Some(Meta::empty()),
    ))
}

pub async fn rate_delivery(
    state: &AppState,
    actor: &Actor,
    delivery_id: Uuid,
    payload: RateDeliveryRequest,
) -> AppResult<ApiResponse<Delivery>> {
    if !(1..=5).contains(&payload.rating) {
        return Err(AppError::BadRequest("Rating must be between 1 and 5".into()));
    }

    let txn = state.orm.begin().await?;
    let delivery = lock_delivery(&txn, delivery_id).await?;

    let order = Orders::find_by_id(delivery.order_id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    if actor.role != "admin" && order.customer_id != actor.actor_id {
        return Err(AppError::Forbidden);
    }
    if parse_delivery_status(&delivery.status)? != DeliveryStatus::Delivered {
        return Err(AppError::BadRequest(
            "Only delivered orders can be rated".into(),
        ));
    }

    let mut active: DeliveryActive = delivery.into();
    active.rating = Set(Some(payload.rating));
    active.feedback = Set(payload.feedback.clone());
    active.updated_at = Set(Utc::now().into());
    let delivery = active.update(&txn).await?;
    txn.commit().await?;

    Ok(ApiResponse::success(
        "Thanks for the feedback",
        delivery_from_entity(delivery),
        Some(Meta::empty()),
    ))
}

async fn lock_delivery(
    txn: &DatabaseTransaction,
    delivery_id: Uuid,
) -> AppResult<DeliveryModel> {
    Deliveries::find_by_id(delivery_id)
        .lock(LockType::Update)
        .one(txn)
        .await?
        .ok_or(AppError::NotFound)
}

async fn transition_delivery_locked(
    txn: &DatabaseTransaction,
    delivery: DeliveryModel,
    to: DeliveryStatus,
    apply: impl FnOnce(&mut DeliveryActive),
) -> AppResult<DeliveryModel> {
    let from = parse_delivery_status(&delivery.status)?;
    if !from.can_advance_to(to) {
        return Err(AppError::illegal_transition(from.as_str(), to.as_str()));
    }

    let mut active: DeliveryActive = delivery.into();
    active.status = Set(to.as_str().into());
    active.updated_at = Set(Utc::now().into());
    apply(&mut active);
    Ok(active.update(txn).await?)
}

fn authorize_courier(actor: &Actor, delivery: &DeliveryModel) -> AppResult<()> {
    if actor.role == "admin" || delivery.courier_id == actor.actor_id {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

async fn authorize_read(
    state: &AppState,
    actor: &Actor,
    delivery: &DeliveryModel,
) -> AppResult<()> {
    if actor.role == "admin" || delivery.courier_id == actor.actor_id {
        return Ok(());
    }
    let order = Orders::find_by_id(delivery.order_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    if order.customer_id == actor.actor_id {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

pub(crate) fn parse_delivery_status(s: &str) -> AppResult<DeliveryStatus> {
    DeliveryStatus::parse(s)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown delivery status {s}")))
}

pub fn delivery_from_entity(model: DeliveryModel) -> Delivery {
    Delivery {
        id: model.id,
        order_id: model.order_id,
        courier_id: model.courier_id,
        courier_phone: model.courier_phone,
        status: model.status,
        assigned_at: model.assigned_at.with_timezone(&Utc),
        picked_up_at: model.picked_up_at.map(|dt| dt.with_timezone(&Utc)),
        delivered_at: model.delivered_at.map(|dt| dt.with_timezone(&Utc)),
        failure_reason: model.failure_reason,
        rating: model.rating,
        feedback: model.feedback,
    }
}

pub fn location_from_entity(model: LocationModel) -> DeliveryLocation {
    DeliveryLocation {
        id: model.id,
        delivery_id: model.delivery_id,
        lat: model.lat,
        lon: model.lon,
        recorded_at: model.recorded_at.with_timezone(&Utc),
        note: model.note,
    }
}
