use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use uuid::Uuid;

use crate::{
    dto::deliveries::{
        DeliveryDetail, LocationUpdateRequest, MarkDeliveredRequest, MarkFailedRequest,
        RateDeliveryRequest,
    },
    error::AppResult,
    middleware::auth::Actor,
    models::{Delivery, DeliveryLocation},
    response::ApiResponse,
    services::delivery_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_delivery))
        .route("/{id}/pickup", post(mark_picked_up))
        .route("/{id}/transit", post(mark_in_transit))
        .route("/{id}/locations", post(record_location))
        .route("/{id}/delivered", post(mark_delivered))
        .route("/{id}/failed", post(mark_failed))
        .route("/{id}/rating", post(rate_delivery))
}

#[utoipa::path(
    get,
    path = "/deliveries/{id}",
    params(("id" = Uuid, Path, description = "Delivery ID")),
    responses(
        (status = 200, description = "Delivery with location trail", body = ApiResponse<DeliveryDetail>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Deliveries"
)]
pub async fn get_delivery(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<DeliveryDetail>>> {
    let resp = delivery_service::get_delivery(&state, &actor, id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/deliveries/{id}/pickup",
    params(("id" = Uuid, Path, description = "Delivery ID")),
    responses(
        (status = 200, description = "Courier picked the order up", body = ApiResponse<Delivery>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
        (status = 409, description = "Illegal transition"),
    ),
    security(("bearer_auth" = [])),
    tag = "Deliveries"
)]
pub async fn mark_picked_up(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Delivery>>> {
    let resp = delivery_service::mark_picked_up(&state, &actor, id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/deliveries/{id}/transit",
    params(("id" = Uuid, Path, description = "Delivery ID")),
    responses(
        (status = 200, description = "Courier en route", body = ApiResponse<Delivery>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
        (status = 409, description = "Illegal transition"),
    ),
    security(("bearer_auth" = [])),
    tag = "Deliveries"
)]
pub async fn mark_in_transit(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Delivery>>> {
    let resp = delivery_service::mark_in_transit(&state, &actor, id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/deliveries/{id}/locations",
    params(("id" = Uuid, Path, description = "Delivery ID")),
    request_body = LocationUpdateRequest,
    responses(
        (status = 200, description = "Location appended", body = ApiResponse<DeliveryLocation>),
        (status = 400, description = "Invalid coordinates"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
        (status = 409, description = "Delivery already terminal"),
    ),
    security(("bearer_auth" = [])),
    tag = "Deliveries"
)]
pub async fn record_location(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationUpdateRequest>,
) -> AppResult<Json<ApiResponse<DeliveryLocation>>> {
    let resp = delivery_service::record_location(&state, &actor, id, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/deliveries/{id}/delivered",
    params(("id" = Uuid, Path, description = "Delivery ID")),
    request_body = MarkDeliveredRequest,
    responses(
        (status = 200, description = "Delivery and order completed", body = ApiResponse<Delivery>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
        (status = 409, description = "Illegal transition"),
    ),
    security(("bearer_auth" = [])),
    tag = "Deliveries"
)]
pub async fn mark_delivered(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<MarkDeliveredRequest>,
) -> AppResult<Json<ApiResponse<Delivery>>> {
    let resp = delivery_service::mark_delivered(&state, &actor, id, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/deliveries/{id}/failed",
    params(("id" = Uuid, Path, description = "Delivery ID")),
    request_body = MarkFailedRequest,
    responses(
        (status = 200, description = "Delivery marked failed; order left for admin follow-up", body = ApiResponse<Delivery>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
        (status = 409, description = "Delivery already terminal"),
    ),
    security(("bearer_auth" = [])),
    tag = "Deliveries"
)]
pub async fn mark_failed(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<MarkFailedRequest>,
) -> AppResult<Json<ApiResponse<Delivery>>> {
    let resp = delivery_service::mark_failed(&state, &actor, id, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/deliveries/{id}/rating",
    params(("id" = Uuid, Path, description = "Delivery ID")),
    request_body = RateDeliveryRequest,
    responses(
        (status = 200, description = "Rating recorded", body = ApiResponse<Delivery>),
        (status = 400, description = "Rating out of range or delivery not completed"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Deliveries"
)]
pub async fn rate_delivery(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<RateDeliveryRequest>,
) -> AppResult<Json<ApiResponse<Delivery>>> {
    let resp = delivery_service::rate_delivery(&state, &actor, id, payload).await?;
    Ok(Json(resp))
}
