use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::{
        deliveries::AssignCourierRequest,
        orders::{AdvanceStatusRequest, OrderDetail, OrderList, WebhookEventList},
    },
    error::AppResult,
    middleware::auth::{Actor, ensure_admin},
    models::{Delivery, InventoryMovement, Order, Product},
    response::ApiResponse,
    routes::params::{OrderListQuery, Pagination},
    services::{delivery_service, inventory_service, order_service, reconciliation_service},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_all_orders))
        .route("/orders/{id}", get(get_order_admin))
        .route("/orders/{id}/status", patch(advance_order_status))
        .route("/deliveries", post(assign_courier))
        .route("/inventory/low-stock", get(list_low_stock))
        .route("/inventory/{id}/movements", get(list_movements))
        .route("/webhook-events", get(list_webhook_events))
        .route("/reconciliation/sweep", post(run_sweep))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LowStockQuery {
    #[serde(flatten)]
    pub pagination: Pagination,
    pub threshold: Option<i32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WebhookEventQuery {
    #[serde(flatten)]
    pub pagination: Pagination,
    pub outcome: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductList {
    pub items: Vec<Product>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MovementList {
    pub items: Vec<InventoryMovement>,
}

#[utoipa::path(
    get,
    path = "/admin/orders",
    params(
        ("page" = Option<i64>, Query, description = "Page number, default 1"),
        ("per_page" = Option<i64>, Query, description = "Items per page, default 20"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("sort_order" = Option<String>, Query, description = "Sort order: asc, desc")
    ),
    responses(
        (status = 200, description = "All orders (admin only)", body = ApiResponse<OrderList>),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_all_orders(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<OrderListQuery>,
) -> AppResult<Json<ApiResponse<OrderList>>> {
    let resp = order_service::list_all_orders(&state, &actor, query).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/admin/orders/{id}",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Any order with items (admin only)", body = ApiResponse<OrderDetail>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_order_admin(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<OrderDetail>>> {
    ensure_admin(&actor)?;
    let resp = order_service::get_order(&state, &actor, id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    patch,
    path = "/admin/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = AdvanceStatusRequest,
    responses(
        (status = 200, description = "Order advanced one step", body = ApiResponse<Order>),
        (status = 400, description = "Status not reachable through this endpoint"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
        (status = 409, description = "Illegal transition"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn advance_order_status(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdvanceStatusRequest>,
) -> AppResult<Json<ApiResponse<Order>>> {
    let resp = order_service::advance_status(&state, &actor, id, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/admin/deliveries",
    request_body = AssignCourierRequest,
    responses(
        (status = 200, description = "Courier assigned, order out for delivery", body = ApiResponse<Delivery>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not Found"),
        (status = 409, description = "Order not ready for pickup or already assigned"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn assign_courier(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<AssignCourierRequest>,
) -> AppResult<Json<ApiResponse<Delivery>>> {
    let resp = delivery_service::assign_courier(&state, &actor, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/admin/inventory/low-stock",
    params(
        ("threshold" = Option<i32>, Query, description = "Stock threshold, default 5"),
        ("page" = Option<i64>, Query, description = "Page number, default 1"),
        ("per_page" = Option<i64>, Query, description = "Items per page, default 20")
    ),
    responses(
        (status = 200, description = "Products at or below the threshold", body = ApiResponse<ProductList>),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_low_stock(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<LowStockQuery>,
) -> AppResult<Json<ApiResponse<ProductList>>> {
    let resp = inventory_service::list_low_stock(&state, &actor, query).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/admin/inventory/{id}/movements",
    params(
        ("id" = Uuid, Path, description = "Product ID"),
        ("page" = Option<i64>, Query, description = "Page number, default 1"),
        ("per_page" = Option<i64>, Query, description = "Items per page, default 20")
    ),
    responses(
        (status = 200, description = "Movement ledger for a product, newest first", body = ApiResponse<MovementList>),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_movements(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<MovementList>>> {
    let resp = inventory_service::list_movements(&state, &actor, id, pagination).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/admin/webhook-events",
    params(
        ("outcome" = Option<String>, Query, description = "Filter: applied, duplicate, orphan, anomaly, error"),
        ("page" = Option<i64>, Query, description = "Page number, default 1"),
        ("per_page" = Option<i64>, Query, description = "Items per page, default 20")
    ),
    responses(
        (status = 200, description = "Recorded webhook events, newest first", body = ApiResponse<WebhookEventList>),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_webhook_events(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<WebhookEventQuery>,
) -> AppResult<Json<ApiResponse<WebhookEventList>>> {
    let resp = reconciliation_service::list_events(&state, &actor, query).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/admin/reconciliation/sweep",
    responses(
        (status = 200, description = "Run one reconciliation sweep now", body = ApiResponse<reconciliation_service::SweepReport>),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn run_sweep(
    State(state): State<AppState>,
    actor: Actor,
) -> AppResult<Json<ApiResponse<reconciliation_service::SweepReport>>> {
    ensure_admin(&actor)?;
    let report = reconciliation_service::run_pending_sweep(&state).await?;
    Ok(Json(ApiResponse::success(
        "Sweep finished",
        report,
        Some(crate::response::Meta::empty()),
    )))
}
