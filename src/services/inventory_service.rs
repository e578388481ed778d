//! Append-only stock ledger. A product's live `stock` column is the cached
//! fold of its movements; every change goes through [`apply_movement`] under a
//! row lock so concurrent reservations on the same product serialize.

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use crate::{
    entity::{
        inventory_movements::{
            ActiveModel as MovementActive, Column as MovementCol, Entity as InventoryMovements,
            Model as MovementModel,
        },
        order_items::{Column as OrderItemCol, Entity as OrderItems},
        orders::{ActiveModel as OrderActive, Model as OrderModel},
        products::{
            ActiveModel as ProductActive, Column as ProdCol, Entity as Products,
            Model as ProductModel,
        },
    },
    error::{AppError, AppResult},
    middleware::auth::{Actor, ensure_admin},
    models::{InventoryMovement, Product},
    response::{ApiResponse, Meta},
    routes::admin::{LowStockQuery, MovementList, ProductList},
    routes::params::Pagination,
    state::AppState,
};

pub const REASON_RESERVATION: &str = "order_reservation";
pub const REASON_RELEASE: &str = "order_release";

pub async fn lock_product(
    txn: &sea_orm::DatabaseTransaction,
    product_id: Uuid,
) -> AppResult<ProductModel> {
    let product = Products::find_by_id(product_id)
        .lock(LockType::Update)
        .one(txn)
        .await?;
    product.ok_or(AppError::NotFound)
}

/// Append a movement for an already-locked product and refresh its cached
/// stock. Rejects atomically when the fold would go negative.
pub async fn apply_movement(
    txn: &sea_orm::DatabaseTransaction,
    product: ProductModel,
    delta: i32,
    reason: &str,
    actor_id: Option<Uuid>,
    order_id: Option<Uuid>,
) -> AppResult<(ProductModel, MovementModel)> {
    let resulting = product.stock + delta;
    if resulting < 0 {
        return Err(AppError::InsufficientStock {
            product_id: product.id,
        });
    }

    let movement = MovementActive {
        id: Set(Uuid::new_v4()),
        product_id: Set(product.id),
        order_id: Set(order_id),
        delta: Set(delta),
        reason: Set(reason.to_string()),
        resulting_stock: Set(resulting),
        actor_id: Set(actor_id),
        created_at: NotSet,
    }
    .insert(txn)
    .await?;

    let mut active: ProductActive = product.into();
    active.stock = Set(resulting);
    let product = active.update(txn).await?;

    Ok((product, movement))
}

pub async fn reserve(
    txn: &sea_orm::DatabaseTransaction,
    product_id: Uuid,
    quantity: i32,
    actor_id: Option<Uuid>,
    order_id: Option<Uuid>,
) -> AppResult<(ProductModel, MovementModel)> {
    if quantity <= 0 {
        return Err(AppError::BadRequest("Quantity must be positive".into()));
    }
    let product = lock_product(txn, product_id).await?;
    apply_movement(
        txn,
        product,
        -quantity,
        REASON_RESERVATION,
        actor_id,
        order_id,
    )
    .await
}

pub async fn release(
    txn: &sea_orm::DatabaseTransaction,
    product_id: Uuid,
    quantity: i32,
    reason: &str,
    actor_id: Option<Uuid>,
    order_id: Option<Uuid>,
) -> AppResult<(ProductModel, MovementModel)> {
    if quantity <= 0 {
        return Err(AppError::BadRequest("Quantity must be positive".into()));
    }
    let product = lock_product(txn, product_id).await?;
    apply_movement(txn, product, quantity, reason, actor_id, order_id).await
}

/// Write compensating movements for every line item of an order. The caller
/// must hold the order row lock; the `inventory_released` flag makes the
/// release idempotent when a cancel and a failed-payment webhook race.
pub async fn release_for_order(
    txn: &sea_orm::DatabaseTransaction,
    order: OrderModel,
    actor_id: Option<Uuid>,
) -> AppResult<OrderModel> {
    if order.inventory_released {
        return Ok(order);
    }

    let mut items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(txn)
        .await?;
    // Stable lock order across concurrent transactions.
    items.sort_by_key(|item| item.product_id);

    for item in &items {
        release(
            txn,
            item.product_id,
            item.quantity,
            REASON_RELEASE,
            actor_id,
            Some(order.id),
        )
        .await?;
    }

    let mut active: OrderActive = order.into();
    active.inventory_released = Set(true);
    active.updated_at = Set(Utc::now().into());
    Ok(active.update(txn).await?)
}

pub async fn list_low_stock(
    state: &AppState,
    actor: &Actor,
    query: LowStockQuery,
) -> AppResult<ApiResponse<ProductList>> {
    ensure_admin(actor)?;
    let threshold = query.threshold.unwrap_or(5);
    let (page, limit, offset) = query.pagination.normalize();

    let finder = Products::find()
        .filter(ProdCol::Stock.lte(threshold))
        .order_by_asc(ProdCol::Stock)
        .order_by_desc(ProdCol::CreatedAt);

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(product_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Low stock", ProductList { items }, Some(meta)))
}

pub async fn list_movements(
    state: &AppState,
    actor: &Actor,
    product_id: Uuid,
    pagination: Pagination,
) -> AppResult<ApiResponse<MovementList>> {
    ensure_admin(actor)?;
    let (page, limit, offset) = pagination.normalize();

    let finder = InventoryMovements::find()
        .filter(MovementCol::ProductId.eq(product_id))
        .order_by_desc(MovementCol::CreatedAt);

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(movement_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Movements",
        MovementList { items },
        Some(meta),
    ))
}

pub fn product_from_entity(model: ProductModel) -> Product {
    Product {
        id: model.id,
        name: model.name,
        description: model.description,
        unit: model.unit,
        price: model.price,
        stock: model.stock,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn movement_from_entity(model: MovementModel) -> InventoryMovement {
    InventoryMovement {
        id: model.id,
        product_id: model.product_id,
        order_id: model.order_id,
        delta: model.delta,
        reason: model.reason,
        resulting_stock: model.resulting_stock,
        actor_id: model.actor_id,
        created_at: model.created_at.with_timezone(&Utc),
    }
}
