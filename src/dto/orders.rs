use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    models::{Delivery, DeliveryLocation, Order, OrderItem, Payment, WebhookEvent},
    status::OrderStatus,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
    pub delivery_address: String,
    pub delivery_phone: String,
    pub delivery_window_start: Option<DateTime<Utc>>,
    pub delivery_window_end: Option<DateTime<Utc>>,
    pub delivery_notes: Option<String>,
    /// `mobile_money`, `card` or `cash_on_delivery`.
    pub payment_method: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelOrderRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AdvanceStatusRequest {
    pub status: OrderStatus,
    pub notes: Option<String>,
}

/// Read projection a polling client refreshes against.
#[derive(Debug, Serialize, ToSchema)]
pub struct OrderDetail {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payment: Option<Payment>,
    pub delivery: Option<Delivery>,
    pub current_location: Option<DeliveryLocation>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderList {
    pub items: Vec<Order>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookEventList {
    pub items: Vec<WebhookEvent>,
}
