use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Delivery, DeliveryLocation};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignCourierRequest {
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub courier_phone: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LocationUpdateRequest {
    pub lat: f64,
    pub lon: f64,
    /// Device-side capture time; late arrivals are appended as-is.
    pub recorded_at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MarkDeliveredRequest {
    pub proof: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MarkFailedRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RateDeliveryRequest {
    pub rating: i32,
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeliveryDetail {
    pub delivery: Delivery,
    pub locations: Vec<DeliveryLocation>,
    /// Latest update by recorded timestamp, not by insertion order.
    pub current_location: Option<DeliveryLocation>,
}
