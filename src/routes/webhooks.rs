use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};

use crate::{
    dto::webhooks::{PaymentWebhook, WebhookAck},
    error::AppResult,
    response::ApiResponse,
    services::reconciliation_service,
    state::AppState,
};

pub const SIGNATURE_HEADER: &str = "x-signature";

pub fn router() -> Router<AppState> {
    Router::new().route("/payments", post(payment_webhook))
}

/// Raw-body handler: the signature covers the exact bytes on the wire, so the
/// payload is only deserialized after verification.
#[utoipa::path(
    post,
    path = "/webhooks/payments",
    request_body = PaymentWebhook,
    params(
        ("x-signature" = String, Header, description = "Hex HMAC-SHA256 of the raw body")
    ),
    responses(
        (status = 200, description = "Event recorded", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Malformed payload"),
        (status = 401, description = "Missing or invalid signature"),
    ),
    tag = "Webhooks"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<ApiResponse<WebhookAck>>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let resp = reconciliation_service::handle_webhook(&state, &body, signature).await?;
    Ok(Json(resp))
}
