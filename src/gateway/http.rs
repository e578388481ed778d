use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use tracing::warn;

use crate::config::AppConfig;

use super::{
    GatewayError, GatewayPaymentStatus, InitiateRequest, InitiatedPayment, PaymentGateway,
    verify_hmac_sha256_hex,
};

/// Outbound request timeout; no gateway call may block past this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Mobile-money collection gateway spoken to over HTTPS. Webhook signatures
/// are HMAC-SHA256 over the raw body, hex-encoded in the signature header.
pub struct HttpPaymentGateway {
    client: HttpClient,
    base_url: String,
    api_key: String,
    webhook_secret: String,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    transaction_id: String,
    checkout_reference: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    message: Option<String>,
}

impl HttpPaymentGateway {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = HttpClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.gateway_base_url.trim_end_matches('/').to_string(),
            api_key: config.gateway_api_key.clone(),
            webhook_secret: config.gateway_webhook_secret.clone(),
        })
    }

    async fn rejection_message(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<GatewayErrorBody>().await {
            Ok(body) => body
                .message
                .unwrap_or_else(|| format!("gateway returned {status}")),
            Err(_) => format!("gateway returned {status}"),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiatedPayment, GatewayError> {
        let url = format!("{}/v1/collections", self.base_url);
        let body = serde_json::json!({
            "reference": request.order_number,
            "amount": request.amount,
            "currency": request.currency,
            "channel": request.method,
            "msisdn": request.customer_phone,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {
                let parsed: InitiateResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
                Ok(InitiatedPayment {
                    external_transaction_id: parsed.transaction_id,
                    checkout_reference: parsed.checkout_reference,
                })
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(GatewayError::Unavailable(format!("gateway returned {s}")))
            }
            _ => {
                let message = Self::rejection_message(response).await;
                warn!(order_number = %request.order_number, %message, "gateway rejected initiation");
                Err(GatewayError::Rejected(message))
            }
        }
    }

    async fn query_status(
        &self,
        external_transaction_id: &str,
    ) -> Result<GatewayPaymentStatus, GatewayError> {
        let url = format!(
            "{}/v1/collections/{}",
            self.base_url, external_transaction_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                // The gateway never heard of this transaction; treat as failed
                // so the sweep can resolve the order.
                return Ok(GatewayPaymentStatus::Failed);
            }
            return Err(GatewayError::Unavailable(format!(
                "gateway returned {status}"
            )));
        }

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        match parsed.status.as_str() {
            "completed" | "success" => Ok(GatewayPaymentStatus::Completed),
            "failed" | "cancelled" | "expired" => Ok(GatewayPaymentStatus::Failed),
            _ => Ok(GatewayPaymentStatus::Pending),
        }
    }

    fn verify_signature(&self, raw_payload: &[u8], signature: &str) -> bool {
        verify_hmac_sha256_hex(&self.webhook_secret, raw_payload, signature)
    }
}
