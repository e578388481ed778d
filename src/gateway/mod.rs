//! Payment gateway boundary.
//!
//! The order engine only ever talks to [`PaymentGateway`]; the concrete wire
//! format of the mobile-money provider stays behind [`http::HttpPaymentGateway`].

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod mock;

pub use http::HttpPaymentGateway;
pub use mock::MockPaymentGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transient failure, safe to retry with backoff.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// Permanent rejection (invalid phone, unsupported method). Never retried.
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

/// Request to start collecting a payment for an order.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub order_id: Uuid,
    pub order_number: String,
    pub amount: i64,
    pub currency: String,
    pub method: String,
    pub customer_phone: String,
}

#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    pub external_transaction_id: String,
    pub checkout_reference: String,
}

/// Final status as reported by the gateway when polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiatedPayment, GatewayError>;

    /// Poll the gateway for the final status of a transaction; used by the
    /// pending-payment sweep when a webhook never arrived.
    async fn query_status(
        &self,
        external_transaction_id: &str,
    ) -> Result<GatewayPaymentStatus, GatewayError>;

    /// Check the webhook signature over the raw body. An unverifiable payload
    /// must be dropped before it touches any state.
    fn verify_signature(&self, raw_payload: &[u8], signature: &str) -> bool;
}

/// Hex-encoded HMAC-SHA256 over a raw payload. Shared by the real gateway,
/// the mock, and the tests that sign synthetic webhooks.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex-encoded HMAC-SHA256 signature. Malformed hex
/// fails closed.
pub fn verify_hmac_sha256_hex(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_and_hex() {
        let sig = hmac_sha256_hex("secret", b"{\"a\":1}");
        assert_eq!(sig, hmac_sha256_hex("secret", b"{\"a\":1}"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_depends_on_secret_and_payload() {
        let sig = hmac_sha256_hex("secret", b"payload");
        assert_ne!(sig, hmac_sha256_hex("other", b"payload"));
        assert_ne!(sig, hmac_sha256_hex("secret", b"payload2"));
    }

    #[test]
    fn verification_tolerates_case_and_whitespace() {
        let sig = hmac_sha256_hex("secret", b"payload");
        assert!(verify_hmac_sha256_hex("secret", b"payload", &sig));
        assert!(verify_hmac_sha256_hex("secret", b"payload", &sig.to_uppercase()));
        assert!(verify_hmac_sha256_hex("secret", b"payload", &format!(" {sig} ")));
    }

    #[test]
    fn verification_rejects_tampered_and_malformed_signatures() {
        let sig = hmac_sha256_hex("secret", b"payload");
        assert!(!verify_hmac_sha256_hex("other", b"payload", &sig));
        assert!(!verify_hmac_sha256_hex("secret", b"tampered", &sig));
        assert!(!verify_hmac_sha256_hex("secret", b"payload", "not hex at all"));
        assert!(!verify_hmac_sha256_hex("secret", b"payload", "deadbeef"));
    }
}
