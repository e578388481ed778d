//! In-process gateway used by the integration tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    GatewayError, GatewayPaymentStatus, InitiateRequest, InitiatedPayment, PaymentGateway,
    hmac_sha256_hex, verify_hmac_sha256_hex,
};

pub const MOCK_WEBHOOK_SECRET: &str = "mock-webhook-secret";

#[derive(Debug, Clone, Copy)]
enum InitiateMode {
    Succeed,
    Unavailable,
    Reject,
}

pub struct MockPaymentGateway {
    mode: Mutex<InitiateMode>,
    statuses: Mutex<HashMap<String, GatewayPaymentStatus>>,
    initiated: Mutex<Vec<String>>,
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(InitiateMode::Succeed),
            statuses: Mutex::new(HashMap::new()),
            initiated: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_unavailable(&self) {
        *self.mode.lock().unwrap() = InitiateMode::Unavailable;
    }

    pub fn fail_rejected(&self) {
        *self.mode.lock().unwrap() = InitiateMode::Reject;
    }

    pub fn succeed(&self) {
        *self.mode.lock().unwrap() = InitiateMode::Succeed;
    }

    /// Set the status returned by `query_status`, as the sweep would see it.
    pub fn set_status(&self, external_transaction_id: &str, status: GatewayPaymentStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(external_transaction_id.to_string(), status);
    }

    /// External transaction ids handed out so far, in order.
    pub fn initiated_ids(&self) -> Vec<String> {
        self.initiated.lock().unwrap().clone()
    }

    /// Sign a payload the way the mock expects webhooks to be signed.
    pub fn sign(payload: &[u8]) -> String {
        hmac_sha256_hex(MOCK_WEBHOOK_SECRET, payload)
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn initiate(&self, _request: &InitiateRequest) -> Result<InitiatedPayment, GatewayError> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            InitiateMode::Succeed => {
                let id = format!("MM-{}", Uuid::new_v4().simple());
                self.initiated.lock().unwrap().push(id.clone());
                self.statuses
                    .lock()
                    .unwrap()
                    .insert(id.clone(), GatewayPaymentStatus::Pending);
                Ok(InitiatedPayment {
                    external_transaction_id: id.clone(),
                    checkout_reference: format!("CHK-{id}"),
                })
            }
            InitiateMode::Unavailable => {
                Err(GatewayError::Unavailable("mock gateway offline".into()))
            }
            InitiateMode::Reject => Err(GatewayError::Rejected("invalid msisdn".into())),
        }
    }

    async fn query_status(
        &self,
        external_transaction_id: &str,
    ) -> Result<GatewayPaymentStatus, GatewayError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(external_transaction_id)
            .copied()
            .unwrap_or(GatewayPaymentStatus::Failed))
    }

    fn verify_signature(&self, raw_payload: &[u8], signature: &str) -> bool {
        verify_hmac_sha256_hex(MOCK_WEBHOOK_SECRET, raw_payload, signature)
    }
}
