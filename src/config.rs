use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    pub gateway_webhook_secret: String,
    /// Payments still pending after this many minutes are swept.
    pub payment_pending_timeout_minutes: i64,
    pub sweep_interval_seconds: u64,
    /// Flat delivery fee in TZS, snapshotted onto the order at creation.
    pub delivery_fee: i64,
    /// Item subtotal at or above which the delivery fee is waived. 0 disables.
    pub free_delivery_threshold: i64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3000);
        let gateway_base_url =
            env::var("GATEWAY_BASE_URL").unwrap_or_else(|_| "http://localhost:9000".to_string());
        let gateway_api_key = env::var("GATEWAY_API_KEY").unwrap_or_default();
        let gateway_webhook_secret = env::var("GATEWAY_WEBHOOK_SECRET")?;
        let payment_pending_timeout_minutes = env::var("PAYMENT_PENDING_TIMEOUT_MINUTES")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(15);
        let sweep_interval_seconds = env::var("SWEEP_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        let delivery_fee = env::var("DELIVERY_FEE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(3000);
        let free_delivery_threshold = env::var("FREE_DELIVERY_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(Self {
            database_url,
            host,
            port,
            gateway_base_url,
            gateway_api_key,
            gateway_webhook_secret,
            payment_pending_timeout_minutes,
            sweep_interval_seconds,
            delivery_fee,
            free_delivery_threshold,
        })
    }
}
