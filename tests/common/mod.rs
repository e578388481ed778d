use std::sync::Arc;

use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set, Statement};
use uuid::Uuid;

use sokoni_api::{
    config::AppConfig,
    db::{create_orm_conn, create_pool},
    entity::products::{ActiveModel as ProductActive, Model as ProductModel},
    gateway::mock::{MOCK_WEBHOOK_SECRET, MockPaymentGateway},
    middleware::auth::Actor,
    state::AppState,
};

/// Database url from the environment, or `None` to skip the test.
pub fn test_database_url() -> Option<String> {
    match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!(
                "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
            );
            None
        }
    }
}

pub async fn setup_state(database_url: &str) -> anyhow::Result<(AppState, Arc<MockPaymentGateway>)> {
    let pool = create_pool(database_url).await?;
    let orm = create_orm_conn(database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    // Clean tables between runs
    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE delivery_locations, deliveries, webhook_events, inventory_movements, \
         order_items, payments, orders, audit_logs, products RESTART IDENTITY CASCADE",
    ))
    .await?;

    let gateway = Arc::new(MockPaymentGateway::new());
    let config = AppConfig {
        database_url: database_url.to_string(),
        host: "127.0.0.1".into(),
        port: 0,
        gateway_base_url: "http://localhost:9".into(),
        gateway_api_key: String::new(),
        gateway_webhook_secret: MOCK_WEBHOOK_SECRET.into(),
        payment_pending_timeout_minutes: 15,
        sweep_interval_seconds: 60,
        delivery_fee: 3000,
        free_delivery_threshold: 0,
    };

    let state = AppState {
        pool,
        orm,
        config: Arc::new(config),
        gateway: gateway.clone(),
    };
    Ok((state, gateway))
}

pub fn customer() -> Actor {
    Actor {
        actor_id: Uuid::new_v4(),
        role: "customer".into(),
    }
}

pub fn admin() -> Actor {
    Actor {
        actor_id: Uuid::new_v4(),
        role: "admin".into(),
    }
}

pub fn courier(courier_id: Uuid) -> Actor {
    Actor {
        actor_id: courier_id,
        role: "courier".into(),
    }
}

pub async fn create_product(
    state: &AppState,
    name: &str,
    price: i64,
    stock: i32,
) -> anyhow::Result<ProductModel> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        description: Set(None),
        unit: Set("kg".into()),
        price: Set(price),
        stock: Set(stock),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(product)
}

/// Synthetic gateway webhook body plus its valid signature.
pub fn signed_webhook(external_transaction_id: &str, status: &str, amount: i64) -> (Vec<u8>, String) {
    let body = serde_json::json!({
        "externalTransactionId": external_transaction_id,
        "status": status,
        "amount": amount,
        "currency": "TZS",
        "timestamp": chrono::Utc::now(),
    });
    let raw = serde_json::to_vec(&body).unwrap();
    let signature = MockPaymentGateway::sign(&raw);
    (raw, signature)
}
