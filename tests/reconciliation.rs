mod common;

use sokoni_api::{
    dto::orders::{CancelOrderRequest, CreateOrderRequest, OrderItemRequest},
    error::AppError,
    gateway::GatewayPaymentStatus,
    services::{order_service, reconciliation_service},
};

fn simple_order(product_id: uuid::Uuid, quantity: i32) -> CreateOrderRequest {
    CreateOrderRequest {
        items: vec![OrderItemRequest {
            product_id,
            quantity,
        }],
        delivery_address: "Ubungo".into(),
        delivery_phone: "+255700000010".into(),
        delivery_window_start: None,
        delivery_window_end: None,
        delivery_notes: None,
        payment_method: "mobile_money".into(),
    }
}

#[tokio::test]
async fn completed_webhook_is_idempotent() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let sugar = common::create_product(&state, "Sukari", 3000, 10).await?;
    let customer = common::customer();

    let created = order_service::create_order(&state, &customer, simple_order(sugar.id, 2))
        .await?
        .data
        .unwrap();
    let external_id = gateway.initiated_ids()[0].clone();

    let (raw, sig) = common::signed_webhook(&external_id, "completed", created.order.total_amount);
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
            .await?
            .data
            .unwrap();
        outcomes.push(ack.outcome);
    }
    assert_eq!(outcomes, vec!["applied", "duplicate", "duplicate"]);

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "confirmed");
    assert_eq!(detail.order.payment_status, "completed");

    // Reservation applied exactly once.
    let stock: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(sugar.id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(stock.0, 8);

    // Every delivery attempt is on record.
    let events: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM webhook_events WHERE external_transaction_id = $1",
    )
    .bind(&external_id)
    .fetch_one(&state.pool)
    .await?;
    assert_eq!(events.0, 3);

    Ok(())
}

#[tokio::test]
async fn webhook_with_bad_signature_is_dropped() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let flour = common::create_product(&state, "Unga", 2800, 10).await?;
    let customer = common::customer();
    order_service::create_order(&state, &customer, simple_order(flour.id, 1)).await?;
    let external_id = gateway.initiated_ids()[0].clone();

    let (raw, _) = common::signed_webhook(&external_id, "completed", 5_800);
    let err = reconciliation_service::handle_webhook(&state, &raw, Some("deadbeef"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidSignature));

    let err = reconciliation_service::handle_webhook(&state, &raw, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidSignature));

    // Nothing recorded, nothing applied.
    let events: (i64,) = sqlx::query_as("SELECT count(*) FROM webhook_events")
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(events.0, 0);

    Ok(())
}

#[tokio::test]
async fn orphan_and_mismatched_webhooks_are_recorded_not_applied() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let tea = common::create_product(&state, "Chai", 3500, 10).await?;
    let customer = common::customer();
    let created = order_service::create_order(&state, &customer, simple_order(tea.id, 1))
        .await?
        .data
        .unwrap();
    let external_id = gateway.initiated_ids()[0].clone();

    // Unknown transaction id.
    let (raw, sig) = common::signed_webhook("MM-unknown", "completed", 6_500);
    let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
        .await?
        .data
        .unwrap();
    assert_eq!(ack.outcome, "orphan");

    // Amount disagrees with the payment record.
    let (raw, sig) = common::signed_webhook(&external_id, "completed", 1);
    let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
        .await?
        .data
        .unwrap();
    assert_eq!(ack.outcome, "anomaly");

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "pending");
    assert_eq!(detail.order.payment_status, "processing");

    Ok(())
}

#[tokio::test]
async fn reservation_is_all_or_nothing() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, _gateway) = common::setup_state(&database_url).await?;

    let rice = common::create_product(&state, "Mchele", 3200, 10).await?;
    let oil = common::create_product(&state, "Mafuta", 7500, 1).await?;
    let customer = common::customer();

    let err = order_service::create_order(
        &state,
        &customer,
        CreateOrderRequest {
            items: vec![
                OrderItemRequest {
                    product_id: rice.id,
                    quantity: 2,
                },
                OrderItemRequest {
                    product_id: oil.id,
                    quantity: 3,
                },
            ],
            delivery_address: "Tabata".into(),
            delivery_phone: "+255700000011".into(),
            delivery_window_start: None,
            delivery_window_end: None,
            delivery_notes: None,
            payment_method: "mobile_money".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock { product_id } if product_id == oil.id));

    // The rice reservation rolled back with the transaction.
    let stocks: Vec<(i32,)> = sqlx::query_as("SELECT stock FROM products ORDER BY stock")
        .fetch_all(&state.pool)
        .await?;
    assert_eq!(stocks, vec![(1,), (10,)]);

    let orders: (i64,) = sqlx::query_as("SELECT count(*) FROM orders")
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(orders.0, 0);

    Ok(())
}

#[tokio::test]
async fn failed_webhook_cancels_order_and_releases_stock_once() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let eggs = common::create_product(&state, "Mayai", 10_500, 6).await?;
    let customer = common::customer();
    let created = order_service::create_order(&state, &customer, simple_order(eggs.id, 2))
        .await?
        .data
        .unwrap();
    let external_id = gateway.initiated_ids()[0].clone();

    let (raw, sig) = common::signed_webhook(&external_id, "failed", created.order.total_amount);
    let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
        .await?
        .data
        .unwrap();
    assert_eq!(ack.outcome, "applied");

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "cancelled");
    assert_eq!(detail.order.payment_status, "failed");

    let stock: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(eggs.id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(stock.0, 6);

    // A racing customer cancel must not release the reservation a second time.
    let err = order_service::cancel_order(
        &state,
        &customer,
        created.order.id,
        CancelOrderRequest {
            reason: "too slow".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::IllegalTransition { .. }));

    let movements: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM inventory_movements WHERE product_id = $1",
    )
    .bind(eggs.id)
    .fetch_one(&state.pool)
    .await?;
    assert_eq!(movements.0, 2); // one reservation, one release

    // A replayed failure webhook is a no-op.
    let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
        .await?
        .data
        .unwrap();
    assert_eq!(ack.outcome, "duplicate");

    Ok(())
}

#[tokio::test]
async fn concurrent_cancel_and_completed_webhook_settle_cleanly() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let milk = common::create_product(&state, "Maziwa", 2600, 7).await?;
    let customer = common::customer();
    let created = order_service::create_order(&state, &customer, simple_order(milk.id, 2))
        .await?
        .data
        .unwrap();
    let external_id = gateway.initiated_ids()[0].clone();
    let (raw, sig) = common::signed_webhook(&external_id, "completed", created.order.total_amount);

    // Customer cancels while the gateway confirms; whichever transaction wins
    // the order row, neither request may abort.
    let cancel = order_service::cancel_order(
        &state,
        &customer,
        created.order.id,
        CancelOrderRequest {
            reason: "changed my mind".into(),
        },
    );
    let webhook = reconciliation_service::handle_webhook(&state, &raw, Some(&sig));
    let (cancelled, ack) = tokio::join!(cancel, webhook);

    let cancelled = cancelled?.data.unwrap();
    assert_eq!(cancelled.status, "cancelled");
    let ack = ack?.data.unwrap();
    assert!(
        ack.outcome == "applied" || ack.outcome == "anomaly",
        "unexpected webhook outcome {}",
        ack.outcome
    );

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "cancelled");
    let payment = detail.payment.unwrap();
    if ack.outcome == "applied" {
        // Webhook won: the payment completed before the cancellation.
        assert_eq!(payment.status, "completed");
        assert_eq!(detail.order.payment_status, "completed");
    } else {
        // Cancellation won: the open attempt was settled and the late
        // confirmation landed as an anomaly.
        assert_eq!(payment.status, "cancelled");
        assert_eq!(detail.order.payment_status, "cancelled");
    }

    // The reservation is compensated exactly once either way.
    let stock: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(milk.id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(stock.0, 7);

    let movements: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM inventory_movements WHERE product_id = $1",
    )
    .bind(milk.id)
    .fetch_one(&state.pool)
    .await?;
    assert_eq!(movements.0, 2); // one reservation, one release

    Ok(())
}

#[tokio::test]
async fn sweep_times_out_stuck_payments_and_late_webhook_is_an_anomaly() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let onions = common::create_product(&state, "Vitunguu", 2200, 8).await?;
    let customer = common::customer();
    let created = order_service::create_order(&state, &customer, simple_order(onions.id, 3))
        .await?
        .data
        .unwrap();
    let external_id = gateway.initiated_ids()[0].clone();

    // No webhook ever arrives and the gateway still reports pending.
    gateway.set_status(&external_id, GatewayPaymentStatus::Pending);
    sqlx::query("UPDATE payments SET initiated_at = now() - interval '1 hour'")
        .execute(&state.pool)
        .await?;

    let report = reconciliation_service::run_pending_sweep(&state).await?;
    assert_eq!(report.examined, 1);
    assert_eq!(report.failed, 1);

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "cancelled");
    assert_eq!(detail.order.payment_status, "failed");

    let stock: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(onions.id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(stock.0, 8);

    // The money arrives after all: flagged for manual review, never applied.
    let (raw, sig) = common::signed_webhook(&external_id, "completed", created.order.total_amount);
    let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
        .await?
        .data
        .unwrap();
    assert_eq!(ack.outcome, "anomaly");

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "cancelled");

    Ok(())
}

#[tokio::test]
async fn sweep_resolves_payments_the_gateway_completed() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let bananas = common::create_product(&state, "Ndizi", 5000, 5).await?;
    let customer = common::customer();
    let created = order_service::create_order(&state, &customer, simple_order(bananas.id, 1))
        .await?
        .data
        .unwrap();
    let external_id = gateway.initiated_ids()[0].clone();

    gateway.set_status(&external_id, GatewayPaymentStatus::Completed);
    sqlx::query("UPDATE payments SET initiated_at = now() - interval '1 hour'")
        .execute(&state.pool)
        .await?;

    let report = reconciliation_service::run_pending_sweep(&state).await?;
    assert_eq!(report.completed, 1);

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "confirmed");
    assert_eq!(detail.order.payment_status, "completed");

    Ok(())
}

#[tokio::test]
async fn sweep_cancels_orders_whose_initiation_never_succeeded() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let tomatoes = common::create_product(&state, "Nyanya", 2500, 9).await?;
    let customer = common::customer();

    gateway.fail_unavailable();
    let created = order_service::create_order(&state, &customer, simple_order(tomatoes.id, 4))
        .await?
        .data
        .unwrap();
    // Initiation retries were exhausted; the order waits for a retry or sweep.
    assert_eq!(created.order.status, "pending");
    assert_eq!(created.order.payment_status, "failed");

    sqlx::query("UPDATE orders SET updated_at = now() - interval '1 hour'")
        .execute(&state.pool)
        .await?;

    let report = reconciliation_service::run_pending_sweep(&state).await?;
    assert_eq!(report.stale_orders_cancelled, 1);

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "cancelled");

    let stock: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(tomatoes.id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(stock.0, 9);

    Ok(())
}

#[tokio::test]
async fn retry_payment_opens_a_fresh_attempt() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let bread = common::create_product(&state, "Mkate", 1700, 10).await?;
    let customer = common::customer();

    gateway.fail_unavailable();
    let created = order_service::create_order(&state, &customer, simple_order(bread.id, 1))
        .await?
        .data
        .unwrap();
    assert_eq!(created.order.payment_status, "failed");

    gateway.succeed();
    let retried = order_service::retry_payment(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(retried.order.payment_status, "processing");
    let payment = retried.payment.unwrap();
    assert_eq!(payment.status, "processing");
    let external_id = payment.external_transaction_id.unwrap();

    let (raw, sig) = common::signed_webhook(&external_id, "completed", created.order.total_amount);
    let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
        .await?
        .data
        .unwrap();
    assert_eq!(ack.outcome, "applied");

    let detail = order_service::get_order(&state, &customer, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "confirmed");

    Ok(())
}
