mod common;

use chrono::{Duration, Utc};
use sokoni_api::{
    dto::{
        deliveries::{
            AssignCourierRequest, LocationUpdateRequest, MarkDeliveredRequest, RateDeliveryRequest,
        },
        orders::{AdvanceStatusRequest, CancelOrderRequest, CreateOrderRequest, OrderItemRequest},
    },
    services::{delivery_service, order_service, reconciliation_service},
    status::OrderStatus,
};
use uuid::Uuid;

// Full happy path: create -> webhook confirms payment -> admin prepares ->
// courier delivers, with out-of-order location updates along the way.
#[tokio::test]
async fn order_payment_and_delivery_flow() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let rice = common::create_product(&state, "Mchele", 3500, 20).await?;
    let bread = common::create_product(&state, "Mkate", 1200, 10).await?;

    let customer = common::customer();
    let admin = common::admin();

    let created = order_service::create_order(
        &state,
        &customer,
        CreateOrderRequest {
            items: vec![
                OrderItemRequest {
                    product_id: rice.id,
                    quantity: 3,
                },
                OrderItemRequest {
                    product_id: bread.id,
                    quantity: 1,
                },
            ],
            delivery_address: "Kariakoo, Dar es Salaam".into(),
            delivery_phone: "+255700000001".into(),
            delivery_window_start: None,
            delivery_window_end: None,
            delivery_notes: None,
            payment_method: "mobile_money".into(),
        },
    )
    .await?
    .data
    .unwrap();

    let order = created.order;
    assert_eq!(order.subtotal, 11_700);
    assert_eq!(order.delivery_fee, 3_000);
    assert_eq!(order.total_amount, 14_700);
    assert_eq!(order.status, "pending");
    assert_eq!(order.payment_status, "processing");

    // Reservation is immediate.
    let rice_after = order_service::get_order(&state, &customer, order.id).await?;
    let payment = rice_after.data.unwrap().payment.unwrap();
    let external_id = payment.external_transaction_id.clone().unwrap();
    assert_eq!(gateway.initiated_ids(), vec![external_id.clone()]);

    // Gateway confirms the collection.
    let (raw, sig) = common::signed_webhook(&external_id, "completed", order.total_amount);
    let ack = reconciliation_service::handle_webhook(&state, &raw, Some(&sig))
        .await?
        .data
        .unwrap();
    assert_eq!(ack.outcome, "applied");

    let detail = order_service::get_order(&state, &customer, order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "confirmed");
    assert_eq!(detail.order.payment_status, "completed");
    assert_eq!(detail.payment.unwrap().status, "completed");

    // Admin walks the order to the handover point.
    for status in [OrderStatus::Preparing, OrderStatus::ReadyForPickup] {
        order_service::advance_status(
            &state,
            &admin,
            order.id,
            AdvanceStatusRequest {
                status,
                notes: None,
            },
        )
        .await?;
    }

    // Handover to a courier flips the order to out_for_delivery.
    let courier_id = Uuid::new_v4();
    let delivery = delivery_service::assign_courier(
        &state,
        &admin,
        AssignCourierRequest {
            order_id: order.id,
            courier_id,
            courier_phone: "+255700000099".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(delivery.status, "assigned");

    let detail = order_service::get_order(&state, &customer, order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "out_for_delivery");

    let courier = common::courier(courier_id);
    delivery_service::mark_picked_up(&state, &courier, delivery.id).await?;
    delivery_service::mark_in_transit(&state, &courier, delivery.id).await?;

    // Location updates arrive out of order; current position follows the
    // recorded timestamp, not arrival order.
    let now = Utc::now();
    let points = [
        (-6.8160, 39.2800, now - Duration::minutes(2)),
        (-6.8235, 39.2695, now), // latest capture, sent second
        (-6.8200, 39.2750, now - Duration::minutes(1)),
    ];
    for (lat, lon, recorded_at) in points {
        delivery_service::record_location(
            &state,
            &courier,
            delivery.id,
            LocationUpdateRequest {
                lat,
                lon,
                recorded_at,
                note: None,
            },
        )
        .await?;
    }

    let current = delivery_service::get_delivery(&state, &courier, delivery.id)
        .await?
        .data
        .unwrap()
        .current_location
        .unwrap();
    assert_eq!(current.lat, -6.8235);
    assert_eq!(current.lon, 39.2695);

    let done = delivery_service::mark_delivered(
        &state,
        &courier,
        delivery.id,
        MarkDeliveredRequest { proof: None },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(done.status, "delivered");

    let detail = order_service::get_order(&state, &customer, order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.order.status, "delivered");

    // Customer can rate only after delivery.
    let rated = delivery_service::rate_delivery(
        &state,
        &customer,
        delivery.id,
        RateDeliveryRequest {
            rating: 5,
            feedback: Some("Asante sana".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(rated.rating, Some(5));

    Ok(())
}

#[tokio::test]
async fn cancel_releases_stock_and_settles_payment() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, _gateway) = common::setup_state(&database_url).await?;

    let beans = common::create_product(&state, "Maharage", 4000, 5).await?;
    let customer = common::customer();

    let created = order_service::create_order(
        &state,
        &customer,
        CreateOrderRequest {
            items: vec![OrderItemRequest {
                product_id: beans.id,
                quantity: 2,
            }],
            delivery_address: "Mwenge".into(),
            delivery_phone: "+255700000002".into(),
            delivery_window_start: None,
            delivery_window_end: None,
            delivery_notes: None,
            payment_method: "mobile_money".into(),
        },
    )
    .await?
    .data
    .unwrap();

    let stock: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(beans.id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(stock.0, 3);

    let cancelled = order_service::cancel_order(
        &state,
        &customer,
        created.order.id,
        CancelOrderRequest {
            reason: "changed my mind".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(cancelled.status, "cancelled");
    assert_eq!(cancelled.payment_status, "cancelled");
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("changed my mind"));

    let stock: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(beans.id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(stock.0, 5);

    Ok(())
}

#[tokio::test]
async fn cash_on_delivery_skips_the_gateway() -> anyhow::Result<()> {
    let Some(database_url) = common::test_database_url() else {
        return Ok(());
    };
    let (state, gateway) = common::setup_state(&database_url).await?;

    let milk = common::create_product(&state, "Maziwa", 2600, 10).await?;
    let customer = common::customer();
    let admin = common::admin();

    let created = order_service::create_order(
        &state,
        &customer,
        CreateOrderRequest {
            items: vec![OrderItemRequest {
                product_id: milk.id,
                quantity: 1,
            }],
            delivery_address: "Sinza".into(),
            delivery_phone: "+255700000003".into(),
            delivery_window_start: None,
            delivery_window_end: None,
            delivery_notes: None,
            payment_method: "cash_on_delivery".into(),
        },
    )
    .await?
    .data
    .unwrap();

    assert!(gateway.initiated_ids().is_empty());
    assert_eq!(created.order.payment_status, "completed");
    assert_eq!(created.order.status, "pending");
    assert_eq!(created.payment.unwrap().status, "completed");

    // Payment is settled, so the admin can confirm straight away.
    let confirmed = order_service::advance_status(
        &state,
        &admin,
        created.order.id,
        AdvanceStatusRequest {
            status: OrderStatus::Confirmed,
            notes: None,
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(confirmed.status, "confirmed");

    Ok(())
}
