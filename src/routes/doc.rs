use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        deliveries::{
            AssignCourierRequest, DeliveryDetail, LocationUpdateRequest, MarkDeliveredRequest,
            MarkFailedRequest, RateDeliveryRequest,
        },
        orders::{
            AdvanceStatusRequest, CancelOrderRequest, CreateOrderRequest, OrderDetail,
            OrderItemRequest, OrderList, WebhookEventList,
        },
        webhooks::{PaymentWebhook, WebhookAck},
    },
    models::{
        Delivery, DeliveryLocation, InventoryMovement, Order, OrderItem, Payment, Product,
        WebhookEvent,
    },
    response::{ApiResponse, Meta},
    routes::{admin, deliveries, health, orders, params, webhooks},
    services::reconciliation_service::SweepReport,
    status::{DeliveryStatus, OrderStatus, PaymentStatus},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        orders::create_order,
        orders::list_orders,
        orders::get_order,
        orders::cancel_order,
        orders::retry_payment,
        admin::list_all_orders,
        admin::get_order_admin,
        admin::advance_order_status,
        admin::assign_courier,
        admin::list_low_stock,
        admin::list_movements,
        admin::list_webhook_events,
        admin::run_sweep,
        deliveries::get_delivery,
        deliveries::mark_picked_up,
        deliveries::mark_in_transit,
        deliveries::record_location,
        deliveries::mark_delivered,
        deliveries::mark_failed,
        deliveries::rate_delivery,
        webhooks::payment_webhook
    ),
    components(
        schemas(
            Product,
            Order,
            OrderItem,
            Payment,
            Delivery,
            DeliveryLocation,
            InventoryMovement,
            WebhookEvent,
            OrderStatus,
            PaymentStatus,
            DeliveryStatus,
            OrderItemRequest,
            CreateOrderRequest,
            CancelOrderRequest,
            AdvanceStatusRequest,
            OrderDetail,
            OrderList,
            WebhookEventList,
            AssignCourierRequest,
            LocationUpdateRequest,
            MarkDeliveredRequest,
            MarkFailedRequest,
            RateDeliveryRequest,
            DeliveryDetail,
            PaymentWebhook,
            WebhookAck,
            SweepReport,
            admin::ProductList,
            admin::MovementList,
            admin::LowStockQuery,
            admin::WebhookEventQuery,
            params::Pagination,
            params::OrderListQuery,
            Meta,
            ApiResponse<Order>,
            ApiResponse<OrderDetail>,
            ApiResponse<OrderList>,
            ApiResponse<Delivery>,
            ApiResponse<DeliveryDetail>,
            ApiResponse<WebhookAck>,
            ApiResponse<SweepReport>,
            ApiResponse<admin::ProductList>,
            ApiResponse<admin::MovementList>,
            ApiResponse<WebhookEventList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Orders", description = "Customer order endpoints"),
        (name = "Deliveries", description = "Courier delivery endpoints"),
        (name = "Admin", description = "Admin endpoints"),
        (name = "Webhooks", description = "Inbound payment gateway callbacks"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
