//! Typed order, payment and delivery state machines.
//!
//! Statuses are stored as strings in the database; every transition decision
//! goes through the predicates here so no handler compares raw strings.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    ReadyForPickup,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::ReadyForPickup => "ready_for_pickup",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "preparing" => Some(OrderStatus::Preparing),
            "ready_for_pickup" => Some(OrderStatus::ReadyForPickup),
            "out_for_delivery" => Some(OrderStatus::OutForDelivery),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Forward transitions of the order state machine. Cancellation is not a
    /// forward transition; see [`OrderStatus::can_cancel`].
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Confirmed)
                | (OrderStatus::Confirmed, OrderStatus::Preparing)
                | (OrderStatus::Preparing, OrderStatus::ReadyForPickup)
                | (OrderStatus::ReadyForPickup, OrderStatus::OutForDelivery)
                | (OrderStatus::OutForDelivery, OrderStatus::Delivered)
        )
    }

    /// Orders already handed to a courier can no longer be cancelled.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Confirmed
                | OrderStatus::Preparing
                | OrderStatus::ReadyForPickup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "processing" => Some(PaymentStatus::Processing),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "cancelled" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed is sticky: once a payment completes nothing may overwrite it.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Failed | PaymentStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Assigned => "assigned",
            DeliveryStatus::PickedUp => "picked_up",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assigned" => Some(DeliveryStatus::Assigned),
            "picked_up" => Some(DeliveryStatus::PickedUp),
            "in_transit" => Some(DeliveryStatus::InTransit),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }

    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (DeliveryStatus::Assigned, DeliveryStatus::PickedUp) => true,
            (DeliveryStatus::PickedUp, DeliveryStatus::InTransit) => true,
            (DeliveryStatus::InTransit, DeliveryStatus::Delivered) => true,
            // A courier can report failure at any point before completion.
            (from, DeliveryStatus::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_happy_path_is_legal() {
        let path = [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Preparing,
            OrderStatus::ReadyForPickup,
            OrderStatus::OutForDelivery,
            OrderStatus::Delivered,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn order_cannot_skip_or_go_back() {
        assert!(!OrderStatus::Pending.can_advance_to(OrderStatus::Preparing));
        assert!(!OrderStatus::Confirmed.can_advance_to(OrderStatus::Pending));
        assert!(!OrderStatus::Delivered.can_advance_to(OrderStatus::Pending));
        assert!(!OrderStatus::Cancelled.can_advance_to(OrderStatus::Confirmed));
    }

    #[test]
    fn cancellation_stops_at_handover() {
        assert!(OrderStatus::Pending.can_cancel());
        assert!(OrderStatus::ReadyForPickup.can_cancel());
        assert!(!OrderStatus::OutForDelivery.can_cancel());
        assert!(!OrderStatus::Delivered.can_cancel());
        assert!(!OrderStatus::Cancelled.can_cancel());
    }

    #[test]
    fn completed_payment_is_settled() {
        assert!(PaymentStatus::Completed.is_settled());
        assert!(PaymentStatus::Failed.is_settled());
        assert!(!PaymentStatus::Pending.is_settled());
        assert!(!PaymentStatus::Processing.is_settled());
    }

    #[test]
    fn delivery_failure_reachable_from_non_terminal_only() {
        assert!(DeliveryStatus::Assigned.can_advance_to(DeliveryStatus::Failed));
        assert!(DeliveryStatus::InTransit.can_advance_to(DeliveryStatus::Failed));
        assert!(!DeliveryStatus::Delivered.can_advance_to(DeliveryStatus::Failed));
        assert!(!DeliveryStatus::Failed.can_advance_to(DeliveryStatus::Failed));
    }

    #[test]
    fn delivery_cannot_skip_pickup() {
        assert!(!DeliveryStatus::Assigned.can_advance_to(DeliveryStatus::InTransit));
        assert!(!DeliveryStatus::Assigned.can_advance_to(DeliveryStatus::Delivered));
        assert!(!DeliveryStatus::PickedUp.can_advance_to(DeliveryStatus::Delivered));
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Preparing,
            OrderStatus::ReadyForPickup,
            OrderStatus::OutForDelivery,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::parse("paid"), None);
    }
}
