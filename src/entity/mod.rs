pub mod audit_logs;
pub mod deliveries;
pub mod delivery_locations;
pub mod inventory_movements;
pub mod order_items;
pub mod orders;
pub mod payments;
pub mod products;
pub mod webhook_events;

pub use audit_logs::Entity as AuditLogs;
pub use deliveries::Entity as Deliveries;
pub use delivery_locations::Entity as DeliveryLocations;
pub use inventory_movements::Entity as InventoryMovements;
pub use order_items::Entity as OrderItems;
pub use orders::Entity as Orders;
pub use payments::Entity as Payments;
pub use products::Entity as Products;
pub use webhook_events::Entity as WebhookEvents;
