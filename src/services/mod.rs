pub mod delivery_service;
pub mod inventory_service;
pub mod order_service;
pub mod reconciliation_service;
