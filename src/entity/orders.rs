use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub subtotal: i64,
    pub tax: i64,
    pub delivery_fee: i64,
    pub discount: i64,
    pub total_amount: i64,
    pub currency: String,
    pub status: String,
    pub payment_status: String,
    pub delivery_address: String,
    pub delivery_phone: String,
    pub delivery_window_start: Option<DateTimeWithTimeZone>,
    pub delivery_window_end: Option<DateTimeWithTimeZone>,
    pub delivery_notes: Option<String>,
    pub inventory_released: bool,
    pub cancel_reason: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_items::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::payments::Entity")]
    Payments,
    #[sea_orm(has_one = "super::deliveries::Entity")]
    Deliveries,
}

impl Related<super::order_items::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::payments::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl Related<super::deliveries::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Deliveries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
