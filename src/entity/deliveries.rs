use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "deliveries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub courier_phone: String,
    pub status: String,
    pub assigned_at: DateTimeWithTimeZone,
    pub picked_up_at: Option<DateTimeWithTimeZone>,
    pub delivered_at: Option<DateTimeWithTimeZone>,
    pub failure_reason: Option<String>,
    pub rating: Option<i32>,
    pub feedback: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::orders::Entity",
        from = "Column::OrderId",
        to = "super::orders::Column::Id"
    )]
    Orders,
    #[sea_orm(has_many = "super::delivery_locations::Entity")]
    DeliveryLocations,
}

impl Related<super::orders::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl Related<super::delivery_locations::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeliveryLocations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
