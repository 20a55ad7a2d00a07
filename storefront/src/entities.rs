use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// SeaORM User entity (only what fulfillment needs: the delivery address
/// for the customer channel).
pub mod user {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "users")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub telegram_id: Option<String>,
        pub name: Option<String>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(has_many = "super::cart::Entity")]
        Carts,
        #[sea_orm(has_many = "super::order::Entity")]
        Orders,
    }

    impl Related<super::cart::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Carts.def()
        }
    }

    impl Related<super::order::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Orders.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// SeaORM Cart entity, unique per user.
pub mod cart {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "carts")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        #[sea_orm(unique)]
        pub user_id: i64,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::user::Entity",
            from = "Column::UserId",
            to = "super::user::Column::Id"
        )]
        User,
        #[sea_orm(has_many = "super::cart_item::Entity")]
        Items,
    }

    impl Related<super::user::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::User.def()
        }
    }

    impl Related<super::cart_item::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Items.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// SeaORM Cart item entity. Prices are the catalog view maintained by the
/// cart-editing collaborator: variant price when one is selected, product
/// base price otherwise.
pub mod cart_item {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "cart_items")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub cart_id: i64,
        pub product_id: i64,
        pub variant_id: Option<i64>,
        pub product_name: String,
        pub variant_name: Option<String>,
        pub base_price: Decimal,
        pub variant_price: Option<Decimal>,
        pub quantity: i32,
        pub attributes: Option<Json>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::cart::Entity",
            from = "Column::CartId",
            to = "super::cart::Column::Id"
        )]
        Cart,
    }

    impl Related<super::cart::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Cart.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// SeaORM Order entity. Statuses are stored as plain strings, parsed at the
/// storage boundary.
pub mod order {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "orders")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub user_id: i64,
        #[sea_orm(unique)]
        pub order_number: String,
        pub status: String,
        pub payment_status: String,
        pub total: Decimal,
        pub customer_name: String,
        pub customer_phone: String,
        pub customer_email: Option<String>,
        pub customer_address: String,
        pub comment: Option<String>,
        pub created_at: DateTimeUtc,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::user::Entity",
            from = "Column::UserId",
            to = "super::user::Column::Id"
        )]
        User,
        #[sea_orm(has_many = "super::order_item::Entity")]
        Items,
    }

    impl Related<super::user::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::User.def()
        }
    }

    impl Related<super::order_item::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Items.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// SeaORM Order item entity: the immutable checkout snapshot.
pub mod order_item {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "order_items")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub order_id: i64,
        pub product_id: i64,
        pub variant_id: Option<i64>,
        pub product_name: String,
        pub variant_name: Option<String>,
        pub price: Decimal,
        pub quantity: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::order::Entity",
            from = "Column::OrderId",
            to = "super::order::Column::Id"
        )]
        Order,
    }

    impl Related<super::order::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Order.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// SeaORM AbandonedCart entity, unique per cart. The unique key is what
/// makes concurrent sweeps upsert instead of duplicating.
pub mod abandoned_cart {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "abandoned_carts")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        #[sea_orm(unique)]
        pub cart_id: i64,
        pub user_id: i64,
        pub items_count: i32,
        pub total_amount: Decimal,
        pub recovered: bool,
        pub recovered_at: Option<DateTimeUtc>,
        pub reminder_sent: i32,
        pub last_reminder_at: Option<DateTimeUtc>,
        pub created_at: DateTimeUtc,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::cart::Entity",
            from = "Column::CartId",
            to = "super::cart::Column::Id"
        )]
        Cart,
    }

    impl Related<super::cart::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Cart.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// SeaORM singleton row for the reminder settings.
pub mod abandoned_cart_settings {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "abandoned_cart_settings")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub auto_reminders_enabled: bool,
        pub reminder_interval_hours: i64,
        pub max_reminders: i32,
        pub initial_delay_hours: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
