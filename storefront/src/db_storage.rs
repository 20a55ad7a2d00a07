use std::error::Error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, NotSet,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use tracing::{debug, info};

use crate::entities::{abandoned_cart, abandoned_cart_settings, cart, cart_item, order, order_item, user};
use crate::model::{
    AbandonedCart, Cart, CartItem, ModelId, Order, OrderItem, OrderStatus, PaymentStatus,
    ReminderSettings,
};
use crate::storage::{
    AbandonedCartStorage, CartStorage, OrderDraft, OrderStorage, ReminderCandidate,
    SettingsStorage, StorageResult,
};

/// SeaORM-backed implementation of every storage port.
///
/// Domain upserts ride on the unique keys (cart id, user id) so concurrent
/// sweeps and overlapping writers converge on one row instead of racing.
pub struct DbStore {
    db: DatabaseConnection,
}

impl DbStore {
    pub async fn connect(database_url: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        info!("connecting to the fulfillment database");
        let db = Database::connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn load_order(&self, model: order::Model) -> StorageResult<Order> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(model.id))
            .all(&self.db)
            .await?;
        order_from_models(model, items)
    }

    async fn hydrate_cart(&self, model: cart::Model) -> StorageResult<Cart> {
        let items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(model.id))
            .all(&self.db)
            .await?;
        let owner = user::Entity::find_by_id(model.user_id).one(&self.db).await?;

        Ok(Cart {
            id: model.id,
            user_id: model.user_id,
            telegram_id: owner.and_then(|owner| owner.telegram_id),
            items: items
                .into_iter()
                .map(|item| CartItem {
                    product_id: item.product_id,
                    variant_id: item.variant_id,
                    product_name: item.product_name,
                    variant_name: item.variant_name,
                    base_price: item.base_price,
                    variant_price: item.variant_price,
                    quantity: item.quantity,
                    attributes: item.attributes,
                })
                .collect(),
            updated_at: model.updated_at,
        })
    }
}

fn order_from_models(model: order::Model, items: Vec<order_item::Model>) -> StorageResult<Order> {
    let status: OrderStatus = model
        .status
        .parse()
        .map_err(|_| format!("unknown order status {:?}", model.status))?;
    let payment_status: PaymentStatus = model
        .payment_status
        .parse()
        .map_err(|_| format!("unknown payment status {:?}", model.payment_status))?;

    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        order_number: model.order_number,
        status,
        payment_status,
        total: model.total,
        customer_name: model.customer_name,
        customer_phone: model.customer_phone,
        customer_email: model.customer_email,
        customer_address: model.customer_address,
        comment: model.comment,
        items: items
            .into_iter()
            .map(|item| OrderItem {
                product_id: item.product_id,
                variant_id: item.variant_id,
                product_name: item.product_name,
                variant_name: item.variant_name,
                price: item.price,
                quantity: item.quantity,
            })
            .collect(),
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn abandoned_from_model(model: abandoned_cart::Model) -> AbandonedCart {
    AbandonedCart {
        id: model.id,
        cart_id: model.cart_id,
        user_id: model.user_id,
        items_count: model.items_count,
        total_amount: model.total_amount,
        recovered: model.recovered,
        recovered_at: model.recovered_at,
        reminder_sent: model.reminder_sent,
        last_reminder_at: model.last_reminder_at,
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

#[async_trait]
impl OrderStorage for DbStore {
    async fn insert_order(&self, draft: OrderDraft) -> StorageResult<Order> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: NotSet,
            user_id: Set(draft.user_id),
            order_number: Set(draft.order_number.clone()),
            status: Set(draft.status.to_string()),
            payment_status: Set(draft.payment_status.to_string()),
            total: Set(draft.total),
            customer_name: Set(draft.customer_name.clone()),
            customer_phone: Set(draft.customer_phone.clone()),
            customer_email: Set(draft.customer_email.clone()),
            customer_address: Set(draft.customer_address.clone()),
            comment: Set(draft.comment.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let order = order.insert(&txn).await?;

        for item in &draft.items {
            let item = order_item::ActiveModel {
                id: NotSet,
                order_id: Set(order.id),
                product_id: Set(item.product_id),
                variant_id: Set(item.variant_id),
                product_name: Set(item.product_name.clone()),
                variant_name: Set(item.variant_name.clone()),
                price: Set(item.price),
                quantity: Set(item.quantity),
            };
            item.insert(&txn).await?;
        }

        txn.commit().await?;
        debug!("persisted order #{}", draft.order_number);

        self.load_order(order).await
    }

    async fn get_order(&self, id: ModelId) -> StorageResult<Option<Order>> {
        match order::Entity::find_by_id(id).one(&self.db).await? {
            Some(model) => Ok(Some(self.load_order(model).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_number(&self, order_number: &str) -> StorageResult<Option<Order>> {
        let model = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&self.db)
            .await?;
        match model {
            Some(model) => Ok(Some(self.load_order(model).await?)),
            None => Ok(None),
        }
    }

    async fn update_statuses(
        &self,
        id: ModelId,
        status: OrderStatus,
        payment_status: PaymentStatus,
    ) -> StorageResult<Order> {
        let model = order::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| format!("order {} not found", id))?;

        let mut active: order::ActiveModel = model.into();
        active.status = Set(status.to_string());
        active.payment_status = Set(payment_status.to_string());
        active.updated_at = Set(Utc::now());
        let model = active.update(&self.db).await?;

        self.load_order(model).await
    }

    async fn has_order_since(&self, user_id: ModelId, since: DateTime<Utc>) -> StorageResult<bool> {
        let count = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::CreatedAt.gte(since))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl CartStorage for DbStore {
    async fn cart_for_user(&self, user_id: ModelId) -> StorageResult<Option<Cart>> {
        let model = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?;
        match model {
            Some(model) => Ok(Some(self.hydrate_cart(model).await?)),
            None => Ok(None),
        }
    }

    async fn cart_by_id(&self, cart_id: ModelId) -> StorageResult<Option<Cart>> {
        match cart::Entity::find_by_id(cart_id).one(&self.db).await? {
            Some(model) => Ok(Some(self.hydrate_cart(model).await?)),
            None => Ok(None),
        }
    }

    async fn clear_cart(&self, cart_id: ModelId) -> StorageResult<()> {
        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn touch_cart(&self, cart_id: ModelId) -> StorageResult<()> {
        let Some(model) = cart::Entity::find_by_id(cart_id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: cart::ActiveModel = model.into();
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn idle_carts(&self, idle_before: DateTime<Utc>) -> StorageResult<Vec<Cart>> {
        let models = cart::Entity::find()
            .filter(cart::Column::UpdatedAt.lt(idle_before))
            .all(&self.db)
            .await?;

        let mut carts = Vec::new();
        for model in models {
            let cart = self.hydrate_cart(model).await?;
            if !cart.items.is_empty() {
                carts.push(cart);
            }
        }
        Ok(carts)
    }
}

#[async_trait]
impl AbandonedCartStorage for DbStore {
    async fn find_by_cart(&self, cart_id: ModelId) -> StorageResult<Option<AbandonedCart>> {
        let model = abandoned_cart::Entity::find()
            .filter(abandoned_cart::Column::CartId.eq(cart_id))
            .one(&self.db)
            .await?;
        Ok(model.map(abandoned_from_model))
    }

    async fn upsert_snapshot(
        &self,
        cart_id: ModelId,
        user_id: ModelId,
        items_count: i32,
        total_amount: Decimal,
    ) -> StorageResult<AbandonedCart> {
        let now = Utc::now();
        let record = abandoned_cart::ActiveModel {
            id: NotSet,
            cart_id: Set(cart_id),
            user_id: Set(user_id),
            items_count: Set(items_count),
            total_amount: Set(total_amount),
            recovered: Set(false),
            recovered_at: Set(None),
            reminder_sent: Set(0),
            last_reminder_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        // The unique cart id turns a second sweep into an update that
        // re-opens the record; reminder counters are left untouched.
        abandoned_cart::Entity::insert(record)
            .on_conflict(
                OnConflict::column(abandoned_cart::Column::CartId)
                    .update_columns([
                        abandoned_cart::Column::ItemsCount,
                        abandoned_cart::Column::TotalAmount,
                        abandoned_cart::Column::Recovered,
                        abandoned_cart::Column::RecoveredAt,
                        abandoned_cart::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        self.find_by_cart(cart_id)
            .await?
            .ok_or_else(|| format!("abandoned cart record for cart {} vanished", cart_id).into())
    }

    async fn mark_recovered(&self, cart_id: ModelId, at: DateTime<Utc>) -> StorageResult<bool> {
        let model = abandoned_cart::Entity::find()
            .filter(abandoned_cart::Column::CartId.eq(cart_id))
            .one(&self.db)
            .await?;
        let Some(model) = model else {
            return Ok(false);
        };
        if model.recovered {
            return Ok(false);
        }

        let mut active: abandoned_cart::ActiveModel = model.into();
        active.recovered = Set(true);
        active.recovered_at = Set(Some(at));
        active.updated_at = Set(at);
        active.update(&self.db).await?;
        Ok(true)
    }

    async fn mark_reminder_sent(&self, cart_id: ModelId, at: DateTime<Utc>) -> StorageResult<()> {
        let model = abandoned_cart::Entity::find()
            .filter(abandoned_cart::Column::CartId.eq(cart_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| format!("abandoned cart record for cart {} not found", cart_id))?;

        let reminder_sent = model.reminder_sent;
        let mut active: abandoned_cart::ActiveModel = model.into();
        active.reminder_sent = Set(reminder_sent + 1);
        active.last_reminder_at = Set(Some(at));
        active.updated_at = Set(at);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn unrecovered(&self) -> StorageResult<Vec<ReminderCandidate>> {
        let models = abandoned_cart::Entity::find()
            .filter(abandoned_cart::Column::Recovered.eq(false))
            .all(&self.db)
            .await?;

        let mut candidates = Vec::new();
        for model in models {
            let owner = user::Entity::find_by_id(model.user_id).one(&self.db).await?;
            candidates.push(ReminderCandidate {
                record: abandoned_from_model(model),
                telegram_id: owner.and_then(|owner| owner.telegram_id),
            });
        }
        Ok(candidates)
    }
}

#[async_trait]
impl SettingsStorage for DbStore {
    async fn reminder_settings(&self) -> StorageResult<ReminderSettings> {
        let model = abandoned_cart_settings::Entity::find().one(&self.db).await?;
        Ok(model
            .map(|model| ReminderSettings {
                auto_reminders_enabled: model.auto_reminders_enabled,
                reminder_interval_hours: model.reminder_interval_hours,
                max_reminders: model.max_reminders,
                initial_delay_hours: model.initial_delay_hours,
            })
            .unwrap_or_default())
    }

    async fn update_reminder_settings(
        &self,
        settings: ReminderSettings,
    ) -> StorageResult<ReminderSettings> {
        let existing = abandoned_cart_settings::Entity::find().one(&self.db).await?;
        match existing {
            Some(model) => {
                let mut active: abandoned_cart_settings::ActiveModel = model.into();
                active.auto_reminders_enabled = Set(settings.auto_reminders_enabled);
                active.reminder_interval_hours = Set(settings.reminder_interval_hours);
                active.max_reminders = Set(settings.max_reminders);
                active.initial_delay_hours = Set(settings.initial_delay_hours);
                active.update(&self.db).await?;
            }
            None => {
                let record = abandoned_cart_settings::ActiveModel {
                    id: NotSet,
                    auto_reminders_enabled: Set(settings.auto_reminders_enabled),
                    reminder_interval_hours: Set(settings.reminder_interval_hours),
                    max_reminders: Set(settings.max_reminders),
                    initial_delay_hours: Set(settings.initial_delay_hours),
                };
                record.insert(&self.db).await?;
            }
        }
        Ok(settings)
    }
}
