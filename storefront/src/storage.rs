use std::error::Error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::model::{
    AbandonedCart, Cart, ModelId, Order, OrderItem, OrderStatus, PaymentStatus, ReminderSettings,
};

pub type StorageResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Order to be persisted; the store assigns the id and timestamps.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub user_id: ModelId,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub total: Decimal,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub customer_address: String,
    pub comment: Option<String>,
    pub items: Vec<OrderItem>,
}

#[async_trait]
pub trait OrderStorage: Send + Sync {
    async fn insert_order(&self, draft: OrderDraft) -> StorageResult<Order>;

    async fn get_order(&self, id: ModelId) -> StorageResult<Option<Order>>;

    async fn find_by_number(&self, order_number: &str) -> StorageResult<Option<Order>>;

    async fn update_statuses(
        &self,
        id: ModelId,
        status: OrderStatus,
        payment_status: PaymentStatus,
    ) -> StorageResult<Order>;

    /// Whether the user placed any order at or after `since`. The detector
    /// uses this to tell checked-out carts from abandoned ones.
    async fn has_order_since(&self, user_id: ModelId, since: DateTime<Utc>) -> StorageResult<bool>;
}

#[async_trait]
pub trait CartStorage: Send + Sync {
    async fn cart_for_user(&self, user_id: ModelId) -> StorageResult<Option<Cart>>;

    async fn cart_by_id(&self, cart_id: ModelId) -> StorageResult<Option<Cart>>;

    /// Remove all items; called when an order is placed from the cart.
    async fn clear_cart(&self, cart_id: ModelId) -> StorageResult<()>;

    /// Bump `updated_at`; called by the cart-mutation hook.
    async fn touch_cart(&self, cart_id: ModelId) -> StorageResult<()>;

    /// Carts with at least one item whose `updated_at` is older than the
    /// given instant.
    async fn idle_carts(&self, idle_before: DateTime<Utc>) -> StorageResult<Vec<Cart>>;
}

/// An unrecovered abandonment joined with the owner's delivery address.
#[derive(Debug, Clone)]
pub struct ReminderCandidate {
    pub record: AbandonedCart,
    pub telegram_id: Option<String>,
}

#[async_trait]
pub trait AbandonedCartStorage: Send + Sync {
    async fn find_by_cart(&self, cart_id: ModelId) -> StorageResult<Option<AbandonedCart>>;

    /// Create-or-update keyed by the unique cart id. On update the record is
    /// re-opened: snapshot refreshed, `recovered` reset, `recovered_at`
    /// cleared. Reminder counters are left alone.
    async fn upsert_snapshot(
        &self,
        cart_id: ModelId,
        user_id: ModelId,
        items_count: i32,
        total_amount: Decimal,
    ) -> StorageResult<AbandonedCart>;

    /// Flip an unrecovered record to recovered. Returns whether anything
    /// changed.
    async fn mark_recovered(&self, cart_id: ModelId, at: DateTime<Utc>) -> StorageResult<bool>;

    async fn mark_reminder_sent(&self, cart_id: ModelId, at: DateTime<Utc>) -> StorageResult<()>;

    async fn unrecovered(&self) -> StorageResult<Vec<ReminderCandidate>>;
}

#[async_trait]
pub trait SettingsStorage: Send + Sync {
    async fn reminder_settings(&self) -> StorageResult<ReminderSettings>;

    async fn update_reminder_settings(
        &self,
        settings: ReminderSettings,
    ) -> StorageResult<ReminderSettings>;
}
