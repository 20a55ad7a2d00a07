use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::model::{
    AbandonedCart, Cart, ModelId, Order, OrderStatus, PaymentStatus, ReminderSettings,
};
use crate::storage::{
    AbandonedCartStorage, CartStorage, OrderDraft, OrderStorage, ReminderCandidate,
    SettingsStorage, StorageResult,
};

struct MemoryState {
    carts: HashMap<ModelId, Cart>,
    orders: HashMap<ModelId, Order>,
    abandoned: HashMap<ModelId, AbandonedCart>,
    settings: ReminderSettings,
    next_order_id: ModelId,
    next_abandoned_id: ModelId,
}

/// In-memory implementation of every storage port.
///
/// The development default when no database is configured, and the fixture
/// store for tests. One mutex over the whole state stands in for the
/// database's serialization of concurrent writers.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                carts: HashMap::new(),
                orders: HashMap::new(),
                abandoned: HashMap::new(),
                settings: ReminderSettings::default(),
                next_order_id: 1,
                next_abandoned_id: 1,
            }),
        }
    }

    /// Seed or replace a cart, keyed by its id.
    pub async fn put_cart(&self, cart: Cart) {
        self.state.lock().await.carts.insert(cart.id, cart);
    }

    pub async fn get_abandoned(&self, cart_id: ModelId) -> Option<AbandonedCart> {
        self.state.lock().await.abandoned.get(&cart_id).cloned()
    }

    pub async fn abandoned_count(&self) -> usize {
        self.state.lock().await.abandoned.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStorage for MemoryStore {
    async fn insert_order(&self, draft: OrderDraft) -> StorageResult<Order> {
        let mut state = self.state.lock().await;
        let id = state.next_order_id;
        state.next_order_id += 1;
        let now = Utc::now();
        let order = Order {
            id,
            user_id: draft.user_id,
            order_number: draft.order_number,
            status: draft.status,
            payment_status: draft.payment_status,
            total: draft.total,
            customer_name: draft.customer_name,
            customer_phone: draft.customer_phone,
            customer_email: draft.customer_email,
            customer_address: draft.customer_address,
            comment: draft.comment,
            items: draft.items,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: ModelId) -> StorageResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn find_by_number(&self, order_number: &str) -> StorageResult<Option<Order>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .find(|order| order.order_number == order_number)
            .cloned())
    }

    async fn update_statuses(
        &self,
        id: ModelId,
        status: OrderStatus,
        payment_status: PaymentStatus,
    ) -> StorageResult<Order> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&id)
            .ok_or_else(|| format!("order {} not found", id))?;
        order.status = status;
        order.payment_status = payment_status;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn has_order_since(&self, user_id: ModelId, since: DateTime<Utc>) -> StorageResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .any(|order| order.user_id == user_id && order.created_at >= since))
    }
}

#[async_trait]
impl CartStorage for MemoryStore {
    async fn cart_for_user(&self, user_id: ModelId) -> StorageResult<Option<Cart>> {
        Ok(self
            .state
            .lock()
            .await
            .carts
            .values()
            .find(|cart| cart.user_id == user_id)
            .cloned())
    }

    async fn cart_by_id(&self, cart_id: ModelId) -> StorageResult<Option<Cart>> {
        Ok(self.state.lock().await.carts.get(&cart_id).cloned())
    }

    async fn clear_cart(&self, cart_id: ModelId) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if let Some(cart) = state.carts.get_mut(&cart_id) {
            cart.items.clear();
        }
        Ok(())
    }

    async fn touch_cart(&self, cart_id: ModelId) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if let Some(cart) = state.carts.get_mut(&cart_id) {
            cart.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn idle_carts(&self, idle_before: DateTime<Utc>) -> StorageResult<Vec<Cart>> {
        Ok(self
            .state
            .lock()
            .await
            .carts
            .values()
            .filter(|cart| !cart.items.is_empty() && cart.updated_at < idle_before)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AbandonedCartStorage for MemoryStore {
    async fn find_by_cart(&self, cart_id: ModelId) -> StorageResult<Option<AbandonedCart>> {
        Ok(self.state.lock().await.abandoned.get(&cart_id).cloned())
    }

    async fn upsert_snapshot(
        &self,
        cart_id: ModelId,
        user_id: ModelId,
        items_count: i32,
        total_amount: Decimal,
    ) -> StorageResult<AbandonedCart> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(record) = state.abandoned.get_mut(&cart_id) {
            record.items_count = items_count;
            record.total_amount = total_amount;
            record.recovered = false;
            record.recovered_at = None;
            record.updated_at = now;
            return Ok(record.clone());
        }

        let id = state.next_abandoned_id;
        state.next_abandoned_id += 1;
        let record = AbandonedCart {
            id,
            cart_id,
            user_id,
            items_count,
            total_amount,
            recovered: false,
            recovered_at: None,
            reminder_sent: 0,
            last_reminder_at: None,
            created_at: now,
            updated_at: now,
        };
        state.abandoned.insert(cart_id, record.clone());
        Ok(record)
    }

    async fn mark_recovered(&self, cart_id: ModelId, at: DateTime<Utc>) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        match state.abandoned.get_mut(&cart_id) {
            Some(record) if !record.recovered => {
                record.recovered = true;
                record.recovered_at = Some(at);
                record.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_reminder_sent(&self, cart_id: ModelId, at: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .abandoned
            .get_mut(&cart_id)
            .ok_or_else(|| format!("abandoned cart record for cart {} not found", cart_id))?;
        record.reminder_sent += 1;
        record.last_reminder_at = Some(at);
        record.updated_at = at;
        Ok(())
    }

    async fn unrecovered(&self) -> StorageResult<Vec<ReminderCandidate>> {
        let state = self.state.lock().await;
        Ok(state
            .abandoned
            .values()
            .filter(|record| !record.recovered)
            .map(|record| ReminderCandidate {
                record: record.clone(),
                telegram_id: state
                    .carts
                    .get(&record.cart_id)
                    .and_then(|cart| cart.telegram_id.clone()),
            })
            .collect())
    }
}

#[async_trait]
impl SettingsStorage for MemoryStore {
    async fn reminder_settings(&self) -> StorageResult<ReminderSettings> {
        Ok(self.state.lock().await.settings)
    }

    async fn update_reminder_settings(
        &self,
        settings: ReminderSettings,
    ) -> StorageResult<ReminderSettings> {
        self.state.lock().await.settings = settings;
        Ok(settings)
    }
}
