#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use pipeline::{JobId, Priority, QueueError};
use storefront::model::{Cart, CartItem, ModelId};
use storefront::notifications::{NotificationJob, NotificationSink};

/// Sink fake that records every published job instead of queueing it.
pub struct CapturingSink {
    pub published: Mutex<Vec<(NotificationJob, Priority)>>,
    next_id: AtomicI64,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn jobs(&self) -> Vec<(NotificationJob, Priority)> {
        self.published.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationSink for CapturingSink {
    async fn publish(&self, job: NotificationJob, priority: Priority) -> Result<JobId, QueueError> {
        self.published.lock().unwrap().push((job, priority));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

pub fn cart_item(name: &str, base_price: i64, variant_price: Option<i64>, quantity: i32) -> CartItem {
    CartItem {
        product_id: 1,
        variant_id: variant_price.map(|_| 10),
        product_name: name.to_string(),
        variant_name: variant_price.map(|_| "Variant".to_string()),
        base_price: Decimal::from(base_price),
        variant_price: variant_price.map(Decimal::from),
        quantity,
        attributes: None,
    }
}

pub fn cart(
    id: ModelId,
    user_id: ModelId,
    telegram_id: Option<&str>,
    items: Vec<CartItem>,
    updated_at: DateTime<Utc>,
) -> Cart {
    Cart {
        id,
        user_id,
        telegram_id: telegram_id.map(str::to_string),
        items,
        updated_at,
    }
}
