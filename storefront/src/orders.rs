use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{error, info, warn};

use pipeline::Priority;

use crate::model::{
    ModelId, NewOrder, Order, OrderItem, OrderStatus, PaymentStatus, StatusUpdate,
};
use crate::notifications::{
    NotificationEvent, NotificationJob, NotificationSink, OrderEventData, Recipient, StatusField,
};
use crate::storage::{CartStorage, OrderDraft, OrderStorage, StorageResult};

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("cart is empty")]
    EmptyCart,
    #[error("order {0} not found")]
    NotFound(ModelId),
    #[error("order with number \"{0}\" not found")]
    UnknownNumber(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<Box<dyn Error + Send + Sync>> for OrderError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        OrderError::Storage(e.to_string())
    }
}

/// Narrow signal from order placement back to the abandonment detector.
#[async_trait]
pub trait CartRecovery: Send + Sync {
    async fn cart_recovered(&self, cart_id: ModelId) -> StorageResult<()>;
}

/// Payment webhook body. External processors disagree on field names, so
/// the common aliases are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhook {
    #[serde(alias = "order_id")]
    pub order_number: String,
    #[serde(default, alias = "payment_id")]
    pub payment_id: Option<String>,
    #[serde(alias = "payment_status")]
    pub status: String,
}

/// Validates and applies order lifecycle changes, emitting one domain event
/// per field that actually changed value.
pub struct OrderService {
    orders: Arc<dyn OrderStorage>,
    carts: Arc<dyn CartStorage>,
    notifications: Arc<dyn NotificationSink>,
    recovery: Arc<dyn CartRecovery>,
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderStorage>,
        carts: Arc<dyn CartStorage>,
        notifications: Arc<dyn NotificationSink>,
        recovery: Arc<dyn CartRecovery>,
    ) -> Self {
        Self {
            orders,
            carts,
            notifications,
            recovery,
        }
    }

    /// Checkout: snapshot the user's cart into an order, clear the cart and
    /// signal recovery. Notification failures never roll back the order.
    pub async fn create_order(
        &self,
        user_id: ModelId,
        new_order: NewOrder,
    ) -> Result<Order, OrderError> {
        let cart = self.carts.cart_for_user(user_id).await?;
        let Some(cart) = cart.filter(|cart| !cart.items.is_empty()) else {
            return Err(OrderError::EmptyCart);
        };

        let items: Vec<OrderItem> = cart
            .items
            .iter()
            .map(|item| OrderItem {
                product_id: item.product_id,
                variant_id: item.variant_id,
                product_name: item.product_name.clone(),
                variant_name: item.variant_name.clone(),
                price: item.unit_price(),
                quantity: item.quantity,
            })
            .collect();
        let total: Decimal = items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum();

        let draft = OrderDraft {
            user_id,
            order_number: generate_order_number(),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            total,
            customer_name: new_order.customer_name,
            customer_phone: new_order.customer_phone,
            customer_email: new_order.customer_email,
            customer_address: new_order.customer_address,
            comment: new_order.comment,
            items,
        };
        let order = self.orders.insert_order(draft).await?;
        info!(
            "order #{} created for user {} (total {})",
            order.order_number, user_id, order.total
        );

        if let Err(e) = self.carts.clear_cart(cart.id).await {
            warn!("failed to clear cart {} after checkout: {}", cart.id, e);
        }
        if let Err(e) = self.recovery.cart_recovered(cart.id).await {
            warn!("failed to mark cart {} recovered: {}", cart.id, e);
        }

        let job = NotificationJob {
            event: NotificationEvent::OrderCreated {
                order: OrderEventData::from(&order),
            },
            recipient: Recipient::Both,
            telegram_id: cart.telegram_id.clone(),
        };
        if let Err(e) = self.notifications.publish(job, Priority::High).await {
            error!(
                "failed to queue order-created notification for #{}: {}",
                order.order_number, e
            );
        }

        if new_order.payment_method.as_deref() == Some("invoice") {
            info!(
                "invoice for order #{} delegated to the payment collaborator",
                order.order_number
            );
        }

        Ok(order)
    }

    pub async fn get_order(&self, order_id: ModelId) -> Result<Order, OrderError> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    /// Write either axis. The administrative path accepts any value for any
    /// current value; the loose transition behavior of the reference is
    /// deliberately left in place here.
    pub async fn apply_status_change(
        &self,
        order_id: ModelId,
        update: StatusUpdate,
    ) -> Result<Order, OrderError> {
        let current = self.get_order(order_id).await?;

        let new_status = update.status.unwrap_or(current.status);
        let new_payment = update.payment_status.unwrap_or(current.payment_status);
        if new_status == current.status && new_payment == current.payment_status {
            return Ok(current);
        }

        let updated = self
            .orders
            .update_statuses(order_id, new_status, new_payment)
            .await?;
        info!(
            "order #{} updated: status {} -> {}, payment {} -> {}",
            updated.order_number, current.status, new_status, current.payment_status, new_payment
        );

        let telegram_id = self.telegram_for_user(updated.user_id).await;
        if new_status != current.status {
            self.publish_status_event(
                &updated,
                telegram_id.clone(),
                StatusField::Status,
                current.status.to_string(),
                new_status.to_string(),
            )
            .await;
        }
        if new_payment != current.payment_status {
            self.publish_status_event(
                &updated,
                telegram_id,
                StatusField::PaymentStatus,
                current.payment_status.to_string(),
                new_payment.to_string(),
            )
            .await;
        }

        Ok(updated)
    }

    /// Map the processor's status string onto the payment axis and apply it.
    /// A paid order is advanced to Processing as a side effect of this path
    /// only.
    pub async fn handle_payment_webhook(
        &self,
        webhook: PaymentWebhook,
    ) -> Result<Order, OrderError> {
        let order = self
            .orders
            .find_by_number(&webhook.order_number)
            .await?
            .ok_or_else(|| OrderError::UnknownNumber(webhook.order_number.clone()))?;

        let payment_status = PaymentStatus::from_webhook(&webhook.status);
        let status = if payment_status == PaymentStatus::Paid {
            OrderStatus::Processing
        } else {
            order.status
        };
        info!(
            "payment webhook for order #{}: {} -> {:?} (payment id {:?})",
            order.order_number, webhook.status, payment_status, webhook.payment_id
        );

        self.apply_status_change(
            order.id,
            StatusUpdate {
                status: Some(status),
                payment_status: Some(payment_status),
            },
        )
        .await
    }

    async fn telegram_for_user(&self, user_id: ModelId) -> Option<String> {
        match self.carts.cart_for_user(user_id).await {
            Ok(cart) => cart.and_then(|cart| cart.telegram_id),
            Err(e) => {
                warn!("failed to resolve telegram id for user {}: {}", user_id, e);
                None
            }
        }
    }

    async fn publish_status_event(
        &self,
        order: &Order,
        telegram_id: Option<String>,
        field: StatusField,
        old: String,
        new: String,
    ) {
        let job = NotificationJob {
            event: NotificationEvent::OrderStatusChanged {
                order_number: order.order_number.clone(),
                customer_name: order.customer_name.clone(),
                field,
                old,
                new,
            },
            recipient: Recipient::Both,
            telegram_id,
        };
        if let Err(e) = self.notifications.publish(job, Priority::Normal).await {
            error!(
                "failed to queue status-change notification for #{}: {}",
                order.order_number, e
            );
        }
    }
}

/// `ORD-<millis>-<counter>`: unique and roughly sortable by creation time.
fn generate_order_number() -> String {
    static ORDER_COUNTER: AtomicU64 = AtomicU64::new(1);
    let counter = ORDER_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("ORD-{}-{:05X}", Utc::now().timestamp_millis(), counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_are_unique_and_prefixed() {
        let first = generate_order_number();
        let second = generate_order_number();
        assert!(first.starts_with("ORD-"));
        assert_ne!(first, second);
    }

    #[test]
    fn payment_webhook_accepts_field_aliases() {
        let webhook: PaymentWebhook = serde_json::from_value(serde_json::json!({
            "order_id": "ORD-1",
            "payment_id": "pay_9",
            "payment_status": "paid",
        }))
        .unwrap();
        assert_eq!(webhook.order_number, "ORD-1");
        assert_eq!(webhook.payment_id.as_deref(), Some("pay_9"));
        assert_eq!(webhook.status, "paid");

        let webhook: PaymentWebhook = serde_json::from_value(serde_json::json!({
            "orderNumber": "ORD-2",
            "status": "failed",
        }))
        .unwrap();
        assert_eq!(webhook.order_number, "ORD-2");
        assert!(webhook.payment_id.is_none());
    }
}
