use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, info, warn};

use pipeline::{ActiveJob, EnqueueOptions, JobHandler, JobId, JobOutcome, JobQueue, Priority, QueueError};

use crate::bots::{AbandonedCartReminder, BotGateway, DeliveryError};
use crate::model::{CartItem, ModelId, Order};
use crate::storage::{AbandonedCartStorage, CartStorage};

pub const NOTIFICATIONS_QUEUE: &str = "notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Customer,
    Admin,
    Both,
}

impl Recipient {
    pub fn includes_admin(self) -> bool {
        matches!(self, Recipient::Admin | Recipient::Both)
    }

    pub fn includes_customer(self) -> bool {
        matches!(self, Recipient::Customer | Recipient::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemData {
    pub product_name: String,
    pub variant_name: Option<String>,
    pub quantity: i32,
    pub price: Decimal,
}

/// Order snapshot carried inside a notification payload, so the dispatcher
/// never re-reads the order store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEventData {
    pub order_number: String,
    pub order_id: ModelId,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub customer_address: String,
    pub comment: Option<String>,
    pub items: Vec<OrderItemData>,
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderEventData {
    fn from(order: &Order) -> Self {
        Self {
            order_number: order.order_number.clone(),
            order_id: order.id,
            customer_name: order.customer_name.clone(),
            customer_phone: order.customer_phone.clone(),
            customer_email: order.customer_email.clone(),
            customer_address: order.customer_address.clone(),
            comment: order.comment.clone(),
            items: order
                .items
                .iter()
                .map(|item| OrderItemData {
                    product_name: item.product_name.clone(),
                    variant_name: item.variant_name.clone(),
                    quantity: item.quantity,
                    price: item.price,
                })
                .collect(),
            total: order.total,
            created_at: order.created_at,
        }
    }
}

/// Which order field changed. One event is emitted per changed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusField {
    Status,
    PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    OrderCreated {
        order: OrderEventData,
    },
    OrderStatusChanged {
        order_number: String,
        customer_name: String,
        field: StatusField,
        old: String,
        new: String,
    },
    CartAbandoned {
        cart_id: ModelId,
        items_count: i32,
        total_amount: Decimal,
    },
    Custom {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    #[serde(flatten)]
    pub event: NotificationEvent,
    pub recipient: Recipient,
    pub telegram_id: Option<String>,
}

/// Producer port. Components publish domain events here; failures are the
/// caller's to log, never to propagate into the triggering write.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, job: NotificationJob, priority: Priority) -> Result<JobId, QueueError>;
}

/// The production sink: the notifications queue.
pub struct NotificationQueue {
    queue: Arc<JobQueue<NotificationJob>>,
}

impl NotificationQueue {
    pub fn new(queue: Arc<JobQueue<NotificationJob>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl NotificationSink for NotificationQueue {
    async fn publish(&self, job: NotificationJob, priority: Priority) -> Result<JobId, QueueError> {
        let id = self
            .queue
            .enqueue(&job, EnqueueOptions::with_priority(priority))
            .await?;
        info!(
            "notification job {} queued (recipient {:?}, telegram {:?})",
            id, job.recipient, job.telegram_id
        );
        Ok(id)
    }
}

/// Consumes notification jobs and fans them out to the two delivery
/// channels.
///
/// The bot client owns the per-leg retry budget; an exhausted or terminal
/// leg is a soft failure logged here, never a reason to re-run the whole
/// job. The queue-level retry only applies to failures outside delivery.
pub struct NotificationDispatcher {
    bots: Arc<dyn BotGateway>,
    abandoned: Arc<dyn AbandonedCartStorage>,
    carts: Arc<dyn CartStorage>,
}

impl NotificationDispatcher {
    pub fn new(
        bots: Arc<dyn BotGateway>,
        abandoned: Arc<dyn AbandonedCartStorage>,
        carts: Arc<dyn CartStorage>,
    ) -> Self {
        Self {
            bots,
            abandoned,
            carts,
        }
    }

    async fn dispatch_order_created(
        &self,
        job: &NotificationJob,
        order: &OrderEventData,
    ) -> JobOutcome {
        let admin_leg = async {
            if job.recipient.includes_admin() {
                log_leg(
                    "admin new-order",
                    &order.order_number,
                    self.bots.admin_new_order(order).await,
                );
            }
        };
        let customer_leg = async {
            if job.recipient.includes_customer() {
                match &job.telegram_id {
                    Some(telegram_id) => log_leg(
                        "customer new-order",
                        &order.order_number,
                        self.bots.customer_new_order(telegram_id, order).await,
                    ),
                    None => warn!(
                        "skipping customer leg for order #{}: no telegram id",
                        order.order_number
                    ),
                }
            }
        };
        tokio::join!(admin_leg, customer_leg);
        JobOutcome::Completed
    }

    async fn dispatch_status_changed(
        &self,
        job: &NotificationJob,
        order_number: &str,
        customer_name: &str,
        field: StatusField,
        old: &str,
        new: &str,
    ) -> JobOutcome {
        let admin_leg = async {
            if job.recipient.includes_admin() {
                log_leg(
                    "admin status-change",
                    order_number,
                    self.bots
                        .admin_status_change(order_number, old, new, Some(customer_name))
                        .await,
                );
            }
        };
        let customer_leg = async {
            if job.recipient.includes_customer() {
                match &job.telegram_id {
                    Some(telegram_id) => {
                        let status = match field {
                            StatusField::Status => new.to_string(),
                            StatusField::PaymentStatus => format!("payment {}", new),
                        };
                        log_leg(
                            "customer status-change",
                            order_number,
                            self.bots
                                .customer_status_change(telegram_id, order_number, &status)
                                .await,
                        );
                    }
                    None => warn!(
                        "skipping customer leg for order #{}: no telegram id",
                        order_number
                    ),
                }
            }
        };
        tokio::join!(admin_leg, customer_leg);
        JobOutcome::Completed
    }

    async fn dispatch_cart_abandoned(&self, job: &NotificationJob, cart_id: ModelId) -> JobOutcome {
        let Some(telegram_id) = &job.telegram_id else {
            warn!("skipping cart reminder for cart {}: no telegram id", cart_id);
            return JobOutcome::Completed;
        };

        // Re-read the record and the live cart so the reminder reflects the
        // cart as it is now, not as it was when the job was queued.
        let record = match self.abandoned.find_by_cart(cart_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return JobOutcome::Fail(format!(
                    "abandoned cart record for cart {} not found",
                    cart_id
                ));
            }
            Err(e) => {
                return JobOutcome::Retry(format!("loading abandoned cart {}: {}", cart_id, e));
            }
        };
        let cart = match self.carts.cart_by_id(cart_id).await {
            Ok(Some(cart)) => cart,
            Ok(None) => return JobOutcome::Fail(format!("cart {} not found", cart_id)),
            Err(e) => return JobOutcome::Retry(format!("loading cart {}: {}", cart_id, e)),
        };

        let reminder = AbandonedCartReminder {
            cart_id,
            items_text: format_cart_items(&cart.items),
            total_amount: record.total_amount,
            days_since_abandoned: (Utc::now() - record.created_at).num_days().max(0),
        };
        log_leg(
            "customer abandoned-cart",
            &format!("cart {}", cart_id),
            self.bots.customer_abandoned_cart(telegram_id, &reminder).await,
        );
        JobOutcome::Completed
    }
}

#[async_trait]
impl JobHandler<NotificationJob> for NotificationDispatcher {
    async fn handle(&self, job: &ActiveJob<NotificationJob>) -> JobOutcome {
        let notification = &job.payload;
        debug!(
            "dispatching notification job {} (attempt {})",
            job.id, job.attempt
        );

        match &notification.event {
            NotificationEvent::OrderCreated { order } => {
                self.dispatch_order_created(notification, order).await
            }
            NotificationEvent::OrderStatusChanged {
                order_number,
                customer_name,
                field,
                old,
                new,
            } => {
                self.dispatch_status_changed(
                    notification,
                    order_number,
                    customer_name,
                    *field,
                    old,
                    new,
                )
                .await
            }
            NotificationEvent::CartAbandoned { cart_id, .. } => {
                self.dispatch_cart_abandoned(notification, *cart_id).await
            }
            NotificationEvent::Custom { message } => {
                info!("custom notification processed: {}", message);
                JobOutcome::Completed
            }
        }
    }
}

fn log_leg(leg: &str, subject: &str, result: Result<(), DeliveryError>) {
    match result {
        Ok(()) => debug!("{} notification sent for {}", leg, subject),
        Err(DeliveryError::Blocked) => {
            warn!("{} for {}: recipient unreachable (blocked)", leg, subject)
        }
        Err(e) => warn!("{} delivery failed for {}: {}", leg, subject, e),
    }
}

/// One line per item: name, variant when present, quantity x unit price.
pub fn format_cart_items(items: &[CartItem]) -> String {
    items
        .iter()
        .map(|item| {
            let variant = item
                .variant_name
                .as_deref()
                .map(|name| format!(" ({})", name))
                .unwrap_or_default();
            format!(
                "  - {}{} - {} x {}",
                item.product_name,
                variant,
                item.quantity,
                item.unit_price()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_job_wire_format_is_tagged_and_flat() {
        let job = NotificationJob {
            event: NotificationEvent::CartAbandoned {
                cart_id: 7,
                items_count: 2,
                total_amount: Decimal::from(5_000),
            },
            recipient: Recipient::Customer,
            telegram_id: Some("42".to_string()),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "cart_abandoned");
        assert_eq!(value["cart_id"], 7);
        assert_eq!(value["recipient"], "customer");

        let decoded: NotificationJob = serde_json::from_value(value).unwrap();
        assert!(matches!(
            decoded.event,
            NotificationEvent::CartAbandoned { cart_id: 7, .. }
        ));
    }

    #[test]
    fn cart_items_format_one_line_per_item() {
        let items = vec![
            CartItem {
                product_id: 1,
                variant_id: None,
                product_name: "Granite slab".to_string(),
                variant_name: None,
                base_price: Decimal::from(2_000),
                variant_price: None,
                quantity: 1,
                attributes: None,
            },
            CartItem {
                product_id: 2,
                variant_id: Some(5),
                product_name: "Marble tile".to_string(),
                variant_name: Some("Honed".to_string()),
                base_price: Decimal::from(1_000),
                variant_price: Some(Decimal::from(1_500)),
                quantity: 2,
                attributes: None,
            },
        ];
        let text = format_cart_items(&items);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Granite slab"));
        assert!(lines[1].contains("Marble tile (Honed)"));
        assert!(lines[1].contains("2 x 1500"));
    }
}
