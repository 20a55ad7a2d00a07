use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use pipeline::Priority;

use crate::model::ModelId;
use crate::notifications::{NotificationEvent, NotificationJob, NotificationSink, Recipient};
use crate::orders::CartRecovery;
use crate::storage::{
    AbandonedCartStorage, CartStorage, OrderStorage, SettingsStorage, StorageResult,
};

/// Scheduled detector for carts left idle past the threshold.
///
/// All idempotency rests on the unique-per-cart upsert; the scheduler
/// serializes runs of the sweep, so overlapping sweeps cannot enqueue the
/// same reminder twice.
pub struct AbandonedCartService {
    carts: Arc<dyn CartStorage>,
    orders: Arc<dyn OrderStorage>,
    abandoned: Arc<dyn AbandonedCartStorage>,
    settings: Arc<dyn SettingsStorage>,
    notifications: Arc<dyn NotificationSink>,
    idle_threshold: Duration,
}

impl AbandonedCartService {
    pub fn new(
        carts: Arc<dyn CartStorage>,
        orders: Arc<dyn OrderStorage>,
        abandoned: Arc<dyn AbandonedCartStorage>,
        settings: Arc<dyn SettingsStorage>,
        notifications: Arc<dyn NotificationSink>,
        idle_threshold_hours: i64,
    ) -> Self {
        Self {
            carts,
            orders,
            abandoned,
            settings,
            notifications,
            idle_threshold: Duration::hours(idle_threshold_hours),
        }
    }

    /// One detection pass. Returns how many abandonment records were
    /// created or re-opened. A storage failure aborts the pass; committed
    /// upserts stay committed and the next scheduled run picks up the rest.
    pub async fn sweep(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        debug!("checking for abandoned carts...");
        let idle_before = now - self.idle_threshold;
        let carts = self.carts.idle_carts(idle_before).await?;

        let mut processed = 0;
        for cart in carts {
            if let Some(existing) = self.abandoned.find_by_cart(cart.id).await? {
                // Already tracked and still open: nothing to do.
                if !existing.recovered {
                    continue;
                }
            }

            // An order placed at or after the last cart change means the
            // cart was checked out, not abandoned.
            if self.orders.has_order_since(cart.user_id, cart.updated_at).await? {
                continue;
            }

            let total_amount = cart.items_total();
            let items_count = cart.items.len() as i32;
            self.abandoned
                .upsert_snapshot(cart.id, cart.user_id, items_count, total_amount)
                .await?;
            debug!(
                "cart {} tracked as abandoned ({} items, total {})",
                cart.id, items_count, total_amount
            );
            processed += 1;
        }

        if processed > 0 {
            info!("tracked {} abandoned cart(s)", processed);
        }
        Ok(processed)
    }

    /// Liveness hook from the cart-editing collaborator. Records are not
    /// deleted here; the next sweep reconciles them.
    pub async fn cart_touched(&self, cart_id: ModelId) {
        match self.abandoned.find_by_cart(cart_id).await {
            Ok(Some(record)) if !record.recovered => {
                debug!("cart {} is active again, re-evaluated on next sweep", cart_id);
            }
            Ok(_) => {}
            Err(e) => warn!("activity check for cart {} failed: {}", cart_id, e),
        }
    }

    /// Flip the open record for this cart to recovered. No-op when there is
    /// no open record.
    pub async fn mark_recovered(&self, cart_id: ModelId) -> StorageResult<bool> {
        let changed = self.abandoned.mark_recovered(cart_id, Utc::now()).await?;
        if changed {
            info!("cart {} marked as recovered", cart_id);
        }
        Ok(changed)
    }

    /// Queue reminder notifications for open records that are due, pacing by
    /// the administrative settings. The reminder counter is advanced at
    /// enqueue time, so a rerun inside the interval finds nothing due.
    pub async fn send_due_reminders(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let settings = self.settings.reminder_settings().await?;
        if !settings.auto_reminders_enabled {
            debug!("automatic reminders are disabled");
            return Ok(0);
        }

        let candidates = self.abandoned.unrecovered().await?;
        let mut queued = 0;
        for candidate in candidates {
            let record = &candidate.record;
            if record.reminder_sent >= settings.max_reminders {
                continue;
            }

            let due_at = match record.last_reminder_at {
                None => record.created_at + Duration::hours(settings.initial_delay_hours),
                Some(last) => last + Duration::hours(settings.reminder_interval_hours),
            };
            if now < due_at {
                continue;
            }

            let Some(telegram_id) = candidate.telegram_id.clone() else {
                debug!(
                    "cart {} has no telegram id, reminder skipped",
                    record.cart_id
                );
                continue;
            };

            let job = NotificationJob {
                event: NotificationEvent::CartAbandoned {
                    cart_id: record.cart_id,
                    items_count: record.items_count,
                    total_amount: record.total_amount,
                },
                recipient: Recipient::Customer,
                telegram_id: Some(telegram_id),
            };
            self.notifications
                .publish(job, Priority::Normal)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            self.abandoned.mark_reminder_sent(record.cart_id, now).await?;
            queued += 1;
        }

        if queued > 0 {
            info!("queued {} cart abandonment reminder(s)", queued);
        }
        Ok(queued)
    }
}

#[async_trait]
impl CartRecovery for AbandonedCartService {
    async fn cart_recovered(&self, cart_id: ModelId) -> StorageResult<()> {
        self.mark_recovered(cart_id).await.map(|_| ())
    }
}
