use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Value, json};
use tracing::{info, warn};
use url::Url;

use common::config::BotsConfig;

use crate::model::ModelId;
use crate::notifications::{OrderEventData, OrderItemData};

/// One delivery leg's terminal result.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// 403: the recipient blocked the channel. Never retried.
    #[error("recipient unreachable (blocked the channel)")]
    Blocked,
    /// Any other non-retryable 4xx.
    #[error("rejected by the channel with status {0}")]
    Rejected(u16),
    /// 2xx without a truthy acknowledgement field.
    #[error("channel returned no acknowledgement")]
    NotAcknowledged,
    /// Network failures, timeouts, 5xx and rate limits, after the retry
    /// budget ran out.
    #[error("delivery failed: {0}")]
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct AbandonedCartReminder {
    pub cart_id: ModelId,
    pub items_text: String,
    pub total_amount: Decimal,
    pub days_since_abandoned: i64,
}

/// Outbound port to the two delivery channels. The implementation owns the
/// per-leg retry budget; callers see only the terminal result.
#[async_trait]
pub trait BotGateway: Send + Sync {
    async fn admin_new_order(&self, order: &OrderEventData) -> Result<(), DeliveryError>;

    async fn admin_status_change(
        &self,
        order_number: &str,
        old_status: &str,
        new_status: &str,
        customer_name: Option<&str>,
    ) -> Result<(), DeliveryError>;

    async fn customer_new_order(
        &self,
        telegram_id: &str,
        order: &OrderEventData,
    ) -> Result<(), DeliveryError>;

    async fn customer_status_change(
        &self,
        telegram_id: &str,
        order_number: &str,
        status: &str,
    ) -> Result<(), DeliveryError>;

    async fn customer_abandoned_cart(
        &self,
        telegram_id: &str,
        reminder: &AbandonedCartReminder,
    ) -> Result<(), DeliveryError>;
}

/// HTTP client for the customer and operator bot services.
///
/// Each request gets a bounded timeout; transport failures, 5xx and 429 are
/// retried with a doubling delay, any other 4xx is terminal for the leg.
pub struct BotClient {
    client: reqwest::Client,
    customer_base: Url,
    admin_base: Url,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl BotClient {
    pub fn new(config: &BotsConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            customer_base: config.customer_bot_url.clone(),
            admin_base: config.admin_bot_url.clone(),
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    /// Best-effort availability probe at startup; failures are logged, the
    /// channels are simply tried again at delivery time.
    pub async fn check_availability(&self) {
        for (name, base) in [
            ("customer bot", &self.customer_base),
            ("admin bot", &self.admin_base),
        ] {
            match self.endpoint(base, "health") {
                Ok(url) => match self.client.get(url.clone()).send().await {
                    Ok(response) if response.status().is_success() => {
                        info!("{} is available at {}", name, base)
                    }
                    Ok(response) => {
                        warn!("{} health check failed with {}", name, response.status())
                    }
                    Err(e) => warn!("{} is not available at {}: {}", name, base, e),
                },
                Err(e) => warn!("{}: {}", name, e),
            }
        }
    }

    fn endpoint(&self, base: &Url, path: &str) -> Result<Url, DeliveryError> {
        base.join(path)
            .map_err(|e| DeliveryError::Transient(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn post_with_retry(&self, url: Url, payload: &Value) -> Result<(), DeliveryError> {
        let mut delay = self.retry_base_delay;
        let mut last_failure = String::new();

        for attempt in 1..=self.retry_attempts {
            let retryable = match self.client.post(url.clone()).json(payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: Value = response.json().await.unwrap_or(Value::Null);
                        if is_acknowledged(&body) {
                            return Ok(());
                        }
                        return Err(DeliveryError::NotAcknowledged);
                    }
                    if status.as_u16() == 403 {
                        return Err(DeliveryError::Blocked);
                    }
                    if status.is_client_error() && status.as_u16() != 429 {
                        return Err(DeliveryError::Rejected(status.as_u16()));
                    }
                    format!("status {}", status)
                }
                Err(e) => e.to_string(),
            };
            last_failure = retryable;

            if attempt < self.retry_attempts {
                warn!(
                    "request to {} failed ({}), retrying in {:?} (attempt {}/{})",
                    url, last_failure, delay, attempt, self.retry_attempts
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(DeliveryError::Transient(last_failure))
    }
}

/// 2xx alone is not success: the channel must acknowledge, either with a
/// truthy `ok` or a status string.
fn is_acknowledged(body: &Value) -> bool {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    matches!(
        body.get("status").and_then(Value::as_str),
        Some("ok") | Some("queued")
    )
}

/// One line per ordered item: name, variant when present, quantity x price.
pub fn format_order_items(items: &[OrderItemData]) -> String {
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
                item.product_name, variant, item.quantity, item.price
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl BotGateway for BotClient {
    async fn admin_new_order(&self, order: &OrderEventData) -> Result<(), DeliveryError> {
        let payload = json!({
            "orderNumber": order.order_number,
            "orderId": order.order_id,
            "customerName": order.customer_name,
            "customerPhone": order.customer_phone,
            "customerEmail": order.customer_email.clone().unwrap_or_default(),
            "customerAddress": order.customer_address,
            "comment": order.comment.clone().unwrap_or_default(),
            "items": format_order_items(&order.items),
            "total": order.total.to_f64().unwrap_or_default(),
            "createdAt": order.created_at.to_rfc3339(),
        });
        let url = self.endpoint(&self.admin_base, "notify/admin")?;
        self.post_with_retry(url, &payload).await
    }

    async fn admin_status_change(
        &self,
        order_number: &str,
        old_status: &str,
        new_status: &str,
        customer_name: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let mut payload = json!({
            "orderNumber": order_number,
            "status": format!("{} → {}", old_status, new_status),
        });
        if let Some(name) = customer_name {
            payload["customerName"] = json!(name);
        }
        let url = self.endpoint(&self.admin_base, "notify/status")?;
        self.post_with_retry(url, &payload).await
    }

    async fn customer_new_order(
        &self,
        telegram_id: &str,
        order: &OrderEventData,
    ) -> Result<(), DeliveryError> {
        let payload = json!({
            "telegramId": telegram_id,
            "orderNumber": order.order_number,
            "orderId": order.order_id,
            "customerName": order.customer_name,
            "total": order.total.to_f64().unwrap_or_default(),
        });
        let url = self.endpoint(&self.customer_base, "notify/customer")?;
        self.post_with_retry(url, &payload).await
    }

    async fn customer_status_change(
        &self,
        telegram_id: &str,
        order_number: &str,
        status: &str,
    ) -> Result<(), DeliveryError> {
        let payload = json!({
            "telegramId": telegram_id,
            "orderNumber": order_number,
            "status": status,
        });
        let url = self.endpoint(&self.customer_base, "notify/status")?;
        self.post_with_retry(url, &payload).await
    }

    async fn customer_abandoned_cart(
        &self,
        telegram_id: &str,
        reminder: &AbandonedCartReminder,
    ) -> Result<(), DeliveryError> {
        let payload = json!({
            "telegramId": telegram_id,
            "cartId": reminder.cart_id,
            "items": reminder.items_text,
            "totalAmount": reminder.total_amount.to_f64().unwrap_or_default(),
            "daysSinceAbandoned": reminder.days_since_abandoned,
        });
        let url = self.endpoint(&self.customer_base, "notify/abandoned-cart")?;
        self.post_with_retry(url, &payload).await
    }
}
