use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub type ModelId = i64;

/// Fulfillment axis of an order. The administrative path writes any value;
/// only the payment webhook advances it implicitly (Paid => Processing).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

/// Payment axis, independent of the fulfillment axis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Map external payment-processor status strings onto the payment axis.
    pub fn from_webhook(status: &str) -> Self {
        match status {
            "paid" | "success" => PaymentStatus::Paid,
            "failed" | "error" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }
}

/// Line item snapshot taken at checkout; the price never tracks later
/// catalog changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ModelId,
    pub variant_id: Option<ModelId>,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub price: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: ModelId,
    pub user_id: ModelId,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    /// Sum of line-item price x quantity at creation time, never recomputed.
    pub total: Decimal,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub customer_address: String,
    pub comment: Option<String>,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Checkout input from the order API. The owning user is resolved by the
/// authentication collaborator upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default)]
    pub customer_address: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

/// Administrative status write; either axis may be omitted.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
}

/// Cart item with the current catalog price view: the variant price wins
/// over the product base price when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: ModelId,
    pub variant_id: Option<ModelId>,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub base_price: Decimal,
    pub variant_price: Option<Decimal>,
    pub quantity: i32,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
}

impl CartItem {
    pub fn unit_price(&self) -> Decimal {
        self.variant_price.unwrap_or(self.base_price)
    }
}

/// One cart per user. `updated_at` is bumped by the cart-editing
/// collaborator on every item mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cart {
    pub id: ModelId,
    pub user_id: ModelId,
    pub telegram_id: Option<String>,
    pub items: Vec<CartItem>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn items_total(&self) -> Decimal {
        self.items
            .iter()
            .map(|item| item.unit_price() * Decimal::from(item.quantity))
            .sum()
    }
}

/// At most one live record per cart id; re-opened (recovered reset) when the
/// same cart goes idle again after recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonedCart {
    pub id: ModelId,
    pub cart_id: ModelId,
    pub user_id: ModelId,
    pub items_count: i32,
    pub total_amount: Decimal,
    pub recovered: bool,
    pub recovered_at: Option<DateTime<Utc>>,
    /// Monotonic: only ever increases, even across re-abandonment.
    pub reminder_sent: i32,
    pub last_reminder_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Singleton reminder configuration, written only through the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSettings {
    pub auto_reminders_enabled: bool,
    pub reminder_interval_hours: i64,
    pub max_reminders: i32,
    pub initial_delay_hours: i64,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            auto_reminders_enabled: true,
            reminder_interval_hours: 24,
            max_reminders: 3,
            initial_delay_hours: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_status_strings_map_onto_payment_axis() {
        assert_eq!(PaymentStatus::from_webhook("paid"), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::from_webhook("success"), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::from_webhook("failed"), PaymentStatus::Failed);
        assert_eq!(PaymentStatus::from_webhook("error"), PaymentStatus::Failed);
        assert_eq!(
            PaymentStatus::from_webhook("refunded"),
            PaymentStatus::Refunded
        );
        assert_eq!(
            PaymentStatus::from_webhook("anything-else"),
            PaymentStatus::Pending
        );
    }

    #[test]
    fn statuses_serialize_screaming_snake_case() {
        assert_eq!(OrderStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Paid).unwrap(),
            "\"PAID\""
        );
        let parsed: OrderStatus = "SHIPPED".parse().unwrap();
        assert_eq!(parsed, OrderStatus::Shipped);
    }

    #[test]
    fn variant_price_wins_over_base_price() {
        let item = CartItem {
            product_id: 1,
            variant_id: Some(2),
            product_name: "Granite slab".to_string(),
            variant_name: Some("Polished".to_string()),
            base_price: Decimal::from(1_000),
            variant_price: Some(Decimal::from(1_500)),
            quantity: 2,
            attributes: None,
        };
        assert_eq!(item.unit_price(), Decimal::from(1_500));

        let cart = Cart {
            id: 1,
            user_id: 1,
            telegram_id: None,
            items: vec![item],
            updated_at: Utc::now(),
        };
        assert_eq!(cart.items_total(), Decimal::from(3_000));
    }
}
