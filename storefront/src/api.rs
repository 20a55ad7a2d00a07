use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use pipeline::{QueueStats, QueueStatsSource};

use crate::abandoned::AbandonedCartService;
use crate::model::{ModelId, NewOrder, ReminderSettings, StatusUpdate};
use crate::orders::{OrderError, OrderService, PaymentWebhook};
use crate::storage::{CartStorage, SettingsStorage};

/// The recorder can be installed once per process; every caller shares the
/// same handle.
static PROMETHEUS: Lazy<PrometheusHandle> = Lazy::new(|| {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the Prometheus recorder")
});

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderService>,
    pub abandoned: Arc<AbandonedCartService>,
    pub carts: Arc<dyn CartStorage>,
    pub settings: Arc<dyn SettingsStorage>,
    pub queues: Arc<Vec<Arc<dyn QueueStatsSource>>>,
}

pub fn router(state: AppState) -> Router {
    // Install the recorder up front so counters emitted before the first
    // /metrics scrape are not lost.
    Lazy::force(&PROMETHEUS);

    Router::new()
        .route("/api/orders", post(create_order))
        .route("/api/orders/{id}", get(get_order))
        .route("/api/orders/webhook/payment", post(payment_webhook))
        .route("/api/admin/orders/{id}/status", axum::routing::patch(update_order_status))
        .route("/api/carts/{cart_id}/activity", post(cart_activity))
        .route("/api/admin/queues/stats", get(queue_stats))
        .route(
            "/api/admin/abandoned-carts/settings",
            get(get_reminder_settings).patch(update_reminder_settings),
        )
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: ModelId,
    #[serde(flatten)]
    pub order: NewOrder,
}

async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Response {
    match state.orders.create_order(request.user_id, request.order).await {
        Ok(order) => (StatusCode::CREATED, Json(order)).into_response(),
        Err(OrderError::EmptyCart) => {
            (StatusCode::BAD_REQUEST, "cart is empty").into_response()
        }
        Err(e) => internal_error("failed to create order", e),
    }
}

async fn get_order(State(state): State<AppState>, Path(id): Path<ModelId>) -> Response {
    match state.orders.get_order(id).await {
        Ok(order) => Json(order).into_response(),
        Err(OrderError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, format!("order {} not found", id)).into_response()
        }
        Err(e) => internal_error("failed to load order", e),
    }
}

async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<ModelId>,
    Json(update): Json<StatusUpdate>,
) -> Response {
    match state.orders.apply_status_change(id, update).await {
        Ok(order) => Json(order).into_response(),
        Err(OrderError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, format!("order {} not found", id)).into_response()
        }
        Err(e) => internal_error("failed to update order status", e),
    }
}

async fn payment_webhook(
    State(state): State<AppState>,
    Json(webhook): Json<PaymentWebhook>,
) -> Response {
    match state.orders.handle_payment_webhook(webhook).await {
        Ok(order) => Json(order).into_response(),
        Err(OrderError::UnknownNumber(number)) => (
            StatusCode::NOT_FOUND,
            format!("order with number \"{}\" not found", number),
        )
            .into_response(),
        Err(e) => internal_error("failed to process payment webhook", e),
    }
}

/// Cart-mutation hook: bump the cart's activity timestamp and let the
/// detector log its liveness view. Reconciliation happens on the next sweep.
async fn cart_activity(State(state): State<AppState>, Path(cart_id): Path<ModelId>) -> Response {
    if let Err(e) = state.carts.touch_cart(cart_id).await {
        return internal_error("failed to record cart activity", e);
    }
    state.abandoned.cart_touched(cart_id).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn queue_stats(State(state): State<AppState>) -> Response {
    let mut stats: BTreeMap<String, QueueStats> = BTreeMap::new();
    for queue in state.queues.iter() {
        match queue.stats().await {
            Ok(queue_stats) => {
                stats.insert(queue.name().to_string(), queue_stats);
            }
            Err(e) => return internal_error("failed to read queue stats", e),
        }
    }
    Json(stats).into_response()
}

async fn get_reminder_settings(State(state): State<AppState>) -> Response {
    match state.settings.reminder_settings().await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => internal_error("failed to load reminder settings", e),
    }
}

/// Partial update: absent fields keep their current value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSettingsUpdate {
    pub auto_reminders_enabled: Option<bool>,
    pub reminder_interval_hours: Option<i64>,
    pub max_reminders: Option<i32>,
    pub initial_delay_hours: Option<i64>,
}

async fn update_reminder_settings(
    State(state): State<AppState>,
    Json(update): Json<ReminderSettingsUpdate>,
) -> Response {
    let current = match state.settings.reminder_settings().await {
        Ok(settings) => settings,
        Err(e) => return internal_error("failed to load reminder settings", e),
    };

    let merged = ReminderSettings {
        auto_reminders_enabled: update
            .auto_reminders_enabled
            .unwrap_or(current.auto_reminders_enabled),
        reminder_interval_hours: update
            .reminder_interval_hours
            .unwrap_or(current.reminder_interval_hours),
        max_reminders: update.max_reminders.unwrap_or(current.max_reminders),
        initial_delay_hours: update
            .initial_delay_hours
            .unwrap_or(current.initial_delay_hours),
    };

    match state.settings.update_reminder_settings(merged).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => internal_error("failed to update reminder settings", e),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn render_metrics() -> impl IntoResponse {
    PROMETHEUS.render()
}

fn internal_error<E: std::fmt::Display>(context: &str, error: E) -> Response {
    error!("{}: {}", context, error);
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
}
