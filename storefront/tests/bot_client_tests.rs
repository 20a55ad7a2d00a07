use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use http::StatusCode;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use url::Url;

use common::config::BotsConfig;
use storefront::bots::{AbandonedCartReminder, BotClient, BotGateway, DeliveryError};
use storefront::notifications::{OrderEventData, OrderItemData};

type Script = Arc<Mutex<VecDeque<(u16, Value)>>>;

#[derive(Clone)]
struct StubState {
    script: Script,
    hits: Arc<AtomicUsize>,
}

async fn scripted_response(State(state): State<StubState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    match state.script.lock().unwrap().pop_front() {
        Some((status, body)) => (
            StatusCode::from_u16(status).unwrap(),
            axum::Json(body),
        )
            .into_response(),
        None => (StatusCode::OK, axum::Json(json!({"ok": true}))).into_response(),
    }
}

/// Bot service stub answering every path with the next scripted response,
/// then `200 {"ok": true}` once the script runs out.
async fn spawn_stub(script: Vec<(u16, Value)>) -> (Url, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = StubState {
        script: Arc::new(Mutex::new(VecDeque::from(script))),
        hits: hits.clone(),
    };
    let app = Router::new().fallback(scripted_response).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (Url::parse(&format!("http://{}", addr)).unwrap(), hits)
}

fn client_for(base: &Url) -> BotClient {
    BotClient::new(&BotsConfig {
        customer_bot_url: base.clone(),
        admin_bot_url: base.clone(),
        request_timeout_ms: 2_000,
        retry_attempts: 3,
        retry_base_delay_ms: 10,
    })
    .unwrap()
}

fn order_event() -> OrderEventData {
    OrderEventData {
        order_number: "ORD-1".to_string(),
        order_id: 1,
        customer_name: "Alex Stone".to_string(),
        customer_phone: "+10000000".to_string(),
        customer_email: None,
        customer_address: "1 Quarry Road".to_string(),
        comment: None,
        items: vec![OrderItemData {
            product_name: "Granite slab".to_string(),
            variant_name: None,
            quantity: 1,
            price: Decimal::from(2_000),
        }],
        total: Decimal::from(2_000),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let (base, hits) = spawn_stub(vec![(500, json!({})), (502, json!({}))]).await;
    let client = client_for(&base);

    client.admin_new_order(&order_event()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limits_are_retried() {
    let (base, hits) = spawn_stub(vec![(429, json!({}))]).await;
    let client = client_for(&base);

    client
        .customer_status_change("42", "ORD-1", "SHIPPED")
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_blocked_recipient_is_terminal_after_one_attempt() {
    let (base, hits) = spawn_stub(vec![(403, json!({}))]).await;
    let client = client_for(&base);

    let err = client
        .customer_new_order("42", &order_event())
        .await
        .unwrap_err();
    assert_eq!(err, DeliveryError::Blocked);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn other_client_errors_are_terminal_after_one_attempt() {
    let (base, hits) = spawn_stub(vec![(404, json!({"error": "no such chat"}))]).await;
    let client = client_for(&base);

    let err = client
        .customer_abandoned_cart(
            "42",
            &AbandonedCartReminder {
                cart_id: 5,
                items_text: "  - Granite slab - 1 x 2000".to_string(),
                total_amount: Decimal::from(2_000),
                days_since_abandoned: 2,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, DeliveryError::Rejected(404));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_2xx_without_acknowledgement_is_not_success() {
    let (base, hits) = spawn_stub(vec![(200, json!({"ok": false}))]).await;
    let client = client_for(&base);

    let err = client
        .admin_status_change("ORD-1", "PENDING", "SHIPPED", Some("Alex Stone"))
        .await
        .unwrap_err();
    assert_eq!(err, DeliveryError::NotAcknowledged);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_persistent_outage_exhausts_the_leg_budget() {
    let (base, hits) = spawn_stub(vec![
        (500, json!({})),
        (503, json!({})),
        (500, json!({})),
        (500, json!({})),
    ])
    .await;
    let client = client_for(&base);

    let err = client.admin_new_order(&order_event()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Transient(_)));
    // Exactly the configured budget, not one request more.
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn status_queued_acknowledgement_is_accepted() {
    let (base, hits) = spawn_stub(vec![(200, json!({"status": "queued"}))]).await;
    let client = client_for(&base);

    client
        .customer_status_change("42", "ORD-1", "DELIVERED")
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
