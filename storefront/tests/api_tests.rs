mod support;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use chrono::Utc;
use http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use pipeline::{JobQueue, QueueSettings, QueueStatsSource};
use storefront::abandoned::AbandonedCartService;
use storefront::api::{self, AppState};
use storefront::jobs::{IMAGE_QUEUE, ImageJob, REPORTS_QUEUE, ReportJob};
use storefront::memory_storage::MemoryStore;
use storefront::notifications::{
    NOTIFICATIONS_QUEUE, NotificationJob, NotificationQueue,
};
use storefront::orders::OrderService;

use support::{cart, cart_item};

async fn test_app() -> (Router, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());

    let notifications = Arc::new(JobQueue::<NotificationJob>::new(
        NOTIFICATIONS_QUEUE,
        QueueSettings::default(),
    ));
    let images = Arc::new(JobQueue::<ImageJob>::new(
        IMAGE_QUEUE,
        QueueSettings::default(),
    ));
    let reports = Arc::new(JobQueue::<ReportJob>::new(
        REPORTS_QUEUE,
        QueueSettings::default(),
    ));
    let sink = Arc::new(NotificationQueue::new(notifications.clone()));

    let abandoned = Arc::new(AbandonedCartService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink.clone(),
        24,
    ));
    let orders = Arc::new(OrderService::new(
        store.clone(),
        store.clone(),
        sink,
        abandoned.clone(),
    ));

    let queues: Arc<Vec<Arc<dyn QueueStatsSource>>> =
        Arc::new(vec![notifications, images, reports]);
    let state = AppState {
        orders,
        abandoned,
        carts: store.clone(),
        settings: store.clone(),
        queues,
    };
    (api::router(state), store)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_endpoint_responds() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn queue_stats_cover_all_three_queues() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/queues/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats = body_json(response).await;
    for queue in ["notifications", "images", "reports"] {
        assert!(stats.get(queue).is_some(), "missing {} stats", queue);
        assert_eq!(stats[queue]["waiting"], 0);
        assert_eq!(stats[queue]["failed"], 0);
    }
}

#[tokio::test]
async fn creating_an_order_through_the_api_reports_it_queued() {
    let (app, store) = test_app().await;
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![cart_item("Granite slab", 2_000, None, 1)],
            Utc::now(),
        ))
        .await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/orders",
            json!({
                "userId": 100,
                "customerName": "Alex Stone",
                "customerPhone": "+10000000",
                "customerAddress": "1 Quarry Road",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let order = body_json(response).await;
    assert_eq!(order["status"], "PENDING");
    assert_eq!(order["payment_status"], "PENDING");

    // The order-created notification landed on the queue.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/queues/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let stats = body_json(response).await;
    assert_eq!(stats["notifications"]["waiting"], 1);
}

#[tokio::test]
async fn order_creation_with_an_empty_cart_is_a_bad_request() {
    let (app, store) = test_app().await;
    store.put_cart(cart(1, 100, None, vec![], Utc::now())).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/orders",
            json!({
                "userId": 100,
                "customerName": "Alex Stone",
                "customerPhone": "+10000000",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn payment_webhook_for_unknown_order_is_not_found() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/orders/webhook/payment",
            json!({"orderNumber": "ORD-NOPE", "status": "paid"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reminder_settings_roundtrip_with_partial_update() {
    let (app, _) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/admin/abandoned-carts/settings")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let settings = body_json(response).await;
    assert_eq!(settings["autoRemindersEnabled"], true);
    assert_eq!(settings["maxReminders"], 3);

    // Patch one field; the others keep their values.
    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/api/admin/abandoned-carts/settings",
            json!({"maxReminders": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let settings = body_json(response).await;
    assert_eq!(settings["maxReminders"], 5);
    assert_eq!(settings["autoRemindersEnabled"], true);
    assert_eq!(settings["reminderIntervalHours"], 24);
}

#[tokio::test]
async fn cart_activity_hook_bumps_the_cart() {
    let (app, store) = test_app().await;
    let stale = Utc::now() - chrono::Duration::hours(30);
    store
        .put_cart(cart(
            9,
            100,
            None,
            vec![cart_item("Granite slab", 2_000, None, 1)],
            stale,
        ))
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/carts/9/activity")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    use storefront::storage::CartStorage;
    let cart_after = store.cart_by_id(9).await.unwrap().unwrap();
    assert!(cart_after.updated_at > stale);
}
