mod support;

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use storefront::abandoned::AbandonedCartService;
use storefront::memory_storage::MemoryStore;
use storefront::model::ReminderSettings;
use storefront::notifications::NotificationEvent;
use storefront::storage::{AbandonedCartStorage, CartStorage, SettingsStorage};

use support::{CapturingSink, cart, cart_item};

fn service(
    store: &Arc<MemoryStore>,
    sink: &Arc<CapturingSink>,
) -> AbandonedCartService {
    AbandonedCartService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink.clone(),
        24,
    )
}

#[tokio::test]
async fn sweep_tracks_idle_cart_with_correct_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    // Two items totaling 5000, last touched 25 hours ago.
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![
                cart_item("Granite slab", 2_000, None, 1),
                cart_item("Marble tile", 1_000, Some(1_500), 2),
            ],
            now - Duration::hours(25),
        ))
        .await;

    let processed = detector.sweep(now).await.unwrap();
    assert_eq!(processed, 1);

    let record = store.get_abandoned(1).await.unwrap();
    assert_eq!(record.cart_id, 1);
    assert_eq!(record.items_count, 2);
    assert_eq!(record.total_amount, Decimal::from(5_000));
    assert!(!record.recovered);
    assert!(record.recovered_at.is_none());
    assert_eq!(record.reminder_sent, 0);
}

#[tokio::test]
async fn sweep_is_idempotent_for_already_tracked_carts() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![cart_item("Granite slab", 2_000, None, 1)],
            now - Duration::hours(30),
        ))
        .await;

    assert_eq!(detector.sweep(now).await.unwrap(), 1);
    let first = store.get_abandoned(1).await.unwrap();

    // No cart or order change in between: the second sweep must not touch
    // the record or create another one.
    assert_eq!(detector.sweep(now).await.unwrap(), 0);
    assert_eq!(store.abandoned_count().await, 1);
    let second = store.get_abandoned(1).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.reminder_sent, first.reminder_sent);
    assert_eq!(second.updated_at, first.updated_at);
}

#[tokio::test]
async fn sweep_ignores_fresh_and_empty_carts() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    store
        .put_cart(cart(
            1,
            100,
            None,
            vec![cart_item("Granite slab", 2_000, None, 1)],
            now - Duration::hours(2),
        ))
        .await;
    store
        .put_cart(cart(2, 200, None, vec![], now - Duration::hours(48)))
        .await;

    assert_eq!(detector.sweep(now).await.unwrap(), 0);
    assert_eq!(store.abandoned_count().await, 0);
}

#[tokio::test]
async fn sweep_skips_carts_that_were_checked_out() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    let idle_since = now - Duration::hours(30);
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![cart_item("Granite slab", 2_000, None, 1)],
            idle_since,
        ))
        .await;

    // An order placed after the cart's last change means checkout won the
    // race, not abandonment.
    use storefront::model::{OrderStatus, PaymentStatus};
    use storefront::storage::{OrderDraft, OrderStorage};
    store
        .insert_order(OrderDraft {
            user_id: 100,
            order_number: common::generate_unique_id("ORD"),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            total: Decimal::from(2_000),
            customer_name: "Customer".to_string(),
            customer_phone: "+100".to_string(),
            customer_email: None,
            customer_address: String::new(),
            comment: None,
            items: vec![],
        })
        .await
        .unwrap();

    assert_eq!(detector.sweep(now).await.unwrap(), 0);
    assert_eq!(store.abandoned_count().await, 0);
}

#[tokio::test]
async fn mark_recovered_flips_once_then_noops() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![cart_item("Granite slab", 2_000, None, 1)],
            now - Duration::hours(25),
        ))
        .await;
    detector.sweep(now).await.unwrap();

    assert!(detector.mark_recovered(1).await.unwrap());
    let record = store.get_abandoned(1).await.unwrap();
    assert!(record.recovered);
    assert!(record.recovered_at.is_some());

    // Calling it again is a no-op.
    assert!(!detector.mark_recovered(1).await.unwrap());
    // And a cart with no record at all is a no-op too.
    assert!(!detector.mark_recovered(99).await.unwrap());
}

#[tokio::test]
async fn recovered_then_emptied_cart_is_not_reflagged() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![
                cart_item("Granite slab", 2_000, None, 1),
                cart_item("Marble tile", 3_000, None, 1),
            ],
            now - Duration::hours(25),
        ))
        .await;

    detector.sweep(now).await.unwrap();
    detector.mark_recovered(1).await.unwrap();
    // Checkout emptied the cart.
    store.clear_cart(1).await.unwrap();

    let later = now + Duration::hours(2);
    assert_eq!(detector.sweep(later).await.unwrap(), 0);
    let record = store.get_abandoned(1).await.unwrap();
    assert!(record.recovered);
}

#[tokio::test]
async fn cart_abandoned_again_after_recovery_reopens_the_record() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![cart_item("Granite slab", 2_000, None, 1)],
            now - Duration::hours(25),
        ))
        .await;
    detector.sweep(now).await.unwrap();
    store.mark_reminder_sent(1, now).await.unwrap();
    detector.mark_recovered(1).await.unwrap();

    // The same cart fills up again and goes idle again.
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![cart_item("Quartz countertop", 7_000, None, 1)],
            now - Duration::hours(26),
        ))
        .await;

    let later = now + Duration::hours(1);
    assert_eq!(detector.sweep(later).await.unwrap(), 1);
    assert_eq!(store.abandoned_count().await, 1);

    let record = store.get_abandoned(1).await.unwrap();
    assert!(!record.recovered);
    assert!(record.recovered_at.is_none());
    assert_eq!(record.items_count, 1);
    assert_eq!(record.total_amount, Decimal::from(7_000));
    // The reminder counter only ever goes up, surviving re-abandonment.
    assert_eq!(record.reminder_sent, 1);
}

#[tokio::test]
async fn reminders_respect_initial_delay_interval_and_cap() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    store
        .put_cart(cart(
            1,
            100,
            Some("42"),
            vec![cart_item("Granite slab", 2_000, None, 1)],
            now - Duration::hours(25),
        ))
        .await;
    detector.sweep(now).await.unwrap();

    store
        .update_reminder_settings(ReminderSettings {
            auto_reminders_enabled: true,
            reminder_interval_hours: 24,
            max_reminders: 2,
            initial_delay_hours: 24,
        })
        .await
        .unwrap();

    // Freshly tracked: the initial delay has not elapsed yet.
    assert_eq!(detector.send_due_reminders(now).await.unwrap(), 0);

    // Past the initial delay: one reminder, counter advanced.
    let first_due = now + Duration::hours(25);
    assert_eq!(detector.send_due_reminders(first_due).await.unwrap(), 1);
    assert_eq!(store.get_abandoned(1).await.unwrap().reminder_sent, 1);

    // A rerun inside the interval finds nothing due.
    assert_eq!(detector.send_due_reminders(first_due).await.unwrap(), 0);

    // Past the interval: the second and last allowed reminder.
    let second_due = first_due + Duration::hours(25);
    assert_eq!(detector.send_due_reminders(second_due).await.unwrap(), 1);

    // The cap holds from here on.
    let third_due = second_due + Duration::hours(48);
    assert_eq!(detector.send_due_reminders(third_due).await.unwrap(), 0);
    assert_eq!(store.get_abandoned(1).await.unwrap().reminder_sent, 2);

    let jobs = sink.jobs();
    assert_eq!(jobs.len(), 2);
    assert!(matches!(
        jobs[0].0.event,
        NotificationEvent::CartAbandoned { cart_id: 1, .. }
    ));
    assert_eq!(jobs[0].0.telegram_id.as_deref(), Some("42"));
}

#[tokio::test]
async fn reminders_are_skipped_when_disabled_or_unaddressable() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CapturingSink::new());
    let detector = service(&store, &sink);

    let now = Utc::now();
    // One cart with no telegram id.
    store
        .put_cart(cart(
            1,
            100,
            None,
            vec![cart_item("Granite slab", 2_000, None, 1)],
            now - Duration::hours(25),
        ))
        .await;
    detector.sweep(now).await.unwrap();

    let due = now + Duration::hours(25);
    assert_eq!(detector.send_due_reminders(due).await.unwrap(), 0);
    assert_eq!(sink.count(), 0);

    // Disabled settings short-circuit everything.
    store
        .update_reminder_settings(ReminderSettings {
            auto_reminders_enabled: false,
            ..ReminderSettings::default()
        })
        .await
        .unwrap();
    assert_eq!(detector.send_due_reminders(due).await.unwrap(), 0);
}
