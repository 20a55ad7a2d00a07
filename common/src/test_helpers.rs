/// Shared test helpers for cross-crate use.
///
/// Centralized here so the `pipeline` and `storefront` test suites can
/// generate identifiers that never collide across parallel test threads.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// Global counter for truly unique test identifiers across parallel tests
static GLOBAL_TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique string identifier with a readable prefix,
/// e.g. `"CART-1733828312000-17"`.
pub fn generate_unique_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();
    let counter = GLOBAL_TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}-{}", prefix, timestamp, counter)
}

/// Generate a unique numeric id suitable for entity ids in tests.
pub fn generate_unique_test_id() -> i64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let counter = GLOBAL_TEST_COUNTER.fetch_add(1, Ordering::SeqCst) as i64;

    (timestamp % 100_000) * 1_000_000 + counter
}
