#![forbid(unsafe_code)]

use std::time::Duration;

use manta_store::{default_limiter, WorkQueue};

fn queue() -> WorkQueue<String> {
    WorkQueue::new(Box::new(default_limiter(
        Duration::from_millis(10),
        Duration::from_millis(80),
        f64::INFINITY,
        u32::MAX,
    )))
}

#[tokio::test]
async fn coalesces_while_queued() {
    let q = queue();
    for _ in 0..5 {
        q.add("a".to_string());
    }
    q.add("b".to_string());

    assert_eq!(q.get().await.as_deref(), Some("a"));
    assert_eq!(q.get().await.as_deref(), Some("b"));
    assert!(q.is_empty());
}

#[tokio::test]
async fn fifo_among_distinct_items() {
    let q = queue();
    for k in ["x", "y", "z"] {
        q.add(k.to_string());
    }
    assert_eq!(q.get().await.as_deref(), Some("x"));
    assert_eq!(q.get().await.as_deref(), Some("y"));
    assert_eq!(q.get().await.as_deref(), Some("z"));
}

#[tokio::test]
async fn in_flight_re_add_observed_once_at_done() {
    let q = queue();
    q.add("a".to_string());
    let item = q.get().await.unwrap();

    // Re-adds while in flight coalesce into a single dirty mark.
    q.add("a".to_string());
    q.add("a".to_string());
    assert!(q.is_empty(), "dirty in-flight item must not re-enter the FIFO early");

    q.done(&item);
    assert_eq!(q.get().await.as_deref(), Some("a"));
    q.done(&item);
    assert!(q.is_empty());
}

#[tokio::test]
async fn get_unblocks_on_shutdown() {
    let q = queue();
    let waiter = {
        let q = q.clone();
        tokio::spawn(async move { q.get().await })
    };
    tokio::task::yield_now().await;
    q.shutdown();
    assert_eq!(waiter.await.unwrap(), None);
}

#[tokio::test]
async fn shutdown_drains_queued_items_first() {
    let q = queue();
    q.add("a".to_string());
    q.add("b".to_string());
    q.shutdown();

    assert_eq!(q.get().await.as_deref(), Some("a"));
    assert_eq!(q.get().await.as_deref(), Some("b"));
    assert_eq!(q.get().await, None);

    // Adds after shutdown are dropped.
    q.add("c".to_string());
    assert_eq!(q.get().await, None);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_requeue_counts_and_delays() {
    let q = queue();
    let item = "a".to_string();
    assert_eq!(q.num_requeues(&item), 0);

    q.add_rate_limited(item.clone());
    assert_eq!(q.num_requeues(&item), 1);
    let start = tokio::time::Instant::now();
    assert_eq!(q.get().await.as_deref(), Some("a"));
    assert!(start.elapsed() >= Duration::from_millis(10));
    q.done(&item);

    q.add_rate_limited(item.clone());
    assert_eq!(q.num_requeues(&item), 2);
    let start = tokio::time::Instant::now();
    assert_eq!(q.get().await.as_deref(), Some("a"));
    assert!(start.elapsed() >= Duration::from_millis(20));
    q.done(&item);

    q.forget(&item);
    assert_eq!(q.num_requeues(&item), 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_is_monotone_and_bounded() {
    let q = queue();
    let item = "a".to_string();
    let mut last = Duration::ZERO;
    for _ in 0..6 {
        q.add_rate_limited(item.clone());
        let start = tokio::time::Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        let waited = start.elapsed();
        assert!(waited >= last, "delays must be non-decreasing");
        assert!(waited <= Duration::from_millis(100), "delays must honor the cap");
        last = waited;
        q.done(&item);
    }
}
