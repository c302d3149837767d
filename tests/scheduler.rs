mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use chain_crawler::config::{SchedulerConfig, SchedulerMode};
use chain_crawler::ethereum::subscriber::HeadSubscriber;
use chain_crawler::scheduler::Scheduler;
use chain_crawler::shutdown::Shutdown;

use common::*;

fn bookkeeping_config() -> SchedulerConfig {
    SchedulerConfig {
        mode: SchedulerMode::Polling,
        polling_interval: Duration::from_millis(25),
        max_retries: 3,
        skip_duration: Duration::from_secs(60),
        ..SchedulerConfig::default()
    }
}

/// A persistently failing block hits its retry budget, is skipped for the
/// cooldown window, and is retried with fresh counters afterwards.
#[tokio::test]
async fn failing_block_enters_and_leaves_the_skip_window() {
    let gateway = MockGateway::new();
    gateway.add_block(200, vec![transaction_fixture(200, 0, "1")]);
    gateway.fail_block(200);

    let harness = harness(gateway);
    let scheduler = scheduler_with(&harness, bookkeeping_config(), fast_crawler_config(), 200);

    for _ in 0..3 {
        scheduler.handle_new_block(200).await;
    }
    assert_eq!(scheduler.failure_count(200).await, 3);
    assert!(scheduler.is_skipped(200).await);

    // Notifications inside the window are ignored: no RPC traffic.
    let requests_before = harness.gateway.block_requests.load(Ordering::SeqCst);
    scheduler.handle_new_block(200).await;
    scheduler.handle_new_block(200).await;
    assert_eq!(
        harness.gateway.block_requests.load(Ordering::SeqCst),
        requests_before
    );

    // After the window the block is retried and the counters reset.
    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(61)).await;
    harness.gateway.heal_block(200);

    scheduler.handle_new_block(200).await;
    assert_eq!(scheduler.failure_count(200).await, 0);
    assert!(!scheduler.is_skipped(200).await);
    assert_eq!(harness.db.processed_numbers(), vec![200]);
}

/// Errors that look like duplicate-key or immutable-field rejections mean
/// the block is already present and are not counted against the budget.
#[tokio::test]
async fn write_conflicts_are_not_counted_as_failures() {
    let harness = harness(MockGateway::new());
    let scheduler = scheduler_with(&harness, bookkeeping_config(), fast_crawler_config(), 1);

    scheduler
        .record_failure(42, &anyhow!("E11000 duplicate key error"))
        .await;
    scheduler
        .record_failure(
            42,
            &anyhow!("would modify the immutable field '_id'"),
        )
        .await;

    assert_eq!(scheduler.failure_count(42).await, 0);
    assert!(!scheduler.is_skipped(42).await);
}

/// The cursor only ever moves forward.
#[tokio::test]
async fn success_advances_the_cursor_monotonically() {
    let harness = harness(MockGateway::new());
    let scheduler = scheduler_with(&harness, bookkeeping_config(), fast_crawler_config(), 1);

    scheduler.record_success(5).await;
    assert_eq!(scheduler.current_block().await, 6);

    scheduler.record_success(3).await;
    assert_eq!(scheduler.current_block().await, 6);

    assert_eq!(harness.db.metrics.lock().unwrap().len(), 2);
}

fn hybrid_scheduler(harness: &Harness) -> Arc<Scheduler> {
    let subscriber = Arc::new(HeadSubscriber::new(
        "ws://127.0.0.1:1/".parse().unwrap(),
        1,
        Duration::from_millis(10),
    ));

    Arc::new(
        Scheduler::new(
            SchedulerConfig {
                mode: SchedulerMode::Hybrid,
                polling_interval: Duration::from_millis(25),
                fallback_timeout: Duration::from_secs(30),
                ..SchedulerConfig::default()
            },
            fast_crawler_config(),
            harness.crawler.clone(),
            harness.gateway.clone(),
            harness.db.clone(),
            Some(subscriber),
            1,
            NETWORK.to_string(),
            Shutdown::new(Duration::from_secs(30), Duration::from_secs(1)),
        )
        .unwrap(),
    )
}

/// Hybrid fallback: polling starts when heads stall and stops once they
/// resume with the subscriber up. Both transitions are idempotent.
#[tokio::test]
async fn hybrid_fallback_starts_and_stops_polling() {
    let harness = harness(MockGateway::new());
    let scheduler = hybrid_scheduler(&harness);

    assert!(!scheduler.polling_active().await);

    scheduler.apply_fallback(true, false).await;
    assert!(scheduler.polling_active().await);

    // A second stalled tick must not spawn a second worker.
    scheduler.apply_fallback(true, false).await;
    assert!(scheduler.polling_active().await);

    // Heads resumed but the subscriber is not confirmed running yet.
    scheduler.apply_fallback(false, false).await;
    assert!(scheduler.polling_active().await);

    scheduler.apply_fallback(false, true).await;
    assert!(!scheduler.polling_active().await);

    // Stopping twice is a no-op.
    scheduler.apply_fallback(false, true).await;
    assert!(!scheduler.polling_active().await);

    scheduler.stop().await;
}

/// Realtime and hybrid modes require a websocket endpoint.
#[tokio::test]
async fn realtime_mode_without_a_subscriber_is_rejected() {
    let harness = harness(MockGateway::new());

    let result = Scheduler::new(
        SchedulerConfig {
            mode: SchedulerMode::Realtime,
            ..SchedulerConfig::default()
        },
        fast_crawler_config(),
        harness.crawler.clone(),
        harness.gateway.clone(),
        harness.db.clone(),
        None,
        1,
        NETWORK.to_string(),
        Shutdown::new(Duration::from_secs(30), Duration::from_secs(1)),
    );

    assert!(result.is_err());
}

/// A zero batch size is a configuration error.
#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let harness = harness(MockGateway::new());
    let mut crawler_config = fast_crawler_config();
    crawler_config.batch_size = 0;

    let result = Scheduler::new(
        bookkeeping_config(),
        crawler_config,
        harness.crawler.clone(),
        harness.gateway.clone(),
        harness.db.clone(),
        None,
        1,
        NETWORK.to_string(),
        Shutdown::new(Duration::from_secs(30), Duration::from_secs(1)),
    );

    assert!(result.is_err());
}
