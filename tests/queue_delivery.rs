//! End-to-end delivery, retry and dead letter behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use resilient_queue::queue::{handler_fn, HandlerError, MessagePriority, MessageStatus, Payload, QueueError};

mod common;

const WAIT: Duration = Duration::from_secs(5);

fn payload(n: u64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("n".to_string(), json!(n));
    payload
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let h = common::harness(&common::fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    h.queue.register_handler(
        "email",
        handler_fn(move |_user: String, _payload: Payload| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(HandlerError::new("SmtpError", "connection reset"))
                } else {
                    Ok(())
                }
            }
        }),
    );

    let message = h.queue.new_message("user-1", "email", payload(1));
    assert!(h.queue.enqueue(message).await);
    h.queue.process_queue(2).await.unwrap();

    let queue = &h.queue;
    assert!(common::wait_until(WAIT, || async move { queue.stats().await.unwrap().completed == 1 }).await);
    h.queue.stop_processing().await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(h.queue.get_dead_letter_queue_messages(10).await.unwrap().is_empty());

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.retrying, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_exhausted_messages_are_dead_lettered() {
    let mut config = common::fast_config();
    config.retry.max_retries = 3;
    let h = common::harness(&config);

    h.queue.register_handler(
        "webhook",
        handler_fn(|_user: String, _payload: Payload| async move {
            Err::<(), _>(HandlerError::new("HttpError", "503 from upstream"))
        }),
    );

    const N: u64 = 5;
    for n in 0..N {
        h.queue.enqueue(h.queue.new_message("user-2", "webhook", payload(n))).await;
    }
    h.queue.process_queue(3).await.unwrap();

    let queue = &h.queue;
    assert!(
        common::wait_until(WAIT, || async move {
            queue.stats().await.unwrap().dead_letters == N as usize
        })
        .await
    );
    h.queue.stop_processing().await;

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.dead_letters as u64 + stats.completed, N);

    let entries = h.queue.get_dead_letter_queue_messages(100).await.unwrap();
    assert_eq!(entries.len(), N as usize);
    for entry in &entries {
        assert_eq!(entry.message.status, MessageStatus::DeadLetter);
        assert!(entry.message.permanent_failure);
        assert_eq!(entry.message.retry_count, 3);
        assert_eq!(entry.retry_history.len(), 3);
        assert!(entry.retry_history.iter().all(|a| a.error_type == "HttpError"));
        assert!(entry.final_error.contains("503"));
    }

    // Most recent first.
    for pair in entries.windows(2) {
        assert!(pair[0].moved_to_dlq_at >= pair[1].moved_to_dlq_at);
    }
    assert_eq!(h.queue.get_dead_letter_queue_messages(2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_reprocess_dead_letter_message() {
    let mut config = common::fast_config();
    config.retry.max_retries = 1;
    let h = common::harness(&config);

    let healthy = Arc::new(AtomicU32::new(0));
    h.queue.register_handler(
        "report",
        handler_fn(|_user: String, _payload: Payload| async move {
            Err::<(), _>(HandlerError::msg("renderer crashed"))
        }),
    );

    let message = h.queue.new_message("user-3", "report", payload(7));
    let id = message.id.clone();
    h.queue.enqueue(message).await;
    h.queue.process_queue(1).await.unwrap();

    let queue = &h.queue;
    assert!(common::wait_until(WAIT, || async move { queue.stats().await.unwrap().dead_letters == 1 }).await);

    let c = healthy.clone();
    h.queue.register_handler(
        "report",
        handler_fn(move |_user: String, payload: Payload| {
            let c = c.clone();
            async move {
                assert_eq!(payload.get("n"), Some(&json!(7)));
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    assert!(h.queue.reprocess_dead_letter_message(&id).await.unwrap());
    assert!(!h.queue.reprocess_dead_letter_message(&id).await.unwrap());
    assert!(!h.queue.reprocess_dead_letter_message("missing").await.unwrap());

    assert!(common::wait_until(WAIT, || async move { queue.stats().await.unwrap().completed == 1 }).await);
    h.queue.stop_processing().await;

    assert_eq!(healthy.load(Ordering::SeqCst), 1);
    assert!(h.queue.get_dead_letter_queue_messages(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_higher_priority_served_first() {
    let h = common::harness(&common::fast_config());
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    h.queue.register_handler(
        "job",
        handler_fn(move |_user: String, payload: Payload| {
            let o = o.clone();
            async move {
                o.lock().push(payload["n"].as_u64().unwrap_or_default());
                Ok(())
            }
        }),
    );

    for (n, priority) in [
        (1, MessagePriority::Low),
        (2, MessagePriority::Normal),
        (3, MessagePriority::High),
        (4, MessagePriority::Low),
        (5, MessagePriority::High),
    ] {
        let message = h.queue.new_message("user-4", "job", payload(n)).with_priority(priority);
        h.queue.enqueue(message).await;
    }

    h.queue.process_queue(1).await.unwrap();
    let queue = &h.queue;
    assert!(common::wait_until(WAIT, || async move { queue.stats().await.unwrap().completed == 5 }).await);
    h.queue.stop_processing().await;

    // FIFO within a priority.
    assert_eq!(*order.lock(), vec![3, 5, 2, 1, 4]);
}

#[tokio::test]
async fn test_missing_handler_is_retried_by_default() {
    let mut config = common::fast_config();
    config.retry.max_retries = 2;
    let h = common::harness(&config);

    h.queue.enqueue(h.queue.new_message("user-5", "unknown", payload(0))).await;
    h.queue.process_queue(1).await.unwrap();

    let queue = &h.queue;
    assert!(common::wait_until(WAIT, || async move { queue.stats().await.unwrap().dead_letters == 1 }).await);
    h.queue.stop_processing().await;

    let entry = &h.queue.get_dead_letter_queue_messages(1).await.unwrap()[0];
    assert_eq!(entry.retry_history.len(), 2);
    assert_eq!(entry.retry_history[0].error_type, "HandlerNotFound");
}

#[tokio::test]
async fn test_missing_handler_fail_fast() {
    let mut config = common::fast_config();
    config.queue.fail_fast_on_missing_handler = true;
    let h = common::harness(&config);

    h.queue.enqueue(h.queue.new_message("user-5", "unknown", payload(0))).await;
    h.queue.process_queue(1).await.unwrap();

    let queue = &h.queue;
    assert!(common::wait_until(WAIT, || async move { queue.stats().await.unwrap().dead_letters == 1 }).await);
    h.queue.stop_processing().await;

    let entry = &h.queue.get_dead_letter_queue_messages(1).await.unwrap()[0];
    assert_eq!(entry.retry_history.len(), 1);
    assert!(entry.final_error.contains("unknown"));
}

#[tokio::test]
async fn test_processing_lifecycle() {
    let h = common::harness(&common::fast_config());

    assert!(matches!(h.queue.process_queue(0).await, Err(QueueError::NoWorkers)));
    assert!(!h.queue.is_processing().await);

    h.queue.process_queue(2).await.unwrap();
    assert!(h.queue.is_processing().await);
    assert!(matches!(h.queue.process_queue(2).await, Err(QueueError::AlreadyRunning)));

    h.queue.stop_processing().await;
    assert!(!h.queue.is_processing().await);
    h.queue.stop_processing().await;

    // Restartable after a stop.
    h.queue.process_queue(1).await.unwrap();
    h.queue.stop_processing().await;
}

#[tokio::test]
async fn test_breakers_registered_in_shared_registry() {
    let h = common::harness(&common::fast_config());

    assert_eq!(h.registry.len(), 2);
    let statuses = h.queue.breaker_statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().any(|s| s.name == "queue_storage"));
    assert!(statuses.iter().any(|s| s.name == "queue_handlers"));
    assert!(Arc::ptr_eq(
        h.queue.storage_breaker(),
        &h.registry.get("queue_storage").unwrap()
    ));
}
