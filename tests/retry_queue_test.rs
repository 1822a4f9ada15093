//! Retry queue semantics: scheduling, exponential deadlines, exhaustion.

use std::time::Duration;

use chrono::Utc;
use leadscrape::{
    open_memory_pool, RetryDisposition, RetryKind, RetryQueue, Session, SessionState,
    SessionStatus, SessionStore,
};

async fn store_with_session(session_id: &str) -> (SessionStore, sqlx::SqlitePool) {
    let pool = open_memory_pool().await.unwrap();
    let store = SessionStore::new(pool.clone());
    let session = Session {
        id: session_id.to_string(),
        user_id: "user".to_string(),
        config: leadscrape::SessionConfig::builder()
            .towns(["A"])
            .industries(["X"])
            .build()
            .unwrap(),
        state: SessionState {
            status: SessionStatus::Queued,
            progress_percent: 0.0,
            current_town: None,
            current_industry: None,
            processed_businesses: 0,
            started_at: None,
            updated_at: Utc::now(),
        },
        summary: None,
    };
    store.create_session(&session).await.unwrap();
    (store, pool)
}

#[tokio::test]
async fn enqueued_item_becomes_due_after_base_delay() {
    let (_store, pool) = store_with_session("s1").await;
    let queue = RetryQueue::with_policy(pool, Duration::ZERO, 3);

    let id = queue
        .enqueue("s1", RetryKind::Navigation, serde_json::json!({"town": "A"}))
        .await
        .unwrap();

    let due = queue.due_items("s1", Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, id);
    assert_eq!(due[0].kind, RetryKind::Navigation);
    assert_eq!(due[0].attempts, 0);
}

#[tokio::test]
async fn items_before_their_deadline_are_not_due() {
    let (_store, pool) = store_with_session("s1").await;
    let queue = RetryQueue::with_policy(pool, Duration::from_secs(3600), 3);

    queue
        .enqueue("s1", RetryKind::Lookup, serde_json::json!({"phone": "0111111111"}))
        .await
        .unwrap();

    assert!(queue.due_items("s1", Utc::now()).await.unwrap().is_empty());
    assert_eq!(queue.pending_count("s1").await.unwrap(), 1);
}

#[tokio::test]
async fn deadlines_increase_across_failures() {
    let (_store, pool) = store_with_session("s1").await;
    let queue = RetryQueue::with_policy(pool.clone(), Duration::from_secs(10), 5);

    let id = queue
        .enqueue("s1", RetryKind::Extraction, serde_json::json!({}))
        .await
        .unwrap();

    let mut last_deadline = None;
    for _ in 0..3 {
        queue.mark_failed(id).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT next_retry_at FROM retry_queue WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        if let Some(previous) = last_deadline {
            assert!(row.0 > previous, "deadline must strictly increase");
        }
        last_deadline = Some(row.0);
    }
}

#[tokio::test]
async fn exhaustion_round_trip() {
    let (_store, pool) = store_with_session("s1").await;
    let queue = RetryQueue::with_policy(pool, Duration::ZERO, 3);

    let id = queue
        .enqueue("s1", RetryKind::Navigation, serde_json::json!({}))
        .await
        .unwrap();

    assert_eq!(queue.mark_failed(id).await.unwrap(), RetryDisposition::Rescheduled);
    assert_eq!(queue.mark_failed(id).await.unwrap(), RetryDisposition::Rescheduled);
    assert_eq!(queue.mark_failed(id).await.unwrap(), RetryDisposition::Exhausted);

    // Exhausted items are parked, never yielded again
    assert!(queue.due_items("s1", Utc::now()).await.unwrap().is_empty());
    assert_eq!(queue.pending_count("s1").await.unwrap(), 0);
    assert_eq!(queue.exhausted_count("s1").await.unwrap(), 1);
}

#[tokio::test]
async fn success_removes_the_item() {
    let (_store, pool) = store_with_session("s1").await;
    let queue = RetryQueue::with_policy(pool, Duration::ZERO, 3);

    let id = queue
        .enqueue("s1", RetryKind::Lookup, serde_json::json!({"phone": "0111111111"}))
        .await
        .unwrap();
    queue.mark_succeeded(id).await.unwrap();

    assert_eq!(queue.pending_count("s1").await.unwrap(), 0);
    assert_eq!(queue.exhausted_count("s1").await.unwrap(), 0);
}

#[tokio::test]
async fn exhausted_lookups_do_not_count_as_uncovered_work() {
    let (_store, pool) = store_with_session("s1").await;
    let queue = RetryQueue::with_policy(pool, Duration::ZERO, 1);

    let lookup = queue
        .enqueue("s1", RetryKind::Lookup, serde_json::json!({"phone": "0111111111"}))
        .await
        .unwrap();
    let nav = queue
        .enqueue("s1", RetryKind::Navigation, serde_json::json!({"town": "A"}))
        .await
        .unwrap();
    queue.mark_failed(lookup).await.unwrap();
    queue.mark_failed(nav).await.unwrap();

    assert_eq!(queue.exhausted_count("s1").await.unwrap(), 2);
    assert_eq!(queue.exhausted_work_count("s1").await.unwrap(), 1);
}

#[tokio::test]
async fn session_delete_cascades_to_retry_items() {
    let (store, pool) = store_with_session("s1").await;
    let queue = RetryQueue::with_policy(pool.clone(), Duration::ZERO, 3);

    queue
        .enqueue("s1", RetryKind::Navigation, serde_json::json!({}))
        .await
        .unwrap();
    store.delete_session("s1").await.unwrap();

    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM retry_queue")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.0, 0);
}
