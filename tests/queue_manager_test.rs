//! Admission control: single active session, contiguous positions,
//! promotion, abandonment.

use std::time::Duration;

use chrono::Utc;
use leadscrape::{
    open_memory_pool, Admission, QueueManager, QueueStanding, Session, SessionState,
    SessionStatus, SessionStore,
};

async fn setup() -> (SessionStore, QueueManager, sqlx::SqlitePool) {
    let pool = open_memory_pool().await.unwrap();
    (
        SessionStore::new(pool.clone()),
        QueueManager::new(pool.clone()),
        pool,
    )
}

async fn create_session(store: &SessionStore, id: &str, user: &str) {
    let session = Session {
        id: id.to_string(),
        user_id: user.to_string(),
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
}

#[tokio::test]
async fn first_request_starts_immediately() {
    let (store, queue, _pool) = setup().await;
    create_session(&store, "s1", "u1").await;

    assert_eq!(queue.request("s1", "u1").await.unwrap(), Admission::Started);
    assert_eq!(queue.standing("s1").await.unwrap(), QueueStanding::Active);
    assert_eq!(queue.active_session().await.unwrap(), Some("s1".to_string()));
}

#[tokio::test]
async fn later_requests_queue_with_contiguous_positions() {
    let (store, queue, _pool) = setup().await;
    for (id, user) in [("s1", "u1"), ("s2", "u2"), ("s3", "u3"), ("s4", "u4")] {
        create_session(&store, id, user).await;
    }

    assert_eq!(queue.request("s1", "u1").await.unwrap(), Admission::Started);
    assert_eq!(
        queue.request("s2", "u2").await.unwrap(),
        Admission::Queued { position: 1 }
    );
    assert_eq!(
        queue.request("s3", "u3").await.unwrap(),
        Admission::Queued { position: 2 }
    );
    assert_eq!(
        queue.request("s4", "u4").await.unwrap(),
        Admission::Queued { position: 3 }
    );

    assert_eq!(queue.waiting_positions().await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn cancel_compacts_positions() {
    let (store, queue, _pool) = setup().await;
    for (id, user) in [("s1", "u1"), ("s2", "u2"), ("s3", "u3"), ("s4", "u4")] {
        create_session(&store, id, user).await;
        queue.request(id, user).await.unwrap();
    }

    // s3 held position 2; s4 shifts from 3 to 2
    assert!(queue.cancel_waiting("s3").await.unwrap());
    assert_eq!(queue.waiting_positions().await.unwrap(), vec![1, 2]);
    assert_eq!(
        queue.standing("s4").await.unwrap(),
        QueueStanding::Waiting { position: 2 }
    );

    // Cancelling a non-waiting session is a no-op
    assert!(!queue.cancel_waiting("s1").await.unwrap());
    assert!(!queue.cancel_waiting("missing").await.unwrap());
}

#[tokio::test]
async fn completion_promotes_the_head() {
    let (store, queue, _pool) = setup().await;
    for (id, user) in [("s1", "u1"), ("s2", "u2"), ("s3", "u3")] {
        create_session(&store, id, user).await;
        queue.request(id, user).await.unwrap();
    }

    let promoted = queue.complete("s1").await.unwrap();
    assert_eq!(promoted, Some("s2".to_string()));
    assert_eq!(queue.standing("s2").await.unwrap(), QueueStanding::Active);
    assert_eq!(queue.waiting_positions().await.unwrap(), vec![1]);
    assert_eq!(
        queue.standing("s3").await.unwrap(),
        QueueStanding::Waiting { position: 1 }
    );

    // Admit-complete-admit round trip keeps compacting
    let promoted = queue.complete("s2").await.unwrap();
    assert_eq!(promoted, Some("s3".to_string()));
    assert_eq!(queue.complete("s3").await.unwrap(), None);
    assert!(queue.waiting_positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn at_most_one_session_is_ever_active() {
    let (store, queue, pool) = setup().await;
    for (id, user) in [("s1", "u1"), ("s2", "u2"), ("s3", "u3")] {
        create_session(&store, id, user).await;
        queue.request(id, user).await.unwrap();
    }

    for finished in ["s1", "s2", "s3"] {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_entries WHERE status = 'active'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(row.0 <= 1, "more than one active entry");
        queue.complete(finished).await.unwrap();
    }
}

#[tokio::test]
async fn abandoned_entries_are_swept() {
    let (store, queue, pool) = setup().await;
    for (id, user) in [("s1", "u1"), ("s2", "u2"), ("s3", "u3")] {
        create_session(&store, id, user).await;
        queue.request(id, user).await.unwrap();
    }

    // Backdate s2's enqueue time past the abandonment window
    let old = Utc::now().timestamp() - 25 * 3600;
    sqlx::query("UPDATE queue_entries SET enqueued_at = ? WHERE session_id = 's2'")
        .bind(old)
        .execute(&pool)
        .await
        .unwrap();

    let swept = queue
        .sweep_abandoned(Duration::from_secs(24 * 3600))
        .await
        .unwrap();
    assert_eq!(swept, vec!["s2".to_string()]);
    assert_eq!(queue.waiting_positions().await.unwrap(), vec![1]);
    assert_eq!(
        queue.standing("s3").await.unwrap(),
        QueueStanding::Waiting { position: 1 }
    );
}
