//! Event bus delivery, session-scoped filtering, metrics, shutdown.

use std::time::Duration;

use leadscrape::events::{EventBus, EventBusError, LogLevel, ScrapeEvent, ShutdownReason};
use leadscrape::SessionStatus;
use tokio::time::timeout;

#[tokio::test]
async fn emit_with_no_subscribers_is_counted_as_dropped() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);

    let delivered = bus.emit(ScrapeEvent::log("s1", LogLevel::Info, "hello"));
    assert_eq!(delivered, 0);

    let snapshot = bus.metrics().snapshot();
    assert_eq!(snapshot.events_published, 1);
    assert_eq!(snapshot.events_dropped, 1);
}

#[tokio::test]
async fn subscribers_receive_in_order() {
    let bus = EventBus::new();
    let mut receiver = bus.subscribe_all();

    bus.emit(ScrapeEvent::log("s1", LogLevel::Info, "first"));
    bus.emit(ScrapeEvent::log("s1", LogLevel::Info, "second"));

    for expected in ["first", "second"] {
        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("no timeout")
            .expect("event received");
        match event {
            ScrapeEvent::Log { message, .. } => assert_eq!(message, expected),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn session_stream_filters_other_sessions() {
    let bus = EventBus::new();
    let mut stream = bus.subscribe("s1");

    bus.emit(ScrapeEvent::log("s2", LogLevel::Info, "not for us"));
    bus.emit(ScrapeEvent::progress("s1", 50.0, None, None, 10));

    let event = timeout(Duration::from_millis(100), stream.recv())
        .await
        .expect("no timeout")
        .expect("event received");
    match event {
        ScrapeEvent::Progress { session_id, percent, .. } => {
            assert_eq!(session_id, "s1");
            assert_eq!(percent, 50.0);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn session_stream_sees_bus_shutdown() {
    let bus = EventBus::new();
    let mut stream = bus.subscribe("s1");

    bus.shutdown(ShutdownReason::CoreStopped);

    let event = timeout(Duration::from_millis(100), stream.recv())
        .await
        .expect("no timeout")
        .expect("shutdown delivered");
    assert!(matches!(event, ScrapeEvent::Shutdown { .. }));
}

#[tokio::test]
async fn lagged_subscriber_is_disconnected() {
    let bus = EventBus::with_capacity(4);
    let mut stream = bus.subscribe("s1");

    for i in 0..32 {
        bus.emit(ScrapeEvent::log("s1", LogLevel::Debug, format!("event {i}")));
    }

    let result = stream.recv().await;
    assert!(matches!(result, Err(EventBusError::ReceiverLagged(_))));
}

#[tokio::test]
async fn lifecycle_events_carry_both_states() {
    let bus = EventBus::new();
    let mut receiver = bus.subscribe_all();

    bus.emit(ScrapeEvent::lifecycle(
        "s1",
        SessionStatus::Queued,
        SessionStatus::Running,
    ));

    let event = timeout(Duration::from_millis(100), receiver.recv())
        .await
        .expect("no timeout")
        .expect("event received");
    match event {
        ScrapeEvent::Lifecycle { from, to, .. } => {
            assert_eq!(from, SessionStatus::Queued);
            assert_eq!(to, SessionStatus::Running);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
