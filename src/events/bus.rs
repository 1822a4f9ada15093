//! The broadcast-backed event bus and per-session subscription handle.

use log::debug;
use tokio::sync::broadcast;

use super::metrics::EventBusMetrics;
use super::types::{ScrapeEvent, ShutdownReason};
use super::EventBusError;

const DEFAULT_CAPACITY: usize = 1024;

/// Event bus for publishing and subscribing to scrape events.
///
/// Delivery is at-most-once per subscriber, in enqueue order. The buffer is
/// bounded: a subscriber that falls more than the capacity behind is lagged
/// out and must resubscribe.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ScrapeEvent>,
    metrics: EventBusMetrics,
}

impl EventBus {
    /// Create a bus with the default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit buffer capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            metrics: EventBusMetrics::new(),
        }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it. Publishing with
    /// no subscribers is not an error for the pipeline: the event is counted
    /// as dropped and the scrape continues.
    pub fn emit(&self, event: ScrapeEvent) -> usize {
        match self.sender.send(event) {
            Ok(count) => {
                self.metrics.record_publish(count);
                count
            }
            Err(_) => {
                self.metrics.record_publish(0);
                debug!("published event with no active subscribers");
                0
            }
        }
    }

    /// Subscribe to the raw event stream (all sessions)
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<ScrapeEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`, for surfaces that forward events (SSE,
    /// websockets). Lag shows up as stream errors.
    #[must_use]
    pub fn stream_all(&self) -> tokio_stream::wrappers::BroadcastStream<ScrapeEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.sender.subscribe())
    }

    /// Subscribe to events for a single session
    #[must_use]
    pub fn subscribe(&self, session_id: &str) -> SessionEvents {
        SessionEvents {
            receiver: self.sender.subscribe(),
            session_id: session_id.to_string(),
        }
    }

    /// Number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let count = self.sender.receiver_count();
        self.metrics.update_subscribers(count);
        count
    }

    /// Bus health counters
    #[must_use]
    pub fn metrics(&self) -> &EventBusMetrics {
        &self.metrics
    }

    /// Broadcast a shutdown event so receive loops can exit
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.emit(ScrapeEvent::shutdown(reason));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver yielding only one session's events (plus bus-wide shutdown).
///
/// Wraps the broadcast receiver; events for other sessions are skipped
/// without being surfaced.
#[derive(Debug)]
pub struct SessionEvents {
    receiver: broadcast::Receiver<ScrapeEvent>,
    session_id: String,
}

impl SessionEvents {
    /// Receive the next event for this session.
    ///
    /// Returns `Err(Shutdown)` when the bus closes or a shutdown event is
    /// observed, `Err(ReceiverLagged)` when this subscriber fell behind the
    /// bounded buffer and was disconnected.
    pub async fn recv(&mut self) -> Result<ScrapeEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event @ ScrapeEvent::Shutdown { .. }) => {
                    // Deliver the shutdown marker once, then the stream ends
                    return Ok(event);
                }
                Ok(event) if event.session_id() == Some(self.session_id.as_str()) => {
                    return Ok(event);
                }
                Ok(_) => {} // other session, skip
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(EventBusError::ReceiverLagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::Shutdown);
                }
            }
        }
    }

    /// Session this stream is scoped to
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
