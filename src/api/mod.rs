//! The control and query surface the rest of the application consumes.
//!
//! `ScraperCore` wires the stores, queue manager, event bus, and
//! orchestrator together over one injected Page Driver factory. Requests
//! validate synchronously; everything recoverable after admission is
//! reported through the event stream instead of errors.

use dashmap::DashMap;
use sqlx::SqlitePool;
use tracing::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::SessionConfig;
use crate::error::{ScrapeError, ScrapeResult};
use crate::events::{EventBus, ScrapeEvent, SessionEvents};
use crate::orchestrator::{CoreContext, Orchestrator, SessionControl};
use crate::page_driver::PageDriverFactory;
use crate::provider_cache::ProviderCache;
use crate::queue_manager::{Admission, QueueManager, QueueStanding, ABANDONED_AFTER};
use crate::retry_queue::RetryQueue;
use crate::session::{
    BusinessRecord, Session, SessionState, SessionStatus, SessionSummary,
};
use crate::store::SessionStore;

/// Grace period before a stale `running` session from a dead process is
/// marked errored
pub const RECOVERY_GRACE: Duration = Duration::from_secs(120);
/// Cadence of the background sweeps (queue abandonment, cache TTL)
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// Reply to `start_session`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReply {
    pub admission: Admission,
}

/// Reply to `queue_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatusReply {
    /// The session holds the active slot
    Active,
    /// Waiting with a 1-based position and a rough wait estimate
    Waiting {
        position: u32,
        estimated_wait_ms: Option<u64>,
    },
    /// Not in the queue at all
    NotQueued,
}

struct CoreInner {
    ctx: Arc<CoreContext>,
    controls: DashMap<String, Arc<SessionControl>>,
}

/// Process-wide entry point to the scraper core
#[derive(Clone)]
pub struct ScraperCore {
    inner: Arc<CoreInner>,
}

impl ScraperCore {
    /// Assemble the core over an opened database pool and an injected
    /// driver factory.
    #[must_use]
    pub fn new(pool: SqlitePool, factory: Arc<dyn PageDriverFactory>) -> Self {
        let store = SessionStore::new(pool.clone());
        let ctx = Arc::new(CoreContext {
            store,
            retry_queue: RetryQueue::new(pool.clone()),
            cache: Arc::new(ProviderCache::new(pool.clone())),
            queue: QueueManager::new(pool),
            events: Arc::new(EventBus::new()),
            factory,
        });
        Self {
            inner: Arc::new(CoreInner {
                ctx,
                controls: DashMap::new(),
            }),
        }
    }

    /// The bus external surfaces tail
    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.ctx.events)
    }

    /// Subscribe to one session's event stream
    #[must_use]
    pub fn subscribe(&self, session_id: &str) -> SessionEvents {
        self.inner.ctx.events.subscribe(session_id)
    }

    /// Create a session and either start it now or queue it.
    ///
    /// Fails synchronously on config violations (handled upstream by the
    /// builder) and on a second live session for the same user.
    pub async fn start_session(
        &self,
        user_id: &str,
        config: SessionConfig,
    ) -> ScrapeResult<(String, StartReply)> {
        if let Some(live) = self.inner.ctx.store.live_session_for_user(user_id).await? {
            warn!("user {user_id} already has live session {live}");
            return Err(ScrapeError::UserBusy(user_id.to_string()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Session {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            config,
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
        self.inner.ctx.store.create_session(&session).await?;

        let admission = self
            .inner
            .ctx
            .queue
            .request(&session_id, user_id)
            .await?;

        match admission {
            Admission::Started => {
                Self::spawn_run(Arc::clone(&self.inner), session_id.clone());
            }
            Admission::Queued { position } => {
                info!("session {session_id} queued at position {position}");
            }
        }

        Ok((session_id, StartReply { admission }))
    }

    /// Pause a running session at its next safe point
    pub async fn pause_session(&self, session_id: &str) -> ScrapeResult<()> {
        let status = self.current_status(session_id).await?;
        if status != SessionStatus::Running {
            return Err(ScrapeError::WrongState {
                id: session_id.to_string(),
                status,
                action: "pause",
            });
        }
        let control = self
            .inner
            .controls
            .get(session_id)
            .ok_or_else(|| ScrapeError::NotFound(session_id.to_string()))?;
        control.pause();
        Ok(())
    }

    /// Resume a paused session from its checkpoint
    pub async fn resume_session(&self, session_id: &str) -> ScrapeResult<()> {
        let status = self.current_status(session_id).await?;
        if status != SessionStatus::Paused {
            return Err(ScrapeError::WrongState {
                id: session_id.to_string(),
                status,
                action: "resume",
            });
        }
        Self::spawn_run(Arc::clone(&self.inner), session_id.to_string());
        Ok(())
    }

    /// Stop a running or paused session
    pub async fn stop_session(&self, session_id: &str) -> ScrapeResult<()> {
        let status = self.current_status(session_id).await?;
        match status {
            SessionStatus::Running => {
                let control = self
                    .inner
                    .controls
                    .get(session_id)
                    .ok_or_else(|| ScrapeError::NotFound(session_id.to_string()))?;
                control.stop();
                Ok(())
            }
            SessionStatus::Paused => {
                // No run loop to signal; finalize directly
                let summary = self.summary_from_store(session_id).await?;
                self.inner
                    .ctx
                    .store
                    .finalize_session(session_id, SessionStatus::Stopped, &summary)
                    .await?;
                self.inner.ctx.events.emit(ScrapeEvent::lifecycle(
                    session_id,
                    SessionStatus::Paused,
                    SessionStatus::Stopped,
                ));
                Self::promote_next(Arc::clone(&self.inner), session_id).await;
                Ok(())
            }
            other => Err(ScrapeError::WrongState {
                id: session_id.to_string(),
                status: other,
                action: "stop",
            }),
        }
    }

    /// Cancel a session that is still waiting in the queue
    pub async fn cancel_queued(&self, session_id: &str) -> ScrapeResult<()> {
        let status = self.current_status(session_id).await?;
        if status != SessionStatus::Queued {
            return Err(ScrapeError::WrongState {
                id: session_id.to_string(),
                status,
                action: "cancel",
            });
        }
        self.inner.ctx.queue.cancel_waiting(session_id).await?;
        self.inner
            .ctx
            .store
            .finalize_session(session_id, SessionStatus::Cancelled, &SessionSummary::default())
            .await?;
        self.inner.ctx.events.emit(ScrapeEvent::lifecycle(
            session_id,
            SessionStatus::Queued,
            SessionStatus::Cancelled,
        ));
        Ok(())
    }

    /// Queue standing with a rough wait estimate
    pub async fn queue_status(&self, session_id: &str) -> ScrapeResult<QueueStatusReply> {
        match self.inner.ctx.queue.standing(session_id).await? {
            QueueStanding::Active => Ok(QueueStatusReply::Active),
            QueueStanding::Waiting { position } => {
                let mean = self.inner.ctx.store.mean_completed_duration_ms().await?;
                Ok(QueueStatusReply::Waiting {
                    position,
                    estimated_wait_ms: mean.map(|m| m * u64::from(position)),
                })
            }
            QueueStanding::NotQueued => Ok(QueueStatusReply::NotQueued),
        }
    }

    /// Live state snapshot
    pub async fn session_state(&self, session_id: &str) -> ScrapeResult<SessionState> {
        let session = self
            .inner
            .ctx
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| ScrapeError::NotFound(session_id.to_string()))?;
        Ok(session.state)
    }

    /// Paginated session list for a user
    pub async fn list_sessions_for_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> ScrapeResult<Vec<Session>> {
        Ok(self
            .inner
            .ctx
            .store
            .sessions_for_user(user_id, page, limit)
            .await?)
    }

    /// Paginated business records for a session
    pub async fn session_businesses(
        &self,
        session_id: &str,
        page: u32,
        limit: u32,
    ) -> ScrapeResult<Vec<BusinessRecord>> {
        Ok(self
            .inner
            .ctx
            .store
            .businesses_page(session_id, page, limit)
            .await?)
    }

    /// Recover from a previous process dying mid-session.
    ///
    /// Sessions still marked `running` whose last heartbeat is older than
    /// `grace` are moved to `error`; their checkpoints stay for a
    /// user-triggered resume. Call once at startup.
    pub async fn recover(&self, grace: Duration) -> ScrapeResult<()> {
        let stale = self
            .inner
            .ctx
            .store
            .stale_running_sessions(grace.as_secs() as i64)
            .await?;
        for session_id in stale {
            warn!("marking stale running session {session_id} as errored");
            self.inner
                .ctx
                .store
                .finalize_session(&session_id, SessionStatus::Error, &SessionSummary::default())
                .await?;
            self.inner.ctx.events.emit(ScrapeEvent::lifecycle(
                &session_id,
                SessionStatus::Running,
                SessionStatus::Error,
            ));
            Self::promote_next(Arc::clone(&self.inner), &session_id).await;
        }
        Ok(())
    }

    /// Start the periodic sweeps: queue abandonment and cache TTL eviction.
    ///
    /// Call once after construction; the task runs for the process lifetime.
    pub fn start_maintenance(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                match inner.ctx.queue.sweep_abandoned(ABANDONED_AFTER).await {
                    Ok(swept) => {
                        for session_id in swept {
                            let _ = inner
                                .ctx
                                .store
                                .finalize_session(
                                    &session_id,
                                    SessionStatus::Cancelled,
                                    &SessionSummary::default(),
                                )
                                .await;
                            inner.ctx.events.emit(ScrapeEvent::lifecycle(
                                &session_id,
                                SessionStatus::Queued,
                                SessionStatus::Cancelled,
                            ));
                        }
                    }
                    Err(e) => warn!("queue sweep failed: {e:#}"),
                }
                if let Err(e) = inner.ctx.cache.evict_stale().await {
                    warn!("cache eviction failed: {e:#}");
                }
            }
        });
    }

    async fn current_status(&self, session_id: &str) -> ScrapeResult<SessionStatus> {
        let session = self
            .inner
            .ctx
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| ScrapeError::NotFound(session_id.to_string()))?;
        Ok(session.state.status)
    }

    async fn summary_from_store(&self, session_id: &str) -> ScrapeResult<SessionSummary> {
        let total = self.inner.ctx.store.count_businesses(session_id).await?;
        Ok(SessionSummary {
            total_businesses: total,
            ..SessionSummary::default()
        })
    }

    /// Launch (or resume) a session run on a fresh control handle.
    fn spawn_run(inner: Arc<CoreInner>, session_id: String) {
        let control = Arc::new(SessionControl::new());
        inner.controls.insert(session_id.clone(), Arc::clone(&control));

        tokio::spawn(async move {
            let orchestrator = Orchestrator::new(Arc::clone(&inner.ctx));
            let result = orchestrator.run_session(&session_id, control).await;

            let ended_paused = matches!(result, Ok(SessionStatus::Paused));
            inner.controls.remove(&session_id);

            if !ended_paused {
                // Terminal one way or another; free the active slot
                Self::promote_next(inner, &session_id).await;
            }
        });
    }

    /// Retire the session's queue slot and auto-promote the next waiter.
    async fn promote_next(inner: Arc<CoreInner>, finished_session: &str) {
        match inner.ctx.queue.complete(finished_session).await {
            Ok(Some(next_id)) => {
                // The promoted run emits its own queued -> running lifecycle
                Self::spawn_run(inner, next_id);
            }
            Ok(None) => {}
            Err(e) => warn!("queue completion failed for {finished_session}: {e:#}"),
        }
    }
}
