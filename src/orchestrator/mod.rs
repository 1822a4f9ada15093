//! Per-session orchestration: fan-out, checkpointing, retry drain,
//! lifecycle.
//!
//! The orchestrator loads a session, spawns a bounded pool of browser
//! workers over the flattened town×industry work list, drains the retry
//! queue once the primary list is empty, and drives the session state
//! machine to a terminal status. It is the single writer of session state;
//! workers communicate only through returned outcomes and shared counters.

mod control;

pub use control::SessionControl;

use dashmap::DashSet;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::events::{ErrorClass, EventBus, LogLevel, ScrapeEvent};
use crate::lookup::{BatchManager, CarrierLookupService, LookupOutcome};
use crate::page_driver::PageDriverFactory;
use crate::provider_cache::ProviderCache;
use crate::queue_manager::QueueManager;
use crate::retry_queue::{RetryItem, RetryKind, RetryQueue};
use crate::session::{
    Assignment, Checkpoint, Session, SessionStatus, SessionSummary, PROVIDER_UNKNOWN,
};
use crate::store::{MetricKind, MetricRecord, SessionStore};
use crate::worker::{BrowserWorker, PairOutcome, ProgressTracker, WorkerContext};

/// Checkpoints are written at least this often while running
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);
/// Poll period while waiting for retry items to come due
const RETRY_POLL: Duration = Duration::from_secs(2);

/// Everything the orchestrator (and API facade) share per process.
///
/// Explicit context object passed by reference; lifecycle is tied to
/// process start/stop.
pub struct CoreContext {
    pub store: SessionStore,
    pub retry_queue: RetryQueue,
    pub cache: Arc<ProviderCache>,
    pub queue: QueueManager,
    pub events: Arc<EventBus>,
    pub factory: Arc<dyn PageDriverFactory>,
}

/// Per-session coordinator
pub struct Orchestrator {
    ctx: Arc<CoreContext>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    /// Drive a session from its current state to pause or a terminal status.
    ///
    /// Returns the status the session ended this run in (`Paused` means a
    /// resume may follow; anything else is terminal).
    pub async fn run_session(
        &self,
        session_id: &str,
        control: Arc<SessionControl>,
    ) -> Result<SessionStatus> {
        let session = self
            .ctx
            .store
            .load_session(session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;

        let from = session.state.status;
        self.ctx.store.update_status(session_id, SessionStatus::Running).await?;
        self.ctx
            .events
            .emit(ScrapeEvent::lifecycle(session_id, from, SessionStatus::Running));

        let run = SessionRun::prepare(Arc::clone(&self.ctx), &session, control).await?;
        let outcome = run.drive().await;

        match &outcome {
            Ok(status) => info!("session {session_id} ended run in status {status}"),
            Err(e) => error!("session {session_id} failed: {e:#}"),
        }

        match outcome {
            Ok(status) => Ok(status),
            Err(e) => {
                // Unrecoverable orchestration failure; checkpoint is left in
                // place for a user-triggered resume
                let summary = SessionSummary::default();
                let _ = self
                    .ctx
                    .store
                    .finalize_session(session_id, SessionStatus::Error, &summary)
                    .await;
                self.ctx.events.emit(ScrapeEvent::lifecycle(
                    session_id,
                    SessionStatus::Running,
                    SessionStatus::Error,
                ));
                Err(e)
            }
        }
    }
}

/// State for one run of one session
struct SessionRun {
    ctx: Arc<CoreContext>,
    session_id: String,
    control: Arc<SessionControl>,
    worker_ctx: Arc<WorkerContext>,
    lookup: Arc<CarrierLookupService>,
    work_list: Vec<Assignment>,
    /// Pairs finished (or handed to the retry queue) this run or before
    completed: Vec<bool>,
    /// Incomplete pairs per town, for boundary detection
    town_remaining: HashMap<String, usize>,
    pool_size: usize,
    started: Instant,
    error_count: u64,
    memory_soft_cap_mb: u64,
}

impl SessionRun {
    async fn prepare(
        ctx: Arc<CoreContext>,
        session: &Session,
        control: Arc<SessionControl>,
    ) -> Result<Self> {
        let session_id = session.id.clone();
        let config = session.config.clone();
        let work_list = config.work_list();

        // Resume point: the first pair the last checkpoint had not finished
        let checkpoint = ctx.store.load_checkpoint(&session_id).await?;
        let resume_index = checkpoint
            .as_ref()
            .and_then(|cp| {
                let town = cp.current_town.as_deref()?;
                let industry = cp.current_industry.as_deref()?;
                work_list
                    .iter()
                    .position(|a| a.town == town && a.industry == industry)
            })
            .unwrap_or(0);
        let processed_before = checkpoint
            .as_ref()
            .map_or(0, |cp| cp.processed_businesses);

        let mut completed = vec![false; work_list.len()];
        for flag in completed.iter_mut().take(resume_index) {
            *flag = true;
        }

        let mut town_remaining: HashMap<String, usize> = HashMap::new();
        for (i, pair) in work_list.iter().enumerate() {
            if !completed[i] {
                *town_remaining.entry(pair.town.clone()).or_insert(0) += 1;
            }
        }

        // Seed the session dedup set from what previous runs persisted
        let dedup: Arc<DashSet<String>> = Arc::new(DashSet::new());
        for key in ctx.store.dedup_keys(&session_id).await? {
            dedup.insert(key);
        }

        let batch = BatchManager::new(
            Arc::clone(&ctx.factory),
            config.carrier_site_url(),
            config.batch_size(),
            config.enable_captcha_detection(),
        );
        let lookup = Arc::new(CarrierLookupService::new(
            Arc::clone(&ctx.cache),
            ctx.retry_queue.clone(),
            Arc::clone(&ctx.events),
            batch,
        ));
        if let Some(state) = checkpoint.as_ref().and_then(|cp| cp.batch_state.as_ref()) {
            lookup.restore_batch_state(state).await;
        }

        let progress = Arc::new(ProgressTracker::new(
            work_list.len(),
            processed_before,
            resume_index,
        ));

        let pool_size = config.pool_size();
        let memory_soft_cap_mb = config.worker_memory_soft_cap_mb();

        let worker_ctx = Arc::new(WorkerContext {
            session_id: session_id.clone(),
            config,
            store: ctx.store.clone(),
            retry_queue: ctx.retry_queue.clone(),
            events: Arc::clone(&ctx.events),
            lookup: Arc::clone(&lookup),
            factory: Arc::clone(&ctx.factory),
            dedup,
            progress,
        });

        // Checkpoint exists from this point on, current at session start
        let run = Self {
            ctx,
            session_id,
            control,
            worker_ctx,
            lookup,
            work_list,
            completed,
            town_remaining,
            pool_size,
            started: Instant::now(),
            error_count: 0,
            memory_soft_cap_mb,
        };
        run.write_checkpoint().await?;
        Ok(run)
    }

    /// Main supervisor: fill the pool, absorb outcomes, checkpoint on a
    /// cadence, then drain retries and finalize.
    async fn drive(mut self) -> Result<SessionStatus> {
        let mut active: FuturesUnordered<tokio::task::JoinHandle<(usize, PairOutcome)>> =
            FuturesUnordered::new();
        let mut next_index = self.first_incomplete().unwrap_or(self.work_list.len());
        let mut last_checkpoint = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut worker_seq = 0usize;

        loop {
            let halted = self.control.is_cancelled() || self.control.pause_requested();

            while !halted && active.len() < self.pool_size && next_index < self.work_list.len() {
                let assignment = self.work_list[next_index].clone();
                let worker = BrowserWorker::new(worker_seq, Arc::clone(&self.worker_ctx));
                worker_seq += 1;
                let cancel = self.control.cancel_token();
                let index = next_index;
                active.push(tokio::spawn(async move {
                    (index, worker.process(assignment, cancel).await)
                }));
                next_index += 1;
            }

            if active.is_empty() {
                if halted || next_index >= self.work_list.len() {
                    break;
                }
            }

            tokio::select! {
                Some(joined) = active.next(), if !active.is_empty() => {
                    match joined {
                        Ok((index, outcome)) => self.absorb(index, outcome).await?,
                        Err(e) => {
                            // A panicked worker is a crashed worker; its pair
                            // is recovered through the retry queue
                            error!("worker task panicked: {e}");
                            self.error_count += 1;
                        }
                    }
                }
                _ = tick.tick() => {}
            }

            if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                self.write_checkpoint().await?;
                last_checkpoint = Instant::now();
            }
        }

        if self.control.is_cancelled() {
            return self.finish(SessionStatus::Stopped).await;
        }
        if self.control.pause_requested() {
            self.write_checkpoint().await?;
            self.ctx
                .store
                .update_status(&self.session_id, SessionStatus::Paused)
                .await?;
            self.ctx.events.emit(ScrapeEvent::lifecycle(
                &self.session_id,
                SessionStatus::Running,
                SessionStatus::Paused,
            ));
            return Ok(SessionStatus::Paused);
        }

        self.drain_retries().await?;

        if self.control.is_cancelled() {
            return self.finish(SessionStatus::Stopped).await;
        }
        if self.control.pause_requested() {
            self.write_checkpoint().await?;
            self.ctx
                .store
                .update_status(&self.session_id, SessionStatus::Paused)
                .await?;
            self.ctx.events.emit(ScrapeEvent::lifecycle(
                &self.session_id,
                SessionStatus::Running,
                SessionStatus::Paused,
            ));
            return Ok(SessionStatus::Paused);
        }

        // Exhausted lookups degrade to "Unknown" providers; exhausted
        // navigation/extraction items are work the session never covered
        let uncovered = self
            .ctx
            .retry_queue
            .exhausted_work_count(&self.session_id)
            .await?;
        if uncovered > 0 {
            warn!(
                "session {} has {uncovered} exhausted work item(s)",
                self.session_id
            );
            return self.finish(SessionStatus::Error).await;
        }

        self.finish(SessionStatus::Completed).await
    }

    /// Fold one worker outcome into run state
    async fn absorb(&mut self, index: usize, outcome: PairOutcome) -> Result<()> {
        match outcome {
            PairOutcome::Completed {
                assignment,
                new_records,
                memory_mb,
            } => {
                debug!("{assignment} completed with {new_records} new records");
                self.mark_pair_done(index, &assignment).await?;
                if self.memory_soft_cap_mb > 0 && memory_mb > self.memory_soft_cap_mb {
                    // Drivers are already released per assignment; flag the
                    // pressure so operators see it
                    self.ctx.events.emit(ScrapeEvent::log(
                        &self.session_id,
                        LogLevel::Warn,
                        format!(
                            "memory {memory_mb} MiB above soft cap {} MiB; worker recycled",
                            self.memory_soft_cap_mb
                        ),
                    ));
                }
            }
            PairOutcome::Failed {
                assignment,
                message,
                ..
            } => {
                debug!("{assignment} failed this run: {message}");
                self.error_count += 1;
                // The worker already requeued it; the primary list moves on
                self.mark_pair_done(index, &assignment).await?;
            }
            PairOutcome::Cancelled { assignment } => {
                debug!("{assignment} cancelled mid-flight");
            }
        }
        Ok(())
    }

    /// Mark a pair finished and run the town-completion boundary when its
    /// town has no pairs left.
    async fn mark_pair_done(&mut self, index: usize, assignment: &Assignment) -> Result<()> {
        if self.completed[index] {
            return Ok(());
        }
        self.completed[index] = true;
        self.worker_ctx.progress.record_pair_done();

        let town_done = {
            let remaining = self
                .town_remaining
                .get_mut(&assignment.town)
                .map(|n| {
                    *n = n.saturating_sub(1);
                    *n
                })
                .unwrap_or(0);
            remaining == 0
        };

        if town_done {
            // Status and checkpoint move together at town boundaries
            let checkpoint = self.build_checkpoint().await;
            self.ctx
                .store
                .checkpoint_with_progress(
                    &checkpoint,
                    SessionStatus::Running,
                    self.worker_ctx.progress.percent(),
                )
                .await?;
            self.ctx.events.emit(ScrapeEvent::progress(
                &self.session_id,
                self.worker_ctx.progress.percent(),
                checkpoint.current_town.clone(),
                checkpoint.current_industry.clone(),
                self.worker_ctx.progress.processed_businesses(),
            ));
            info!("town {} completed for session {}", assignment.town, self.session_id);
        }
        Ok(())
    }

    /// Re-dispatch due retry items until the queue is empty or only
    /// exhausted items remain.
    async fn drain_retries(&mut self) -> Result<()> {
        loop {
            if self.control.is_cancelled() || self.control.pause_requested() {
                return Ok(());
            }

            let due = self
                .ctx
                .retry_queue
                .due_items(&self.session_id, Utc::now())
                .await?;

            if due.is_empty() {
                if self.ctx.retry_queue.pending_count(&self.session_id).await? == 0 {
                    return Ok(());
                }
                tokio::select! {
                    () = tokio::time::sleep(RETRY_POLL) => continue,
                    () = self.control.cancelled() => return Ok(()),
                }
            }

            for item in due {
                if self.control.is_cancelled() {
                    return Ok(());
                }
                self.dispatch_retry(item).await?;
            }
            self.write_checkpoint().await?;
        }
    }

    /// Route one retry item to the machinery matching its kind
    async fn dispatch_retry(&mut self, item: RetryItem) -> Result<()> {
        debug!(
            "retrying {} item {} (attempt {})",
            item.kind.as_str(),
            item.id,
            item.attempts + 1
        );
        match item.kind {
            RetryKind::Navigation | RetryKind::Extraction => {
                let town = item.payload.get("town").and_then(|v| v.as_str());
                let industry = item.payload.get("industry").and_then(|v| v.as_str());
                let (Some(town), Some(industry)) = (town, industry) else {
                    warn!("malformed retry payload on item {}, dropping", item.id);
                    return self.ctx.retry_queue.mark_succeeded(item.id).await;
                };
                let assignment = Assignment::new(town, industry);
                let worker = BrowserWorker::new(usize::MAX, Arc::clone(&self.worker_ctx));
                let outcome = worker
                    .process_for_retry(assignment.clone(), self.control.cancel_token())
                    .await;
                let success = matches!(outcome, PairOutcome::Completed { .. });
                self.record_nav_metric(&assignment, success).await;
                if success {
                    self.ctx.retry_queue.mark_succeeded(item.id).await?;
                } else if !matches!(outcome, PairOutcome::Cancelled { .. }) {
                    self.ctx.retry_queue.mark_failed(item.id).await?;
                }
            }
            RetryKind::Lookup => {
                let Some(phone) = item.payload.get("phone").and_then(|v| v.as_str()) else {
                    warn!("malformed lookup retry payload on item {}, dropping", item.id);
                    return self.ctx.retry_queue.mark_succeeded(item.id).await;
                };
                match self
                    .lookup
                    .lookup_single(&self.session_id, phone, &self.control.cancel_token())
                    .await
                {
                    LookupOutcome::Resolved(carrier) => {
                        self.ctx
                            .store
                            .update_business_provider(&self.session_id, phone, &carrier)
                            .await?;
                        self.ctx.retry_queue.mark_succeeded(item.id).await?;
                    }
                    LookupOutcome::Unknown => {
                        // Resolved as far as the site is concerned; the
                        // short cache TTL gives it another chance later
                        self.ctx
                            .store
                            .update_business_provider(&self.session_id, phone, PROVIDER_UNKNOWN)
                            .await?;
                        self.ctx.retry_queue.mark_succeeded(item.id).await?;
                    }
                    LookupOutcome::Captcha | LookupOutcome::Transient(_) => {
                        self.ctx.retry_queue.mark_failed(item.id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_nav_metric(&self, assignment: &Assignment, success: bool) {
        let metric = MetricRecord::new(
            &self.session_id,
            MetricKind::Navigation,
            assignment.to_string(),
            1.0,
            success,
        );
        if let Err(e) = self.ctx.store.record_metric(&metric).await {
            debug!("metric write failed: {e:#}");
        }
    }

    fn first_incomplete(&self) -> Option<usize> {
        self.completed.iter().position(|done| !done)
    }

    async fn build_checkpoint(&self) -> Checkpoint {
        let current = self.first_incomplete().map(|i| &self.work_list[i]);
        let retry_snapshot = self
            .ctx
            .retry_queue
            .snapshot(&self.session_id)
            .await
            .ok();
        Checkpoint {
            session_id: self.session_id.clone(),
            current_town: current.map(|a| a.town.clone()),
            current_industry: current.map(|a| a.industry.clone()),
            processed_businesses: self.worker_ctx.progress.processed_businesses(),
            retry_snapshot,
            batch_state: Some(self.lookup.batch_state().await),
            updated_at: Utc::now(),
        }
    }

    async fn write_checkpoint(&self) -> Result<()> {
        let checkpoint = self.build_checkpoint().await;
        self.ctx.store.write_checkpoint(&checkpoint).await
    }

    /// Write the terminal status, summary, and lifecycle event
    async fn finish(&self, status: SessionStatus) -> Result<SessionStatus> {
        if status != SessionStatus::Completed {
            // Preserve the resume point for stopped/errored sessions
            self.write_checkpoint().await?;
        }

        let summary = self.build_summary().await?;
        self.ctx
            .store
            .finalize_session(&self.session_id, status, &summary)
            .await?;
        self.ctx.events.emit(ScrapeEvent::lifecycle(
            &self.session_id,
            SessionStatus::Running,
            status,
        ));
        if status == SessionStatus::Error {
            self.ctx.events.emit(ScrapeEvent::error(
                &self.session_id,
                ErrorClass::Worker,
                "session ended with uncovered work after retry exhaustion",
                false,
            ));
        }
        Ok(status)
    }

    async fn build_summary(&self) -> Result<SessionSummary> {
        let total_businesses = self.ctx.store.count_businesses(&self.session_id).await?;

        let mut towns_done: HashMap<&str, bool> = HashMap::new();
        let mut industries_done: HashMap<&str, bool> = HashMap::new();
        for (i, pair) in self.work_list.iter().enumerate() {
            *towns_done.entry(pair.town.as_str()).or_insert(true) &= self.completed[i];
            *industries_done.entry(pair.industry.as_str()).or_insert(true) &= self.completed[i];
        }

        Ok(SessionSummary {
            total_businesses,
            total_towns_completed: towns_done.values().filter(|done| **done).count() as u64,
            total_industries_completed: industries_done.values().filter(|d| **d).count() as u64,
            error_count: self.error_count,
            duration_ms: self.started.elapsed().as_millis() as u64,
        })
    }
}
