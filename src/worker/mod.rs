//! Browser worker: processes one (town, industry) assignment end-to-end.
//!
//! A worker owns exactly one Page Driver for listing extraction; lookup
//! drivers are minted per-batch by the batch manager and never shared.
//! Workers hold no reference back to the orchestrator — results travel
//! through the returned outcome and the event bus.

use dashmap::DashSet;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::events::{ErrorClass, EventBus, ScrapeEvent};
use crate::extractor::{ExtractionCause, ListingExtractor};
use crate::lookup::CarrierLookupService;
use crate::navigation::NavigationManager;
use crate::page_driver::{DriverError, PageDriverFactory};
use crate::retry_queue::{RetryKind, RetryQueue};
use crate::session::{Assignment, BusinessRecord, PROVIDER_UNKNOWN};
use crate::store::{MetricKind, MetricRecord, SessionStore};

/// Shared session-scoped state a worker operates against
pub struct WorkerContext {
    pub session_id: String,
    pub config: SessionConfig,
    pub store: SessionStore,
    pub retry_queue: RetryQueue,
    pub events: Arc<EventBus>,
    pub lookup: Arc<CarrierLookupService>,
    pub factory: Arc<dyn PageDriverFactory>,
    /// Session-global dedup set; workers are the only writers
    pub dedup: Arc<DashSet<String>>,
    pub progress: Arc<ProgressTracker>,
}

/// Session progress shared between workers and the orchestrator.
///
/// Percent is completed pairs over total pairs; it only moves forward
/// within a run.
#[derive(Debug)]
pub struct ProgressTracker {
    total_pairs: usize,
    completed_pairs: AtomicUsize,
    processed_businesses: AtomicU64,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(total_pairs: usize, already_processed: u64, already_completed: usize) -> Self {
        Self {
            total_pairs: total_pairs.max(1),
            completed_pairs: AtomicUsize::new(already_completed),
            processed_businesses: AtomicU64::new(already_processed),
        }
    }

    pub fn record_business(&self) -> u64 {
        self.processed_businesses.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_pair_done(&self) -> usize {
        self.completed_pairs.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[must_use]
    pub fn processed_businesses(&self) -> u64 {
        self.processed_businesses.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn completed_pairs(&self) -> usize {
        self.completed_pairs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn percent(&self) -> f64 {
        let done = self.completed_pairs.load(Ordering::SeqCst) as f64;
        (done / self.total_pairs as f64 * 100.0).min(100.0)
    }
}

/// What became of one assignment
#[derive(Debug)]
pub enum PairOutcome {
    /// Extraction and enrichment finished
    Completed {
        assignment: Assignment,
        new_records: u64,
        memory_mb: u64,
    },
    /// Failed after preserving partials; already requeued appropriately
    Failed {
        assignment: Assignment,
        message: String,
        partial_records: u64,
    },
    /// Cancellation stopped the pair after a bounded finish
    Cancelled { assignment: Assignment },
}

/// One worker slot in the orchestrator's pool
pub struct BrowserWorker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl BrowserWorker {
    #[must_use]
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    /// Process a single assignment end-to-end.
    pub async fn process(&self, assignment: Assignment, cancel: CancellationToken) -> PairOutcome {
        self.run(assignment, cancel, true).await
    }

    /// Retry-drain variant: the item already lives in the retry queue, so a
    /// failure here must not enqueue a second copy.
    pub async fn process_for_retry(
        &self,
        assignment: Assignment,
        cancel: CancellationToken,
    ) -> PairOutcome {
        self.run(assignment, cancel, false).await
    }

    async fn run(
        &self,
        assignment: Assignment,
        cancel: CancellationToken,
        requeue_on_failure: bool,
    ) -> PairOutcome {
        let ctx = &self.ctx;
        debug!("worker {} starting {assignment}", self.id);

        let driver = match ctx.factory.open().await {
            Ok(driver) => driver,
            Err(e) => {
                warn!("worker {} could not open driver: {e}", self.id);
                if requeue_on_failure {
                    self.requeue_navigation(&assignment).await;
                }
                ctx.events.emit(ScrapeEvent::error(
                    &ctx.session_id,
                    ErrorClass::Worker,
                    format!("driver open failed for {assignment}: {e}"),
                    true,
                ));
                return PairOutcome::Failed {
                    assignment,
                    message: e.to_string(),
                    partial_records: 0,
                };
            }
        };

        let mut nav = NavigationManager::new(
            ctx.config.navigation_base_delay(),
            ctx.config.navigation_max_retries(),
        )
        .with_events(Arc::clone(&ctx.events), &ctx.session_id);
        let extractor = ListingExtractor::new(
            ctx.config.map_search_base(),
            ctx.config.listing_cap_per_pair(),
        );

        let extraction = extractor
            .extract(driver.as_ref(), &mut nav, &assignment, &ctx.dedup, &cancel)
            .await;

        let (records, was_cancelled) = match extraction {
            Ok(harvest) => {
                self.record_metric(
                    MetricKind::Extraction,
                    &assignment.to_string(),
                    harvest.records.len() as f64,
                    true,
                )
                .await;
                (harvest.records, harvest.cancelled)
            }
            Err(failure) => {
                let partial = failure.partial.len() as u64;
                ctx.events.emit(ScrapeEvent::error(
                    &ctx.session_id,
                    ErrorClass::Extraction,
                    failure.to_string(),
                    true,
                ));
                self.record_metric(
                    MetricKind::Extraction,
                    &assignment.to_string(),
                    partial as f64,
                    false,
                )
                .await;

                if requeue_on_failure {
                    match &failure.cause {
                        ExtractionCause::Navigation(_)
                        | ExtractionCause::Driver(DriverError::Crashed(_)) => {
                            // Nothing (or a dead browser) to resume from; the
                            // whole pair goes back through navigation
                            self.requeue_navigation(&assignment).await;
                        }
                        ExtractionCause::Driver(_) => {
                            self.requeue_extraction(&assignment, &failure.partial).await;
                        }
                    }
                }

                if failure.partial.is_empty() {
                    let _ = driver.close().await;
                    return PairOutcome::Failed {
                        assignment,
                        message: failure.to_string(),
                        partial_records: 0,
                    };
                }
                // Partials are still enriched and emitted
                (failure.partial, false)
            }
        };

        let _ = driver.close().await;

        let enriched = self.enrich(&records, &cancel).await;
        let mut new_records = 0u64;
        for record in enriched {
            match ctx.store.insert_business(&ctx.session_id, &record).await {
                Ok(true) => {
                    new_records += 1;
                    let processed = ctx.progress.record_business();
                    ctx.events
                        .emit(ScrapeEvent::business(&ctx.session_id, record.clone()));
                    ctx.events.emit(ScrapeEvent::progress(
                        &ctx.session_id,
                        ctx.progress.percent(),
                        Some(assignment.town.clone()),
                        Some(assignment.industry.clone()),
                        processed,
                    ));
                }
                Ok(false) => debug!("duplicate business discarded: {}", record.name),
                Err(e) => {
                    warn!("failed to persist business {}: {e:#}", record.name);
                    ctx.events.emit(ScrapeEvent::error(
                        &ctx.session_id,
                        ErrorClass::Store,
                        format!("persist failed: {e:#}"),
                        false,
                    ));
                }
            }
        }

        if was_cancelled || cancel.is_cancelled() {
            return PairOutcome::Cancelled { assignment };
        }

        let memory_mb = memory_usage_mb();
        self.record_metric(MetricKind::Memory, "worker_rss", memory_mb as f64, true)
            .await;

        PairOutcome::Completed {
            assignment,
            new_records,
            memory_mb,
        }
    }

    /// Resolve carriers for every record with a phone
    async fn enrich(
        &self,
        records: &[BusinessRecord],
        cancel: &CancellationToken,
    ) -> Vec<BusinessRecord> {
        let phones: Vec<String> = records
            .iter()
            .filter_map(|r| r.phone.clone())
            .collect();

        let carriers = if phones.is_empty() || cancel.is_cancelled() {
            Default::default()
        } else {
            let resolved = self
                .ctx
                .lookup
                .lookup_all(&self.ctx.session_id, &phones, cancel)
                .await;
            self.record_metric(
                MetricKind::Lookup,
                "carrier_lookups",
                phones.len() as f64,
                true,
            )
            .await;
            resolved
        };

        records
            .iter()
            .cloned()
            .map(|mut record| {
                record.provider = record
                    .phone
                    .as_ref()
                    .and_then(|p| carriers.get(p).cloned())
                    .unwrap_or_else(|| PROVIDER_UNKNOWN.to_string());
                record
            })
            .collect()
    }

    async fn requeue_navigation(&self, assignment: &Assignment) {
        let payload = serde_json::json!({
            "town": assignment.town,
            "industry": assignment.industry,
        });
        if let Err(e) = self
            .ctx
            .retry_queue
            .enqueue(&self.ctx.session_id, RetryKind::Navigation, payload)
            .await
        {
            warn!("failed to enqueue navigation retry for {assignment}: {e:#}");
        }
    }

    async fn requeue_extraction(&self, assignment: &Assignment, harvested: &[BusinessRecord]) {
        let keys: Vec<String> = harvested.iter().map(BusinessRecord::dedup_key).collect();
        let payload = serde_json::json!({
            "town": assignment.town,
            "industry": assignment.industry,
            "harvested": keys,
        });
        if let Err(e) = self
            .ctx
            .retry_queue
            .enqueue(&self.ctx.session_id, RetryKind::Extraction, payload)
            .await
        {
            warn!("failed to enqueue extraction retry for {assignment}: {e:#}");
        }
    }

    async fn record_metric(&self, kind: MetricKind, name: &str, value: f64, success: bool) {
        let metric = MetricRecord::new(&self.ctx.session_id, kind, name, value, success);
        if let Err(e) = self.ctx.store.record_metric(&metric).await {
            debug!("metric write failed: {e:#}");
        }
    }
}

/// Resident set size of this process in MiB; 0 when unavailable.
///
/// Per-worker accounting is not portable, so the soft cap is applied to the
/// process RSS observed at town-completion boundaries.
#[must_use]
pub fn memory_usage_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u64>().ok())
            {
                return rss_pages * 4096 / (1024 * 1024);
            }
        }
    }
    0
}
