//! leadscrape: scraper orchestration core.
//!
//! A resilient, concurrent pipeline that extracts business listings from a
//! map provider for configured (town × industry) jobs, enriches each
//! listing with a telecom-carrier lookup on a second site, and streams
//! results into a durable store. The headless browser is an injected
//! capability; see [`page_driver::PageDriver`].

pub mod api;
pub mod captcha;
pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod lookup;
pub mod navigation;
pub mod orchestrator;
pub mod page_driver;
pub mod phone;
pub mod provider_cache;
pub mod queue_manager;
pub mod retry_queue;
pub mod session;
pub mod store;
pub mod worker;

pub use api::{QueueStatusReply, ScraperCore, StartReply, RECOVERY_GRACE};
pub use config::{
    ConfigError, SessionConfig, SessionConfigBuilder, BATCH_SIZE_CEILING, BATCH_SIZE_FLOOR,
};
pub use error::{ScrapeError, ScrapeResult};
pub use events::{ErrorClass, EventBus, LogLevel, ScrapeEvent, SessionEvents};
pub use navigation::{NavigationManager, WaitStrategy};
pub use orchestrator::{CoreContext, Orchestrator, SessionControl};
pub use page_driver::{DriverError, PageDriver, PageDriverFactory};
pub use provider_cache::ProviderCache;
pub use queue_manager::{Admission, QueueManager, QueueStanding};
pub use retry_queue::{RetryDisposition, RetryItem, RetryKind, RetryQueue};
pub use session::{
    Assignment, BusinessRecord, Checkpoint, Session, SessionState, SessionStatus,
    SessionSummary, PROVIDER_UNKNOWN,
};
pub use store::{open_memory_pool, open_pool, MetricKind, MetricRecord, SessionStore};
pub use worker::{BrowserWorker, PairOutcome, ProgressTracker, WorkerContext};
