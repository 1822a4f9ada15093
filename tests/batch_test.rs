//! Batch manager invariants: size ceiling, one driver per batch, captcha
//! restarts, adaptive sizing.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use leadscrape::lookup::{BatchManager, LookupOutcome};
use leadscrape::{BATCH_SIZE_CEILING, BATCH_SIZE_FLOOR};
use tokio_util::sync::CancellationToken;

fn phones(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("011000{i:04}")).collect()
}

fn manager(site: &Arc<ScriptedSite>, initial: u8, captcha_detection: bool) -> BatchManager {
    BatchManager::new(
        ScriptedFactory::new(Arc::clone(site)),
        CARRIER_URL,
        initial,
        captcha_detection,
    )
}

#[tokio::test(start_paused = true)]
async fn chunk_size_never_exceeds_the_ceiling() {
    let site = ScriptedSite::new();
    let mut batch = manager(&site, 5, false);

    for p in phones(5) {
        site.serve_carrier(&p, "serviced by TELKOM/TELKOM");
    }

    // All-success batches try to grow the size; the ceiling holds
    for _ in 0..4 {
        assert!(batch.next_chunk_size() <= usize::from(BATCH_SIZE_CEILING));
        let chunk = phones(batch.next_chunk_size());
        let report = batch
            .run_batch(&chunk, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.outcomes.len() <= usize::from(BATCH_SIZE_CEILING));
    }
    assert_eq!(batch.current_size(), BATCH_SIZE_CEILING);
}

#[tokio::test(start_paused = true)]
async fn one_driver_per_clean_batch() {
    let site = ScriptedSite::new();
    let mut batch = manager(&site, 5, false);

    let chunk = phones(5);
    for p in &chunk {
        site.serve_carrier(p, "serviced by MTN/MTN");
    }

    let report = batch
        .run_batch(&chunk, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(site.drivers_opened.load(Ordering::SeqCst), 1);
    assert_eq!(site.drivers_closed.load(Ordering::SeqCst), 1);
    assert_eq!(report.outcomes.len(), 5);
    assert!(report
        .outcomes
        .iter()
        .all(|(_, o)| *o == LookupOutcome::Resolved("MTN".to_string())));
}

#[tokio::test(start_paused = true)]
async fn captcha_restart_resumes_remaining_items() {
    let site = ScriptedSite::new();
    let mut batch = manager(&site, 5, true);

    let chunk = phones(5);
    for p in &chunk {
        site.serve_carrier(p, "serviced by TELKOM/TELKOM");
    }
    // Third carrier navigation serves the challenge
    site.captcha_on_carrier_nav(3);

    let report = batch
        .run_batch(&chunk, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.restarts, 1);
    assert!(report.deferred.is_empty());
    assert_eq!(report.outcomes.len(), 5, "all items complete after restart");
    // Original driver plus the post-captcha replacement
    assert_eq!(site.drivers_opened.load(Ordering::SeqCst), 2);
    assert_eq!(site.drivers_closed.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn captcha_restarts_cap_at_three_then_defer() {
    let site = ScriptedSite::new();
    let mut batch = manager(&site, 5, true);

    let chunk = phones(5);
    // Every navigation challenges; restarts 1..=3 are consumed, the 4th
    // detection gives up
    for ordinal in 1..=10 {
        site.captcha_on_carrier_nav(ordinal);
    }

    let report = batch
        .run_batch(&chunk, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.restarts, 4);
    assert!(report.outcomes.is_empty());
    assert_eq!(report.deferred, chunk);
}

#[tokio::test(start_paused = true)]
async fn low_success_rate_shrinks_the_batch() {
    let site = ScriptedSite::new();
    let mut batch = manager(&site, 5, false);

    let chunk = phones(5);
    for p in &chunk[..2] {
        site.serve_carrier(p, "serviced by TELKOM/TELKOM");
    }
    for p in &chunk[2..] {
        site.break_lookup(p); // driver-level failures, 40% success
    }

    batch
        .run_batch(&chunk, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(batch.current_size(), 4);
}

#[tokio::test(start_paused = true)]
async fn size_never_shrinks_below_the_floor() {
    let site = ScriptedSite::new();
    let mut batch = manager(&site, 3, false);

    let chunk = phones(3);
    for p in &chunk {
        site.break_lookup(p);
    }

    for _ in 0..3 {
        batch
            .run_batch(&chunk, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.current_size(), BATCH_SIZE_FLOOR);
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_results_count_as_successful_lookups() {
    let site = ScriptedSite::new();
    let mut batch = manager(&site, 4, false);

    // No carrier text registered: pages parse to Unknown, which is a
    // completed lookup, not a failure
    let chunk = phones(4);
    let report = batch
        .run_batch(&chunk, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report
        .outcomes
        .iter()
        .all(|(_, o)| *o == LookupOutcome::Unknown));
    assert_eq!(batch.current_size(), 5, "full success grows the batch");
}

#[tokio::test(start_paused = true)]
async fn state_round_trips_through_checkpoint_snapshot() {
    let site = ScriptedSite::new();
    let batch = manager(&site, 4, false);

    let state = batch.state();
    let mut restored = manager(&site, 5, false);
    restored.restore(&state);
    assert_eq!(restored.current_size(), 4);
}
