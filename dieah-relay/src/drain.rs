//! Background delivery of pending captures and retention cleanup

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::breaker::CircuitBreaker;
use crate::cache::ContextCache;
use crate::capture::{CaptureRecord, CaptureStatus, RetryOutcome};
use crate::config::Config;
use crate::error::{CallError, RemoteError, Result};
use crate::remote::RemoteClient;
use crate::storage::OutboxStore;

/// Drain tuning
#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub max_per_cycle: usize,
    pub max_retries: u32,
    pub delay_between: Duration,
    pub interval: Duration,
    pub cleanup_interval: Duration,
    pub sent_retention: chrono::Duration,
    pub failed_retention: chrono::Duration,
    pub sending_grace: chrono::Duration,
}

impl From<&Config> for DrainConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_per_cycle: config.max_per_cycle,
            max_retries: config.max_retries,
            delay_between: config.delay_between(),
            interval: config.processor_interval(),
            cleanup_interval: config.cleanup_interval(),
            sent_retention: config.sent_retention(),
            failed_retention: config.failed_retention(),
            sending_grace: config.sending_grace(),
        }
    }
}

/// What one drain cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub sent: usize,
    /// Genuine failures sent back to pending
    pub retried: usize,
    /// Captures that ran out of retries this cycle
    pub failed: usize,
    /// Captures returned to pending because the breaker was open
    pub requeued: usize,
    pub short_circuited: bool,
}

/// What one cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sent_purged: usize,
    pub failed_purged: usize,
    pub cache_purged: usize,
    /// Stuck `sending` captures put back in the queue
    pub reconciled: usize,
}

/// Outcome of delivering a single claimed capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Retried,
    Failed,
    Requeued,
}

/// Send one claimed capture through the breaker and record the result.
///
/// Shared by the drain cycle and the opportunistic send after a capture.
pub async fn deliver(
    store: &OutboxStore,
    breaker: &CircuitBreaker,
    client: &RemoteClient,
    record: &CaptureRecord,
    max_retries: u32,
) -> Result<Delivery> {
    debug_assert_eq!(record.status, CaptureStatus::Sending);
    let submission = record.submission();
    let submission = &submission;

    let outcome = breaker
        .execute(|| async move { client.submit_capture(submission).await })
        .await;

    match outcome {
        Ok(()) => {
            store.mark_sent(record.id, Utc::now())?;
            tracing::debug!(capture_id = %record.id, "Capture delivered");
            Ok(Delivery::Sent)
        }
        Err(CallError::ShortCircuited) => {
            store.requeue(record.id, Utc::now())?;
            Ok(Delivery::Requeued)
        }
        Err(CallError::Remote(err)) => {
            match &err {
                RemoteError::Transient(detail) => tracing::warn!(
                    capture_id = %record.id,
                    retry_count = record.retry_count,
                    error = %detail,
                    "Memory worker unavailable, will retry capture"
                ),
                RemoteError::Permanent(detail) => tracing::warn!(
                    capture_id = %record.id,
                    retry_count = record.retry_count,
                    error = %detail,
                    "Memory worker rejected capture payload"
                ),
            }

            match store.mark_retry(record.id, &err.to_string(), max_retries, Utc::now())? {
                RetryOutcome::Requeued { .. } => Ok(Delivery::Retried),
                RetryOutcome::Failed { retry_count } => {
                    tracing::error!(
                        capture_id = %record.id,
                        retry_count,
                        error = %err,
                        "Capture failed permanently"
                    );
                    Ok(Delivery::Failed)
                }
            }
        }
    }
}

/// Periodic processor that moves pending captures to the memory worker
pub struct DrainProcessor {
    store: Arc<OutboxStore>,
    breaker: Arc<CircuitBreaker>,
    client: RemoteClient,
    cache: ContextCache,
    config: DrainConfig,
    run_lock: Mutex<()>,
}

impl DrainProcessor {
    pub fn new(
        store: Arc<OutboxStore>,
        breaker: Arc<CircuitBreaker>,
        client: RemoteClient,
        cache: ContextCache,
        config: DrainConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            client,
            cache,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Run one drain cycle. Returns `None` if a previous cycle is still running.
    pub async fn run_cycle(&self) -> Result<Option<DrainReport>> {
        let Ok(_running) = self.run_lock.try_lock() else {
            tracing::debug!("Drain cycle still running, skipping trigger");
            return Ok(None);
        };

        let claimed = self
            .store
            .claim_next_pending(self.config.max_per_cycle, Utc::now())?;
        let mut report = DrainReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(Some(report));
        }

        let mut remaining = claimed.iter();
        let mut first = true;
        while let Some(record) = remaining.next() {
            if !first {
                tokio::time::sleep(self.config.delay_between).await;
            }
            first = false;

            let delivered = deliver(
                &self.store,
                &self.breaker,
                &self.client,
                record,
                self.config.max_retries,
            )
            .await;

            match delivered {
                Ok(Delivery::Sent) => report.sent += 1,
                Ok(Delivery::Retried) => report.retried += 1,
                Ok(Delivery::Failed) => report.failed += 1,
                Ok(Delivery::Requeued) => {
                    report.requeued += 1;
                    report.short_circuited = true;
                    // No point continuing while the breaker is open
                    report.requeued += self.release(remaining.by_ref());
                }
                Err(e) => {
                    tracing::error!(capture_id = %record.id, error = %e, "Could not record delivery outcome");
                    // Nothing claimed by this cycle may stay in `sending`
                    self.release(std::iter::once(record).chain(remaining.by_ref()));
                    return Err(e);
                }
            }
        }

        tracing::info!(
            claimed = report.claimed,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            requeued = report.requeued,
            "Drain cycle finished"
        );
        Ok(Some(report))
    }

    /// Put claimed captures back to `pending`, returning how many moved
    fn release<'a>(&self, records: impl Iterator<Item = &'a CaptureRecord>) -> usize {
        let mut released = 0;
        for record in records {
            match self.store.requeue(record.id, Utc::now()) {
                Ok(()) => released += 1,
                Err(e) => tracing::warn!(capture_id = %record.id, error = %e, "Could not requeue capture"),
            }
        }
        released
    }

    /// Purge finished captures past retention and expired cache entries
    pub fn run_cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let report = CleanupReport {
            sent_purged: self
                .store
                .purge(now - self.config.sent_retention, &[CaptureStatus::Sent])?,
            failed_purged: self
                .store
                .purge(now - self.config.failed_retention, &[CaptureStatus::Failed])?,
            cache_purged: self.cache.purge_expired(now)?,
            reconciled: self.store.reconcile_stuck(self.config.sending_grace, now)?,
        };

        tracing::info!(
            sent = report.sent_purged,
            failed = report.failed_purged,
            cache = report.cache_purged,
            reconciled = report.reconciled,
            "Retention cleanup finished"
        );
        Ok(report)
    }

    /// Run drain cycles every `interval` until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            tracing::error!(error = %e, "Drain cycle failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        // Sender gone counts as shutdown
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Drain processor stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Run retention cleanup every `cleanup_interval` until shutdown
    pub fn spawn_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cleanup(Utc::now()) {
                            tracing::error!(error = %e, "Retention cleanup failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSubmission, NewCapture};
    use crate::remote::MemoryWorker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Scripted {
        down: AtomicBool,
        reject: AtomicBool,
        submits: AtomicUsize,
    }

    #[async_trait]
    impl MemoryWorker for Scripted {
        async fn submit_capture(&self, _: &CaptureSubmission) -> std::result::Result<(), RemoteError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(RemoteError::transient("connection refused"))
            } else if self.reject.load(Ordering::SeqCst) {
                Err(RemoteError::permanent("400 Bad Request"))
            } else {
                Ok(())
            }
        }

        async fn query_context(&self, _: &str) -> std::result::Result<String, RemoteError> {
            Ok(String::new())
        }

        async fn health_check(&self) -> std::result::Result<(), RemoteError> {
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<OutboxStore>,
        breaker: Arc<CircuitBreaker>,
        worker: Arc<Scripted>,
        processor: Arc<DrainProcessor>,
    }

    fn harness(config: Config) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OutboxStore::open(dir.path().join("outbox.db")).unwrap());
        let worker = Arc::new(Scripted::default());
        let breaker = Arc::new(CircuitBreaker::new((&config).into()));
        let client = RemoteClient::new(worker.clone(), config.request_timeout());
        let cache = ContextCache::new(store.clone(), config.cache_max_entries, config.cache_ttl());
        let processor = Arc::new(DrainProcessor::new(
            store.clone(),
            breaker.clone(),
            client,
            cache,
            (&config).into(),
        ));
        Harness {
            _dir: dir,
            store,
            breaker,
            worker,
            processor,
        }
    }

    fn append(store: &OutboxStore, n: usize) -> uuid::Uuid {
        store
            .append(
                &NewCapture::new("s", format!("message {}", n), "reply", "chat"),
                Utc::now() + chrono::Duration::milliseconds(n as i64),
            )
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_sends_batch_with_pacing() {
        let h = harness(Config::with_data_dir("unused"));
        for n in 0..3 {
            append(&h.store, n);
        }

        let started = tokio::time::Instant::now();
        let report = h.processor.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.sent, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
        assert_eq!(h.store.queue_depth().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_claims_at_most_max_per_cycle() {
        let h = harness(Config {
            max_per_cycle: 2,
            delay_between_ms: 0,
            ..Config::with_data_dir("unused")
        });
        for n in 0..5 {
            append(&h.store, n);
        }

        let report = h.processor.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(h.store.queue_depth().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tripping_breaker_requeues_rest_without_penalty() {
        let h = harness(Config {
            delay_between_ms: 0,
            ..Config::with_data_dir("unused")
        });
        let ids: Vec<_> = (0..8).map(|n| append(&h.store, n)).collect();
        h.worker.down.store(true, Ordering::SeqCst);

        let report = h.processor.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.claimed, 8);
        assert_eq!(report.retried, 5);
        assert!(report.short_circuited);
        assert_eq!(report.requeued, 3);
        assert_eq!(h.worker.submits.load(Ordering::SeqCst), 5);

        for id in &ids[..5] {
            assert_eq!(h.store.get(*id).unwrap().unwrap().retry_count, 1);
        }
        for id in &ids[5..] {
            let record = h.store.get(*id).unwrap().unwrap();
            assert_eq!(record.status, CaptureStatus::Pending);
            assert_eq!(record.retry_count, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_leaves_queue_untouched() {
        let h = harness(Config::with_data_dir("unused"));
        h.worker.down.store(true, Ordering::SeqCst);
        for _ in 0..5 {
            let _ = h
                .breaker
                .execute(|| async { Err::<(), _>(RemoteError::transient("down")) })
                .await;
        }
        let id = append(&h.store, 0);

        let report = h.processor.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(h.worker.submits.load(Ordering::SeqCst), 0);

        let record = h.store.get(id).unwrap().unwrap();
        assert_eq!(record.status, CaptureStatus::Pending);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_capture_fails_after_retry_cap() {
        let h = harness(Config {
            delay_between_ms: 0,
            ..Config::with_data_dir("unused")
        });
        h.worker.reject.store(true, Ordering::SeqCst);
        let id = append(&h.store, 0);

        for _ in 0..5 {
            h.processor.run_cycle().await.unwrap().unwrap();
        }

        let record = h.store.get(id).unwrap().unwrap();
        assert_eq!(record.status, CaptureStatus::Failed);
        assert_eq!(record.retry_count, 5);

        let report = h.processor.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(h.worker.submits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycle_is_skipped() {
        let h = harness(Config::with_data_dir("unused"));
        for n in 0..2 {
            append(&h.store, n);
        }

        let first = {
            let processor = h.processor.clone();
            tokio::spawn(async move { processor.run_cycle().await })
        };
        // let the first cycle reach its pacing sleep
        tokio::task::yield_now().await;

        assert_eq!(h.processor.run_cycle().await.unwrap(), None);
        assert_eq!(first.await.unwrap().unwrap().unwrap().sent, 2);
    }

    #[tokio::test]
    async fn cleanup_applies_retention_windows() {
        let h = harness(Config::with_data_dir("unused"));
        let now = Utc::now();

        let sent = append(&h.store, 0);
        h.store.claim(sent, now).unwrap();
        h.store.mark_sent(sent, now - chrono::Duration::days(8)).unwrap();

        let failed_recent = append(&h.store, 1);
        h.store.claim(failed_recent, now).unwrap();
        h.store
            .mark_failed(failed_recent, "bad", now - chrono::Duration::days(8))
            .unwrap();

        let failed_old = append(&h.store, 2);
        h.store.claim(failed_old, now).unwrap();
        h.store
            .mark_failed(failed_old, "bad", now - chrono::Duration::days(31))
            .unwrap();

        let report = h.processor.run_cleanup(now).unwrap();
        assert_eq!(report.sent_purged, 1);
        assert_eq!(report.failed_purged, 1);
        assert!(h.store.get(failed_recent).unwrap().is_some());
    }

    /// Deletes the row of the first capture it receives, then accepts everything
    struct VanishingRow {
        db: std::path::PathBuf,
        deleted: AtomicBool,
    }

    #[async_trait]
    impl MemoryWorker for VanishingRow {
        async fn submit_capture(&self, submission: &CaptureSubmission) -> std::result::Result<(), RemoteError> {
            if !self.deleted.swap(true, Ordering::SeqCst) {
                let conn = rusqlite::Connection::open(&self.db).unwrap();
                conn.execute(
                    "DELETE FROM captures WHERE id = ?1",
                    [submission.capture_id.to_string()],
                )
                .unwrap();
            }
            Ok(())
        }

        async fn query_context(&self, _: &str) -> std::result::Result<String, RemoteError> {
            Ok(String::new())
        }

        async fn health_check(&self) -> std::result::Result<(), RemoteError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_error_mid_cycle_releases_claimed_captures() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("outbox.db");
        let store = Arc::new(OutboxStore::open(&db).unwrap());
        let config = Config {
            delay_between_ms: 0,
            ..Config::with_data_dir(dir.path())
        };
        let worker = Arc::new(VanishingRow {
            db,
            deleted: AtomicBool::new(false),
        });
        let processor = DrainProcessor::new(
            store.clone(),
            Arc::new(CircuitBreaker::new((&config).into())),
            RemoteClient::new(worker, config.request_timeout()),
            ContextCache::new(store.clone(), config.cache_max_entries, config.cache_ttl()),
            (&config).into(),
        );
        let ids: Vec<_> = (0..3).map(|n| append(&store, n)).collect();

        let err = processor.run_cycle().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)));
        assert!(store.get(ids[0]).unwrap().is_none());
        for id in &ids[1..] {
            let record = store.get(*id).unwrap().unwrap();
            assert_eq!(record.status, CaptureStatus::Pending);
            assert_eq!(record.retry_count, 0);
        }

        let report = processor.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.sent, 2);
        assert_eq!(store.queue_depth().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loops_exit_when_shutdown_sender_is_dropped() {
        let h = harness(Config::with_data_dir("unused"));
        let (tx, rx) = watch::channel(false);
        let drain = h.processor.clone().spawn(rx.clone());
        let cleanup = h.processor.clone().spawn_cleanup(rx);

        drop(tx);

        for handle in [drain, cleanup] {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop kept running after its sender was dropped")
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_drains_and_stops() {
        let h = harness(Config {
            processor_interval_secs: 30,
            ..Config::with_data_dir("unused")
        });
        let id = append(&h.store, 0);

        let (tx, rx) = watch::channel(false);
        let handle = h.processor.clone().spawn(rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.get(id).unwrap().unwrap().status, CaptureStatus::Sent);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
