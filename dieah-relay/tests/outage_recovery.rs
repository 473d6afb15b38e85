//! End-to-end behaviour of the relay across a memory worker outage

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use dieah_relay::capture::CaptureSubmission;
use dieah_relay::context::{ContextSource, DEGRADED_NOTICE};
use dieah_relay::{AlertLevel, BreakerState, CaptureStatus, Config, MemoryWorker, Relay, RemoteError};

/// In-process stand-in for the memory worker
#[derive(Default)]
struct FakeWorker {
    down: AtomicBool,
    submits: AtomicUsize,
    delivered: std::sync::Mutex<Vec<uuid::Uuid>>,
}

impl FakeWorker {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemoryWorker for FakeWorker {
    async fn submit_capture(&self, submission: &CaptureSubmission) -> Result<(), RemoteError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("connection refused"));
        }
        self.delivered.lock().unwrap().push(submission.capture_id);
        Ok(())
    }

    async fn query_context(&self, query: &str) -> Result<String, RemoteError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("connection refused"));
        }
        Ok(format!("remembered: {}", query))
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn relay(dir: &tempfile::TempDir, tweak: impl FnOnce(&mut Config)) -> (Arc<FakeWorker>, Arc<Relay>) {
    let mut config = Config {
        opportunistic_send: false,
        delay_between_ms: 0,
        ..Config::with_data_dir(dir.path())
    };
    tweak(&mut config);

    let worker = Arc::new(FakeWorker::default());
    let relay = Arc::new(Relay::open(config, worker.clone()).unwrap());
    (worker, relay)
}

#[tokio::test(start_paused = true)]
async fn capture_during_outage_is_sent_after_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let (worker, relay) = relay(&dir, |_| {});
    worker.set_down(true);

    // Five real failures trip the breaker
    for n in 0..5 {
        relay.capture("s-1", &format!("before outage {}", n), "ok", "telegram").unwrap();
    }
    let report = relay.drain().run_cycle().await.unwrap().unwrap();
    assert_eq!(report.retried, 5);
    assert_eq!(relay.breaker().state(), BreakerState::Open);
    assert_eq!(worker.submits(), 5);

    // C1 arrives while the breaker is open: stored, never attempted
    let c1 = relay.capture("s-1", "remind me on Friday", "Will do.", "telegram").unwrap();
    let report = relay.drain().run_cycle().await.unwrap().unwrap();
    assert!(report.short_circuited);
    assert_eq!(worker.submits(), 5);

    let record = relay.store().get(c1).unwrap().unwrap();
    assert_eq!(record.status, CaptureStatus::Pending);
    assert_eq!(record.retry_count, 0);

    // Worker comes back; after the recovery timeout one probe closes the breaker
    worker.set_down(false);
    tokio::time::advance(Duration::from_secs(31)).await;

    let report = relay.drain().run_cycle().await.unwrap().unwrap();
    assert_eq!(relay.breaker().state(), BreakerState::Closed);
    assert_eq!(report.sent, 6);

    let record = relay.store().get(c1).unwrap().unwrap();
    assert_eq!(record.status, CaptureStatus::Sent);
    assert!(record.sent_at.is_some());
    assert!(worker.delivered.lock().unwrap().contains(&c1));
    assert_eq!(relay.status().unwrap().queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn background_loop_drains_everything_once_worker_is_up() {
    let dir = tempfile::tempdir().unwrap();
    let (worker, relay) = relay(&dir, |c| c.delay_between_ms = 2_000);

    let ids: Vec<_> = (0..12)
        .map(|n| relay.capture("s-2", &format!("message {}", n), "reply", "discord").unwrap())
        .collect();

    let (tx, rx) = watch::channel(false);
    let handles = relay.start_background(rx);

    // Two cycles at 30 s spacing cover twelve captures at ten per cycle
    tokio::time::sleep(Duration::from_secs(90)).await;

    for id in &ids {
        assert_eq!(relay.store().get(*id).unwrap().unwrap().status, CaptureStatus::Sent);
    }
    assert_eq!(worker.submits(), 12);

    tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn context_degrades_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let (worker, relay) = relay(&dir, |_| {});

    let fresh = relay.get_context("Friday plans").await;
    assert_eq!(fresh.source, ContextSource::Fresh);
    assert_eq!(fresh.text, "remembered: Friday plans");

    worker.set_down(true);
    for _ in 0..5 {
        relay.get_context("anything").await;
    }
    assert_eq!(relay.breaker().state(), BreakerState::Open);

    let cached = relay.get_context("  friday PLANS ").await;
    assert_eq!(cached.source, ContextSource::Cached);
    assert!(!cached.is_degraded);

    let missing = relay.get_context("the weather").await;
    assert!(missing.is_degraded);
    assert_eq!(missing.text, DEGRADED_NOTICE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_captures_are_all_stored() {
    let dir = tempfile::tempdir().unwrap();
    let (worker, relay) = relay(&dir, |_| {});
    worker.set_down(true);

    let tasks: Vec<_> = (0..8)
        .map(|t| {
            let relay = relay.clone();
            tokio::spawn(async move {
                for n in 0..25 {
                    relay
                        .capture(&format!("s-{}", t), &format!("m{}", n), "r", "chat")
                        .unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let status = relay.status().unwrap();
    assert_eq!(status.queue_depth, 200);
    assert_eq!(status.level, AlertLevel::Warning);
    assert_eq!(worker.submits(), 0);
}
