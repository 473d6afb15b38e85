//! Wiring for the whole relay: one store, one breaker, one client

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::cache::ContextCache;
use crate::capture::NewCapture;
use crate::config::Config;
use crate::context::{ContextResponse, ContextService};
use crate::drain::{self, DrainProcessor};
use crate::error::Result;
use crate::health::{HealthReporter, HealthStatus};
use crate::remote::{MemoryWorker, RemoteClient};
use crate::storage::OutboxStore;

/// Entry point for producers, consumers and operators.
///
/// ```rust,ignore
/// let relay = Relay::open(config, Arc::new(HttpWorker::new(url, timeout)?))?;
/// let handles = relay.start_background(shutdown_rx);
///
/// let id = relay.capture("session-1", "hi", "hello!", "telegram")?;
/// let context = relay.get_context("what did I say about Friday?").await;
/// ```
pub struct Relay {
    config: Config,
    store: Arc<OutboxStore>,
    breaker: Arc<CircuitBreaker>,
    client: RemoteClient,
    context: ContextService,
    drain: Arc<DrainProcessor>,
    health: HealthReporter,
}

impl Relay {
    /// Open the outbox and build every component around a single shared breaker
    pub fn open(config: Config, worker: Arc<dyn MemoryWorker>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(OutboxStore::new(&config)?);

        // Anything still `sending` belongs to a process that is gone now
        let reconciled = store.reconcile_stuck(chrono::Duration::zero(), Utc::now())?;
        if reconciled > 0 {
            tracing::info!(reconciled, "Returned interrupted captures to the queue");
        }

        let breaker = Arc::new(CircuitBreaker::new((&config).into()));
        let client = RemoteClient::new(worker, config.request_timeout());
        let cache = ContextCache::new(store.clone(), config.cache_max_entries, config.cache_ttl());

        let context = ContextService::new(breaker.clone(), client.clone(), cache.clone());
        let drain = Arc::new(DrainProcessor::new(
            store.clone(),
            breaker.clone(),
            client.clone(),
            cache,
            (&config).into(),
        ));
        let health = HealthReporter::new(store.clone(), breaker.clone(), (&config).into());

        tracing::info!(
            data_dir = ?config.data_dir,
            worker_url = %config.worker_url,
            "Relay opened"
        );

        Ok(Self {
            config,
            store,
            breaker,
            client,
            context,
            drain,
            health,
        })
    }

    /// Record one conversational exchange.
    ///
    /// Returns once the capture is durable. Only local storage failures are
    /// reported; delivery to the worker happens later, or in a detached
    /// task when `opportunistic_send` is on.
    pub fn capture(
        &self,
        session_id: &str,
        user_message: &str,
        assistant_response: &str,
        channel: &str,
    ) -> Result<Uuid> {
        let capture = NewCapture::new(session_id, user_message, assistant_response, channel);
        let id = self.store.append(&capture, Utc::now())?;
        tracing::debug!(capture_id = %id, session_id, channel, "Capture stored");

        if self.config.opportunistic_send {
            self.send_soon(id);
        }
        Ok(id)
    }

    fn send_soon(&self, id: Uuid) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let breaker = self.breaker.clone();
        let client = self.client.clone();
        let max_retries = self.config.max_retries;

        runtime.spawn(async move {
            // The drain loop may have claimed it already
            let record = match store.claim(id, Utc::now()) {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(capture_id = %id, error = %e, "Could not claim capture for immediate send");
                    return;
                }
            };

            if let Err(e) = drain::deliver(&store, &breaker, &client, &record, max_retries).await {
                tracing::warn!(capture_id = %id, error = %e, "Immediate send could not record its outcome");
            }
        });
    }

    /// Context for `query`, degraded rather than failing when the worker is away
    pub async fn get_context(&self, query: &str) -> ContextResponse {
        self.context.get_context(query).await
    }

    pub fn status(&self) -> Result<HealthStatus> {
        self.health.status(Utc::now())
    }

    /// Ask the worker whether it is up. Bypasses the breaker and never
    /// changes its state.
    pub async fn worker_reachable(&self) -> bool {
        match self.client.health_check().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Memory worker health check failed");
                false
            }
        }
    }

    /// Start the drain and cleanup loops. Both stop when `shutdown` turns true.
    pub fn start_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            interval = ?self.config.processor_interval(),
            max_per_cycle = self.config.max_per_cycle,
            "Starting drain processor"
        );
        vec![
            self.drain.clone().spawn(shutdown.clone()),
            self.drain.clone().spawn_cleanup(shutdown),
        ]
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<OutboxStore> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn drain(&self) -> &Arc<DrainProcessor> {
        &self.drain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureStatus, CaptureSubmission};
    use crate::error::RemoteError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Worker {
        down: AtomicBool,
        submits: AtomicUsize,
    }

    #[async_trait]
    impl MemoryWorker for Worker {
        async fn submit_capture(&self, _: &CaptureSubmission) -> std::result::Result<(), RemoteError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(RemoteError::transient("connection refused"))
            } else {
                Ok(())
            }
        }

        async fn query_context(&self, _: &str) -> std::result::Result<String, RemoteError> {
            Err(RemoteError::transient("connection refused"))
        }

        async fn health_check(&self) -> std::result::Result<(), RemoteError> {
            if self.down.load(Ordering::SeqCst) {
                Err(RemoteError::transient("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    fn open(opportunistic: bool) -> (tempfile::TempDir, Arc<Worker>, Relay) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            opportunistic_send: opportunistic,
            ..Config::with_data_dir(dir.path())
        };
        let worker = Arc::new(Worker::default());
        let relay = Relay::open(config, worker.clone()).unwrap();
        (dir, worker, relay)
    }

    #[tokio::test]
    async fn capture_is_durable_before_any_send() {
        let (_dir, worker, relay) = open(false);
        let id = relay.capture("s-1", "hi", "hello", "telegram").unwrap();

        let record = relay.store().get(id).unwrap().unwrap();
        assert_eq!(record.status, CaptureStatus::Pending);
        assert_eq!(record.input_text, "hi");
        assert_eq!(worker.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn opportunistic_send_delivers_right_away() {
        let (_dir, worker, relay) = open(true);
        let id = relay.capture("s-1", "hi", "hello", "telegram").unwrap();

        for _ in 0..50 {
            if relay.store().get(id).unwrap().unwrap().status == CaptureStatus::Sent {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(relay.store().get(id).unwrap().unwrap().status, CaptureStatus::Sent);
        assert_eq!(worker.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capture_succeeds_with_worker_down() {
        let (_dir, worker, relay) = open(true);
        worker.down.store(true, Ordering::SeqCst);

        for n in 0..10 {
            relay.capture("s-1", &format!("m{}", n), "r", "chat").unwrap();
        }
        assert_eq!(relay.status().unwrap().queue_depth, 10);
    }

    #[tokio::test]
    async fn worker_check_leaves_breaker_alone() {
        let (_dir, worker, relay) = open(false);
        assert!(relay.worker_reachable().await);

        worker.down.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            assert!(!relay.worker_reachable().await);
        }
        assert_eq!(relay.breaker().state(), crate::breaker::BreakerState::Closed);
        assert_eq!(relay.breaker().consecutive_failures(), 0);
    }

    #[test]
    fn open_resets_interrupted_sends() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            opportunistic_send: false,
            ..Config::with_data_dir(dir.path())
        };

        let id = {
            let store = OutboxStore::new(&config).unwrap();
            let id = store.append(&NewCapture::new("s", "m", "r", "chat"), Utc::now()).unwrap();
            store.claim(id, Utc::now()).unwrap();
            id
        };

        let relay = Relay::open(config, Arc::new(Worker::default())).unwrap();
        assert_eq!(relay.store().get(id).unwrap().unwrap().status, CaptureStatus::Pending);
    }

    #[test]
    fn open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            max_retries: 0,
            ..Config::with_data_dir(dir.path())
        };
        assert!(Relay::open(config, Arc::new(Worker::default())).is_err());
    }
}
