//! # Dieah Relay
//!
//! Reliable delivery between the conversation handler and the memory worker.
//!
//! ## Architecture
//!
//! Every exchange is written to a local SQLite outbox before anything talks
//! to the network:
//! - **Outbox** - durable queue of captures (`pending → sending → sent | failed`)
//! - **Circuit breaker** - one shared breaker in front of every remote call
//! - **Drain processor** - paced background delivery with a retry cap
//! - **Context cache** - last good context answers, served when the worker is away
//! - **Health** - queue depth, success rate and breaker state for monitoring
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dieah_relay::{Config, HttpWorker, Relay};
//!
//! let config = Config::from_env()?;
//! let worker = HttpWorker::new(&config.worker_url, config.request_timeout())?;
//! let relay = Relay::open(config, Arc::new(worker))?;
//! relay.start_background(shutdown_rx);
//!
//! // Never waits on the worker
//! relay.capture(session_id, user_message, assistant_response, "telegram")?;
//!
//! // Never fails; check `is_degraded`
//! let context = relay.get_context(query).await;
//! ```

pub mod breaker;
pub mod cache;
pub mod capture;
pub mod config;
pub mod context;
pub mod drain;
pub mod error;
pub mod health;
pub mod relay;
pub mod remote;
pub mod storage;

pub use breaker::{BreakerState, CircuitBreaker};
pub use capture::{CaptureRecord, CaptureStatus, NewCapture};
pub use config::Config;
pub use context::{ContextResponse, ContextSource};
pub use error::{CallError, Error, RemoteError, Result};
pub use health::{AlertLevel, HealthStatus};
pub use relay::Relay;
pub use remote::{HttpWorker, MemoryWorker};
pub use storage::OutboxStore;
