//! Context reads: fresh from the memory worker when possible, cached or
//! explicitly degraded when not

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreaker;
use crate::cache::ContextCache;
use crate::error::CallError;
use crate::remote::RemoteClient;

/// Text returned when neither the worker nor the cache can help
pub const DEGRADED_NOTICE: &str =
    "[memory unavailable] Long-term context could not be loaded right now; \
     answer from the current conversation only.";

/// Where a context answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Straight from the memory worker
    Fresh,

    /// From cache, still within its TTL
    Cached,

    /// From cache, past its TTL
    Stale,

    /// Nothing available; `text` is the degraded notice
    Unavailable,
}

/// Answer to a context read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub text: String,
    pub is_degraded: bool,
    pub source: ContextSource,
}

impl ContextResponse {
    fn unavailable() -> Self {
        Self {
            text: DEGRADED_NOTICE.to_string(),
            is_degraded: true,
            source: ContextSource::Unavailable,
        }
    }
}

/// Serves context reads through the shared breaker with cache fallback
pub struct ContextService {
    breaker: Arc<CircuitBreaker>,
    client: RemoteClient,
    cache: ContextCache,
}

impl ContextService {
    pub fn new(breaker: Arc<CircuitBreaker>, client: RemoteClient, cache: ContextCache) -> Self {
        Self {
            breaker,
            client,
            cache,
        }
    }

    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    /// Fetch context for `query`. Never fails: when the worker is out of
    /// reach the answer is cached or carries `is_degraded = true`.
    pub async fn get_context(&self, query: &str) -> ContextResponse {
        let client = &self.client;
        let fetched = self
            .breaker
            .execute(|| async move { client.query_context(query).await })
            .await;

        match fetched {
            Ok(payload) => {
                if let Err(e) = self.cache.put(query, payload.as_str(), Utc::now()) {
                    tracing::warn!(error = %e, "Failed to refresh context cache");
                }
                ContextResponse {
                    text: payload,
                    is_degraded: false,
                    source: ContextSource::Fresh,
                }
            }
            Err(err) => {
                match &err {
                    CallError::ShortCircuited => {
                        tracing::debug!("Breaker open, serving context from cache")
                    }
                    CallError::Remote(e) => {
                        tracing::warn!(error = %e, "Context fetch failed, serving from cache")
                    }
                }
                self.fallback(query)
            }
        }
    }

    fn fallback(&self, query: &str) -> ContextResponse {
        let entry = match self.cache.get(query) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Context cache read failed");
                None
            }
        };

        match entry {
            Some(entry) if !entry.payload.trim().is_empty() => {
                let fresh = entry.is_fresh(self.cache.ttl(), Utc::now());
                ContextResponse {
                    text: entry.payload,
                    is_degraded: !fresh,
                    source: if fresh {
                        ContextSource::Cached
                    } else {
                        ContextSource::Stale
                    },
                }
            }
            _ => ContextResponse::unavailable(),
        }
    }
}
