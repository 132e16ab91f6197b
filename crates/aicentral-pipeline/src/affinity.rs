use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use aicentral_endpoint::{CallDetails, GatewayResponse, RequestContext};

use crate::step::{Next, PipelineStep};

#[derive(Debug)]
struct AffinityEntry {
    endpoint: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AffinityConfig {
    pub ttl_seconds: u64,
}

/// Sticky routing: remembers, per client, which endpoint last served them
/// successfully and biases the selector toward it on the next call.
///
/// Entries carry a sliding TTL, refreshed on every successful call and
/// evicted lazily when read after expiry. An explicit affinity marker on the
/// call (async polling follow-ups) always wins over the cache.
#[derive(Debug)]
pub struct AffinityStep {
    ttl: Duration,
    entries: Mutex<HashMap<String, Arc<Mutex<Option<AffinityEntry>>>>>,
}

impl AffinityStep {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: AffinityConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_seconds))
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Option<AffinityEntry>>> {
        let mut guard = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.entry(key.to_string()).or_default().clone()
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let slot = self.slot(key);
        let mut guard = match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let expired = guard
            .as_ref()
            .map(|entry| entry.expires_at <= Instant::now())?;
        if expired {
            *guard = None;
            return None;
        }
        guard.as_ref().map(|entry| entry.endpoint.clone())
    }

    fn refresh(&self, key: &str, endpoint: &str) {
        let slot = self.slot(key);
        if let Ok(mut guard) = slot.lock() {
            *guard = Some(AffinityEntry {
                endpoint: endpoint.to_string(),
                expires_at: Instant::now() + self.ttl,
            });
        }
    }
}

#[async_trait]
impl PipelineStep for AffinityStep {
    async fn handle(
        &self,
        ctx: &RequestContext,
        call: CallDetails,
        next: Next<'_>,
    ) -> GatewayResponse {
        let key = call.partition_key();
        let call = if call.preferred_endpoint.is_some() {
            call
        } else if let Some(endpoint) = self.lookup(&key) {
            debug!(
                event = "affinity_hint",
                trace_id = %ctx.trace_id,
                endpoint = %endpoint
            );
            call.with_preferred_endpoint(Some(endpoint))
        } else {
            call
        };

        let response = next.run(ctx, call).await;

        if response.usage.success
            && let Some(endpoint) = response
                .affinity_endpoint
                .as_deref()
                .or(response.usage.endpoint.as_deref())
        {
            self.refresh(&key, endpoint);
        }

        response
    }
}
