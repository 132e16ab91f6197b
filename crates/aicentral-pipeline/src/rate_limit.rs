use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use tracing::debug;

use aicentral_endpoint::{
    CallDetails, DownstreamUsage, GatewayResponse, Headers, REMAINING_REQUESTS_HEADER,
    REMAINING_TOKENS_HEADER, RequestContext, header_set, headers_to_map,
};

use crate::step::{Next, PipelineStep};

/// What isolates one caller's budget from another's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionScope {
    /// One shared budget for the whole pipeline.
    Global,
    /// One budget per authenticated client.
    Client,
}

impl PartitionScope {
    fn key(self, call: &CallDetails) -> String {
        match self {
            PartitionScope::Global => "global".to_string(),
            PartitionScope::Client => call.partition_key(),
        }
    }
}

/// Per-key windows behind per-key locks. The outer lock is held only long
/// enough to clone a slot handle, never across window arithmetic.
#[derive(Debug, Default)]
struct PartitionMap<S> {
    slots: Mutex<HashMap<String, Arc<Mutex<S>>>>,
}

impl<S: Default> PartitionMap<S> {
    fn slot(&self, key: &str) -> Arc<Mutex<S>> {
        let mut guard = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.entry(key.to_string()).or_default().clone()
    }
}

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    used: u64,
}

impl Window {
    /// Fixed-window semantics: once the window elapses the count resets
    /// atomically, there is no gradual leak.
    fn roll(&mut self, now: Instant, length: Duration) {
        match self.started {
            Some(started) if now.duration_since(started) < length => {}
            _ => {
                self.started = Some(now);
                self.used = 0;
            }
        }
    }

    fn reset_in(&self, now: Instant, length: Duration) -> Duration {
        match self.started {
            Some(started) => length.saturating_sub(now.duration_since(started)),
            None => length,
        }
    }
}

fn rejection_429(
    call: &CallDetails,
    ctx: &RequestContext,
    retry_after: Duration,
    remaining_header: &str,
) -> GatewayResponse {
    let mut headers = Headers::new();
    header_set(
        &mut headers,
        "retry-after",
        retry_after.as_secs().max(1).to_string(),
    );
    header_set(&mut headers, remaining_header, "0");
    let usage = DownstreamUsage::short_circuit(
        call.kind,
        call.deployment.clone(),
        call.client.clone(),
        ctx.remote_addr,
    );
    GatewayResponse::rejection(
        StatusCode::TOO_MANY_REQUESTS,
        headers_to_map(&headers),
        "rate limit exceeded",
        usage,
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixedWindowConfig {
    pub limit: u64,
    pub window_seconds: u64,
    pub scope: PartitionScope,
}

/// Fixed-window request limiter: one permit per request, partitioned by
/// client (or shared globally). Exceeding the window answers 429 with
/// `Retry-After` computed from the window reset, without touching a backend.
#[derive(Debug)]
pub struct FixedWindowRateLimiterStep {
    limit: u64,
    window: Duration,
    scope: PartitionScope,
    partitions: PartitionMap<Window>,
}

impl FixedWindowRateLimiterStep {
    pub fn new(limit: u64, window: Duration, scope: PartitionScope) -> Self {
        Self {
            limit,
            window,
            scope,
            partitions: PartitionMap::default(),
        }
    }

    pub fn from_config(config: FixedWindowConfig) -> Self {
        Self::new(
            config.limit,
            Duration::from_secs(config.window_seconds),
            config.scope,
        )
    }
}

#[async_trait]
impl PipelineStep for FixedWindowRateLimiterStep {
    async fn handle(
        &self,
        ctx: &RequestContext,
        call: CallDetails,
        next: Next<'_>,
    ) -> GatewayResponse {
        let key = self.scope.key(&call);
        let slot = self.partitions.slot(&key);

        let verdict = {
            let mut window = match slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            window.roll(now, self.window);
            if window.used >= self.limit {
                Err(window.reset_in(now, self.window))
            } else {
                window.used += 1;
                Ok(self.limit - window.used)
            }
        };

        match verdict {
            Err(retry_after) => {
                debug!(
                    event = "request_rate_limited",
                    trace_id = %ctx.trace_id,
                    partition = %key
                );
                rejection_429(&call, ctx, retry_after, REMAINING_REQUESTS_HEADER)
            }
            Ok(remaining) => {
                ctx.annotate(REMAINING_REQUESTS_HEADER, remaining.to_string());
                next.run(ctx, call).await
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenWindowConfig {
    pub limit: u64,
    pub window_seconds: u64,
    pub scope: PartitionScope,
}

/// Token-budget limiter: the real cost is only known after the downstream
/// call, so admission is a zero-cost pre-check (already-exhausted partitions
/// get 429) and consumption is deducted afterwards, clamped so the budget
/// never goes negative. Concurrent admission right at the boundary can
/// slightly overshoot; that is accepted, the clamp keeps accounting sane.
#[derive(Debug)]
pub struct TokenRateLimiterStep {
    limit: u64,
    window: Duration,
    scope: PartitionScope,
    partitions: PartitionMap<Window>,
}

impl TokenRateLimiterStep {
    pub fn new(limit: u64, window: Duration, scope: PartitionScope) -> Self {
        Self {
            limit,
            window,
            scope,
            partitions: PartitionMap::default(),
        }
    }

    pub fn from_config(config: TokenWindowConfig) -> Self {
        Self::new(
            config.limit,
            Duration::from_secs(config.window_seconds),
            config.scope,
        )
    }

    /// Remaining budget for a partition, for tests and diagnostics.
    pub fn remaining(&self, key: &str) -> u64 {
        let slot = self.partitions.slot(key);
        let mut window = match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.roll(Instant::now(), self.window);
        self.limit - window.used.min(self.limit)
    }
}

#[async_trait]
impl PipelineStep for TokenRateLimiterStep {
    async fn handle(
        &self,
        ctx: &RequestContext,
        call: CallDetails,
        next: Next<'_>,
    ) -> GatewayResponse {
        let key = self.scope.key(&call);
        let slot = self.partitions.slot(&key);

        let verdict = {
            let mut window = match slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            window.roll(now, self.window);
            if window.used >= self.limit {
                Err(window.reset_in(now, self.window))
            } else {
                Ok(self.limit - window.used)
            }
        };

        let remaining_before = match verdict {
            Err(retry_after) => {
                debug!(
                    event = "token_rate_limited",
                    trace_id = %ctx.trace_id,
                    partition = %key
                );
                return rejection_429(&call, ctx, retry_after, REMAINING_TOKENS_HEADER);
            }
            Ok(remaining) => remaining,
        };
        ctx.annotate(REMAINING_TOKENS_HEADER, remaining_before.to_string());

        let response = next.run(ctx, call).await;

        let consumed = response.usage.consumed_tokens();
        let remaining_after = {
            let mut window = match slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            window.roll(Instant::now(), self.window);
            window.used = window.used.saturating_add(consumed).min(self.limit);
            self.limit - window.used
        };
        ctx.annotate(REMAINING_TOKENS_HEADER, remaining_after.to_string());

        response
    }
}
