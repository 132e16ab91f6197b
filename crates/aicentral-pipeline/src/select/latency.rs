use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use aicentral_endpoint::{AttemptError, CallDetails, GatewayResponse, RequestContext};

use super::random::jitter_millis;
use super::{RouteTarget, prefer};

const SAMPLE_CAPACITY: usize = 10;
const MIN_SAMPLES: usize = 2;
const COLD_ESTIMATE_LOW_MS: u64 = 2;
const COLD_ESTIMATE_HIGH_MS: u64 = 20;

/// Orders candidates by recent average round-trip latency, cheapest first.
///
/// Each candidate keeps a bounded window of its most recent successful call
/// durations. Candidates without enough samples get a small random estimate
/// instead, so cold endpoints are probed early rather than starved or pinned.
#[derive(Debug)]
pub struct LowestLatencySelector {
    name: String,
    targets: Vec<RouteTarget>,
    samples: Vec<Mutex<VecDeque<Duration>>>,
    rng: Mutex<StdRng>,
}

impl LowestLatencySelector {
    pub fn new(name: impl Into<String>, targets: Vec<RouteTarget>) -> Self {
        let samples = targets
            .iter()
            .map(|_| Mutex::new(VecDeque::with_capacity(SAMPLE_CAPACITY)))
            .collect();
        Self {
            name: name.into(),
            targets,
            samples,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn targets(&self) -> &[RouteTarget] {
        &self.targets
    }

    fn estimate(&self, idx: usize) -> Duration {
        let guard = match self.samples[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.len() >= MIN_SAMPLES {
            let total: Duration = guard.iter().sum();
            return total / guard.len() as u32;
        }
        drop(guard);
        Duration::from_millis(jitter_millis(
            &self.rng,
            COLD_ESTIMATE_LOW_MS,
            COLD_ESTIMATE_HIGH_MS,
        ))
    }

    fn record(&self, idx: usize, duration: Duration) {
        let mut guard = match self.samples[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.len() == SAMPLE_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(duration);
    }

    /// Average recorded latency for diagnostics and tests.
    pub fn average_latency(&self, endpoint: &str) -> Option<Duration> {
        let idx = self
            .targets
            .iter()
            .position(|target| target.name() == endpoint)?;
        let guard = self.samples[idx].lock().ok()?;
        if guard.is_empty() {
            return None;
        }
        let total: Duration = guard.iter().sum();
        Some(total / guard.len() as u32)
    }

    pub(crate) async fn handle(
        &self,
        ctx: &RequestContext,
        call: &CallDetails,
        last_chance: bool,
    ) -> Result<GatewayResponse, AttemptError> {
        let mut order: Vec<usize> = (0..self.targets.len()).collect();
        let estimates: Vec<Duration> = order.iter().map(|&idx| self.estimate(idx)).collect();
        order.sort_by_key(|&idx| estimates[idx]);
        prefer(&mut order, &self.targets, call);

        let mut last_error: Option<AttemptError> = None;
        for (position, &idx) in order.iter().enumerate() {
            let is_final = position + 1 == order.len();
            match self.targets[idx]
                .dispatch(ctx, call, last_chance && is_final)
                .await
            {
                Ok(response) => {
                    if response.usage.success {
                        self.record(idx, response.usage.duration);
                    }
                    return Ok(response);
                }
                Err(err) if is_final => return Err(err),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AttemptError::new(self.name.clone(), aicentral_endpoint::FailureKind::BreakerOpen)
        }))
    }
}
