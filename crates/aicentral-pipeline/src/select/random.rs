use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use aicentral_endpoint::{AttemptError, CallDetails, GatewayResponse, RequestContext};

use super::{RouteTarget, prefer, try_in_order};

/// Without-replacement random draws over the candidate set: every candidate is
/// tried at most once per call, in a fresh random order each time, so load
/// spreads evenly and no endpoint is retried before the others have had a
/// turn.
#[derive(Debug)]
pub struct RandomSelector {
    name: String,
    targets: Vec<RouteTarget>,
    rng: Mutex<StdRng>,
}

impl RandomSelector {
    pub fn new(name: impl Into<String>, targets: Vec<RouteTarget>) -> Self {
        Self {
            name: name.into(),
            targets,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn targets(&self) -> &[RouteTarget] {
        &self.targets
    }

    pub(crate) fn draw_order(&self, call: &CallDetails) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.targets.len()).collect();
        if let Ok(mut rng) = self.rng.lock() {
            order.shuffle(&mut *rng);
        }
        prefer(&mut order, &self.targets, call);
        order
    }

    pub(crate) async fn handle(
        &self,
        ctx: &RequestContext,
        call: &CallDetails,
        last_chance: bool,
    ) -> Result<GatewayResponse, AttemptError> {
        let order = self.draw_order(call);
        try_in_order(ctx, call, &self.targets, &order, last_chance).await
    }
}

/// Shared helper for strategies that need a plain shuffled order over an
/// arbitrary bucket of candidates.
pub(crate) fn shuffled_order(rng: &Mutex<StdRng>, len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if let Ok(mut rng) = rng.lock() {
        order.shuffle(&mut *rng);
    }
    order
}

/// Uniform random duration in millis, for cold-start latency estimates.
pub(crate) fn jitter_millis(rng: &Mutex<StdRng>, low: u64, high: u64) -> u64 {
    match rng.lock() {
        Ok(mut rng) => rng.random_range(low..=high),
        Err(_) => low,
    }
}
