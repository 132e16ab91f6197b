use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use aicentral_endpoint::{AttemptError, CallDetails, GatewayResponse, RequestContext};

use super::random::shuffled_order;
use super::{RouteTarget, prefer, try_in_order};

/// Prefer-primary-then-fail-over semantics: the primary bucket is exhausted
/// first (randomized within the bucket to spread load), and only then does the
/// fallback bucket get a turn. Only the fallback bucket's final candidate ever
/// runs as the last chance.
#[derive(Debug)]
pub struct PrioritySelector {
    name: String,
    primary: Vec<RouteTarget>,
    fallback: Vec<RouteTarget>,
    rng: Mutex<StdRng>,
}

impl PrioritySelector {
    pub fn new(
        name: impl Into<String>,
        primary: Vec<RouteTarget>,
        fallback: Vec<RouteTarget>,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            fallback,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn targets(&self) -> Vec<&RouteTarget> {
        self.primary.iter().chain(self.fallback.iter()).collect()
    }

    pub(crate) async fn handle(
        &self,
        ctx: &RequestContext,
        call: &CallDetails,
        last_chance: bool,
    ) -> Result<GatewayResponse, AttemptError> {
        if !self.primary.is_empty() {
            let mut order = shuffled_order(&self.rng, self.primary.len());
            prefer(&mut order, &self.primary, call);
            match try_in_order(ctx, call, &self.primary, &order, false).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(
                        event = "primary_bucket_exhausted",
                        trace_id = %ctx.trace_id,
                        selector = %self.name,
                        last_error = %err
                    );
                    if self.fallback.is_empty() {
                        return Err(err);
                    }
                }
            }
        }

        let mut order = shuffled_order(&self.rng, self.fallback.len());
        prefer(&mut order, &self.fallback, call);
        try_in_order(ctx, call, &self.fallback, &order, last_chance).await
    }
}
