use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use aicentral_endpoint::{
    AttemptError, CallDetails, EndpointDispatcher, GatewayResponse, RequestContext,
};

mod latency;
mod priority;
mod random;

pub use latency::LowestLatencySelector;
pub use priority::PrioritySelector;
pub use random::RandomSelector;

/// A selection candidate: either a concrete backend or a nested selector
/// exposed as if it were one. Modeled as a tagged union so traversal never
/// needs downcasting.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Leaf(Arc<EndpointDispatcher>),
    Group(Arc<EndpointSelector>),
}

impl RouteTarget {
    pub fn name(&self) -> &str {
        match self {
            RouteTarget::Leaf(endpoint) => endpoint.name(),
            RouteTarget::Group(selector) => selector.name(),
        }
    }

    /// Recursively collects the leaf endpoints below this target, so affinity
    /// matching and diagnostics only ever see real backends.
    pub fn collect_leaves(&self, out: &mut Vec<Arc<EndpointDispatcher>>) {
        match self {
            RouteTarget::Leaf(endpoint) => {
                if !out.iter().any(|existing| existing.id() == endpoint.id()) {
                    out.push(endpoint.clone());
                }
            }
            RouteTarget::Group(selector) => {
                for endpoint in selector.contained_endpoints() {
                    if !out.iter().any(|existing| existing.id() == endpoint.id()) {
                        out.push(endpoint);
                    }
                }
            }
        }
    }

    pub fn contains_leaf(&self, name: &str) -> bool {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves.iter().any(|endpoint| endpoint.name() == name)
    }

    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        call: &CallDetails,
        last_chance: bool,
    ) -> Result<GatewayResponse, AttemptError> {
        match self {
            RouteTarget::Leaf(endpoint) => endpoint.dispatch(ctx, call, last_chance).await,
            RouteTarget::Group(selector) => selector.handle(ctx, call, last_chance).await,
        }
    }
}

/// Delegates to exactly one target.
#[derive(Debug)]
pub struct SingleSelector {
    name: String,
    target: RouteTarget,
}

impl SingleSelector {
    pub fn new(name: impl Into<String>, target: RouteTarget) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        call: &CallDetails,
        last_chance: bool,
    ) -> Result<GatewayResponse, AttemptError> {
        self.target.dispatch(ctx, call, last_chance).await
    }
}

/// An endpoint-selection strategy. Strategies share one contract: given a
/// call and whether this is the caller's last chance, produce either a client
/// response or a routing-retryable failure.
#[derive(Debug)]
pub enum EndpointSelector {
    Single(SingleSelector),
    Random(RandomSelector),
    Priority(PrioritySelector),
    LowestLatency(LowestLatencySelector),
}

impl EndpointSelector {
    pub fn name(&self) -> &str {
        match self {
            EndpointSelector::Single(s) => &s.name,
            EndpointSelector::Random(s) => s.name(),
            EndpointSelector::Priority(s) => s.name(),
            EndpointSelector::LowestLatency(s) => s.name(),
        }
    }

    /// Boxed so nested selectors can recurse through `RouteTarget::dispatch`.
    pub fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        call: &'a CallDetails,
        last_chance: bool,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayResponse, AttemptError>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                EndpointSelector::Single(s) => s.handle(ctx, call, last_chance).await,
                EndpointSelector::Random(s) => s.handle(ctx, call, last_chance).await,
                EndpointSelector::Priority(s) => s.handle(ctx, call, last_chance).await,
                EndpointSelector::LowestLatency(s) => s.handle(ctx, call, last_chance).await,
            }
        })
    }

    /// Flattened leaf endpoints, never adapter wrappers.
    pub fn contained_endpoints(&self) -> Vec<Arc<EndpointDispatcher>> {
        let mut leaves = Vec::new();
        let targets: Vec<&RouteTarget> = match self {
            EndpointSelector::Single(s) => vec![&s.target],
            EndpointSelector::Random(s) => s.targets().iter().collect(),
            EndpointSelector::Priority(s) => s.targets(),
            EndpointSelector::LowestLatency(s) => s.targets().iter().collect(),
        };
        for target in targets {
            target.collect_leaves(&mut leaves);
        }
        leaves
    }
}

/// Moves the candidate containing the preferred endpoint (if any) to the
/// front of an already-ordered candidate list.
pub(crate) fn prefer(order: &mut Vec<usize>, targets: &[RouteTarget], call: &CallDetails) {
    let Some(preferred) = call.preferred_endpoint.as_deref() else {
        return;
    };
    let Some(pos) = order
        .iter()
        .position(|&idx| targets[idx].contains_leaf(preferred))
    else {
        return;
    };
    let idx = order.remove(pos);
    order.insert(0, idx);
}

/// Tries candidates in the given order. Every non-final candidate runs with
/// `last_chance = false`; the final one inherits the caller's flag, so a
/// failure there either propagates (nested selector) or becomes the client's
/// answer (top level).
pub(crate) async fn try_in_order(
    ctx: &RequestContext,
    call: &CallDetails,
    targets: &[RouteTarget],
    order: &[usize],
    last_chance: bool,
) -> Result<GatewayResponse, AttemptError> {
    let mut last_error: Option<AttemptError> = None;
    for (position, &idx) in order.iter().enumerate() {
        let is_final = position + 1 == order.len();
        let target = &targets[idx];
        match target.dispatch(ctx, call, last_chance && is_final).await {
            Ok(response) => return Ok(response),
            Err(err) if is_final => return Err(err),
            Err(err) => last_error = Some(err),
        }
    }
    // Unreachable with a non-empty order; kept for the degenerate case.
    Err(last_error.unwrap_or_else(|| {
        AttemptError::new("(none)", aicentral_endpoint::FailureKind::BreakerOpen)
    }))
}
