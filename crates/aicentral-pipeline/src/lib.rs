//! Request pipeline for aicentral.
//!
//! A pipeline is an ordered chain of steps (client auth, rate limiting,
//! affinity, anything cross-cutting) ending in an endpoint selector. Steps run
//! via continuation passing: each one may short-circuit with a response of its
//! own, or call `next` and post-process what comes back.

pub mod affinity;
pub mod client_auth;
pub mod pipeline;
pub mod rate_limit;
pub mod registry;
pub mod select;
pub mod step;

pub use affinity::AffinityStep;
pub use client_auth::{ClientKeyEntry, ClientKeyStep};
pub use pipeline::Pipeline;
pub use rate_limit::{FixedWindowRateLimiterStep, PartitionScope, TokenRateLimiterStep};
pub use registry::{GroupConfig, GroupStrategy, StepRegistry, build_selectors};
pub use select::{
    EndpointSelector, LowestLatencySelector, PrioritySelector, RandomSelector, RouteTarget,
    SingleSelector,
};
pub use step::{Next, PipelineStep};
