//! Downstream endpoint layer for aicentral.
//!
//! An `EndpointDispatcher` owns one configured backend: it builds the outgoing
//! request, applies endpoint auth, sends through a per-endpoint resiliency
//! strategy, and relays the response back to the client. Selection between
//! dispatchers lives one layer up, in `aicentral-pipeline`.

pub mod auth;
pub mod backoff;
pub mod call;
pub mod client;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod relay;
pub mod resilience;
pub mod usage;

pub use auth::{ApiKeyAuth, AuthHandler, BearerTokenAuth, PassThroughAuth};
pub use backoff::BackoffTracker;
pub use call::{CallBody, CallDetails, FormPart};
pub use client::{
    RequestBody, TransportError, TransportErrorKind, UpstreamBody, UpstreamClient,
    UpstreamClientConfig, UpstreamMethod, UpstreamRequest, UpstreamResponse, WreqUpstreamClient,
};
pub use context::{ClientSink, InboundAuth, RequestContext, ResponseHead};
pub use dispatch::{EndpointDispatcher, EndpointFlavor, EndpointSettings};
pub use error::{AttemptError, FailureKind};
pub use headers::{
    AFFINITY_HEADER, AFFINITY_QUERY_PARAM, FAILED_SERVERS_HEADER, Headers,
    REMAINING_REQUESTS_HEADER, REMAINING_TOKENS_HEADER, ResponseMetadata, SERVER_HEADER,
    extract_metadata, header_get, header_remove, header_set, headers_to_map, retry_after,
};
pub use relay::{ClientResult, DispatchAttempt, GatewayResponse, ResponseRelay};
pub use resilience::{
    BreakerConfig, Bulkhead, CircuitBreaker, ResilienceError, ResiliencyConfig, ResiliencyStrategy,
};
pub use usage::{DownstreamUsage, NoopUsageSink, TracingUsageSink, UsageSink};
