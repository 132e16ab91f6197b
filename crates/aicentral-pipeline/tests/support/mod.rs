#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use aicentral_common::ClientIdentity;
use aicentral_endpoint::{
    BackoffTracker, BreakerConfig, CallBody, CallDetails, ClientSink, EndpointDispatcher,
    EndpointFlavor, EndpointSettings, InboundAuth, PassThroughAuth, RequestContext,
    ResiliencyConfig, ResponseHead, TransportError, TransportErrorKind, UpstreamBody,
    UpstreamClient, UpstreamRequest, UpstreamResponse,
};
use aicentral_protocol::{CallKind, TokenEstimator};

/// How a test backend behaves for every request it receives.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// 200 with a usage-bearing chat body, after an artificial delay.
    Healthy { delay: Duration, total_tokens: u64 },
    /// Fixed non-success status.
    Status(u16),
    /// Transport-level failure.
    Unreachable,
}

pub struct StaticClient {
    behavior: Behavior,
    pub calls: AtomicUsize,
}

impl StaticClient {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UpstreamClient for StaticClient {
    fn send<'a>(
        &'a self,
        _req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Healthy {
                    delay,
                    total_tokens,
                } => {
                    tokio::time::sleep(*delay).await;
                    let body = serde_json::json!({
                        "model": "gpt-4o",
                        "choices": [{"message": {"role": "assistant", "content": "ok"}}],
                        "usage": {
                            "prompt_tokens": total_tokens / 2,
                            "completion_tokens": total_tokens - total_tokens / 2,
                            "total_tokens": total_tokens
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "application/json".to_string(),
                        )],
                        body: UpstreamBody::Bytes(Bytes::from(body.to_string())),
                    })
                }
                Behavior::Status(status) => Ok(UpstreamResponse {
                    status: *status,
                    headers: vec![],
                    body: UpstreamBody::Bytes(Bytes::from_static(b"{}")),
                }),
                Behavior::Unreachable => Err(TransportError {
                    kind: TransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                }),
            }
        })
    }
}

fn quiet_resilience() -> ResiliencyConfig {
    ResiliencyConfig {
        attempt_timeout: Duration::from_secs(5),
        retry_max_attempts: 1,
        retry_base_delay: Duration::from_millis(1),
        breaker: BreakerConfig {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(5),
            min_throughput: 10_000,
            break_duration: Duration::from_secs(30),
        },
        max_concurrency: None,
        max_queue: 16,
    }
}

pub fn endpoint(name: &str, behavior: Behavior) -> (Arc<EndpointDispatcher>, Arc<StaticClient>) {
    let client = StaticClient::new(behavior);
    let dispatcher = EndpointDispatcher::new(
        EndpointSettings {
            name: name.to_string(),
            base_url: format!("https://{name}.example.com"),
            flavor: EndpointFlavor::OpenAi,
            model_map: std::collections::HashMap::new(),
            backoff_window: Duration::from_secs(15),
        },
        Arc::new(PassThroughAuth),
        client.clone(),
        quiet_resilience(),
        Arc::new(BackoffTracker::new(Duration::from_secs(15))),
        Arc::new(TokenEstimator::new()),
    );
    (Arc::new(dispatcher), client)
}

pub fn request_context() -> (
    RequestContext,
    tokio::sync::oneshot::Receiver<ResponseHead>,
    tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>,
) {
    request_context_with_key(None)
}

pub fn request_context_with_key(
    presented_key: Option<&str>,
) -> (
    RequestContext,
    tokio::sync::oneshot::Receiver<ResponseHead>,
    tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>,
) {
    let (sink, head_rx, body_rx) = ClientSink::channel();
    let ctx = RequestContext::new(
        aicentral_common::new_trace_id(),
        None,
        "gw.example.com".to_string(),
        InboundAuth {
            presented_key: presented_key.map(|key| key.to_string()),
            authorization: None,
        },
        sink,
    );
    (ctx, head_rx, body_rx)
}

pub fn chat_call(client_id: &str) -> CallDetails {
    CallDetails::new(
        CallKind::Chat,
        None,
        CallBody::Json(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hello"}],
        })),
    )
    .with_client(ClientIdentity::new(client_id, client_id))
}
