#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use aicentral_common::ClientIdentity;
use aicentral_endpoint::{
    BackoffTracker, BreakerConfig, CallBody, CallDetails, ClientSink, EndpointDispatcher,
    EndpointFlavor, EndpointSettings, Headers, InboundAuth, PassThroughAuth, RequestContext,
    ResiliencyConfig, ResponseHead, TransportError, TransportErrorKind, UpstreamBody,
    UpstreamClient, UpstreamRequest, UpstreamResponse,
};
use aicentral_protocol::{CallKind, TokenEstimator};

/// One scripted upstream exchange.
pub enum Scripted {
    Reply {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: Headers,
        chunks: Vec<Bytes>,
    },
    TransportError,
}

/// In-memory `UpstreamClient` that plays back a script and remembers what it
/// was asked to send.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(req);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Reply {
                    status,
                    headers,
                    body,
                }) => Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                }),
                Some(Scripted::Stream {
                    status,
                    headers,
                    chunks,
                }) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamResponse {
                        status,
                        headers,
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Some(Scripted::TransportError) | None => Err(TransportError {
                    kind: TransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                }),
            }
        })
    }
}

/// Resiliency tuned for tests: one attempt, no breaker interference.
pub fn fast_resilience() -> ResiliencyConfig {
    ResiliencyConfig {
        attempt_timeout: Duration::from_secs(5),
        retry_max_attempts: 1,
        retry_base_delay: Duration::from_millis(1),
        breaker: BreakerConfig {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(5),
            min_throughput: 1000,
            break_duration: Duration::from_secs(30),
        },
        max_concurrency: None,
        max_queue: 16,
    }
}

pub fn dispatcher(
    name: &str,
    client: Arc<ScriptedClient>,
    backoff: Arc<BackoffTracker>,
    resilience: ResiliencyConfig,
) -> EndpointDispatcher {
    EndpointDispatcher::new(
        EndpointSettings {
            name: name.to_string(),
            base_url: format!("https://{name}.example.com"),
            flavor: EndpointFlavor::OpenAi,
            model_map: std::collections::HashMap::new(),
            backoff_window: Duration::from_secs(15),
        },
        Arc::new(PassThroughAuth),
        client,
        resilience,
        backoff,
        Arc::new(TokenEstimator::new()),
    )
}

pub fn request_context() -> (
    RequestContext,
    tokio::sync::oneshot::Receiver<ResponseHead>,
    tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>,
) {
    let (sink, head_rx, body_rx) = ClientSink::channel();
    let ctx = RequestContext::new(
        aicentral_common::new_trace_id(),
        None,
        "gw.example.com".to_string(),
        InboundAuth::default(),
        sink,
    );
    (ctx, head_rx, body_rx)
}

pub fn chat_call(model: &str) -> CallDetails {
    CallDetails::new(
        CallKind::Chat,
        None,
        CallBody::Json(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hello there"}],
        })),
    )
    .with_client(ClientIdentity::new("c1", "client one"))
}

pub fn streaming_chat_call(model: &str) -> CallDetails {
    CallDetails::new(
        CallKind::Chat,
        None,
        CallBody::Json(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hello there"}],
            "stream": true,
        })),
    )
    .with_client(ClientIdentity::new("c1", "client one"))
}
