use std::io;
use std::net::IpAddr;
use std::sync::Mutex;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};

use crate::headers::{Headers, header_set};

/// Auth material presented by the inbound client, kept for the client-key
/// pipeline step and for pass-through endpoint auth.
#[derive(Debug, Clone, Default)]
pub struct InboundAuth {
    /// Key from `api-key`, `x-api-key`, or a bearer token.
    pub presented_key: Option<String>,
    /// Raw `Authorization` header, forwarded only by pass-through auth.
    pub authorization: Option<String>,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Write side of the client connection.
///
/// The HTTP layer holds the receiving halves: the head is sent exactly once
/// (buffered responses at the end of the pipeline, streamed responses as soon
/// as upstream headers arrive), then body chunks follow. A failed chunk send
/// means the client went away.
pub struct ClientSink {
    head: Mutex<Option<oneshot::Sender<ResponseHead>>>,
    body: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl ClientSink {
    pub fn channel() -> (
        Self,
        oneshot::Receiver<ResponseHead>,
        mpsc::Receiver<Result<Bytes, io::Error>>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(16);
        (
            Self {
                head: Mutex::new(Some(head_tx)),
                body: body_tx,
            },
            head_rx,
            body_rx,
        )
    }

    /// True if this was the first head and the client is still listening.
    pub fn send_head(&self, head: ResponseHead) -> bool {
        let sender = self.head.lock().ok().and_then(|mut guard| guard.take());
        match sender {
            Some(sender) => sender.send(head).is_ok(),
            None => false,
        }
    }

    pub fn head_sent(&self) -> bool {
        self.head
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// False when the client has disconnected.
    pub async fn send_chunk(&self, chunk: Bytes) -> bool {
        self.body.send(Ok(chunk)).await.is_ok()
    }
}

impl std::fmt::Debug for ClientSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSink")
            .field("head_sent", &self.head_sent())
            .finish()
    }
}

/// Per-request state shared by every step and the dispatchers.
///
/// `annotations` collects response headers staged by steps before the head is
/// written; `failed_endpoints` accumulates every candidate that returned a
/// retryable failure, surfaced to the client as `x-aicentral-failed-servers`.
#[derive(Debug)]
pub struct RequestContext {
    pub trace_id: String,
    pub remote_addr: Option<IpAddr>,
    /// Host clients use to reach this gateway; polling locations are rewritten
    /// against it.
    pub gateway_host: String,
    pub inbound_auth: InboundAuth,
    pub sink: ClientSink,
    annotations: Mutex<Headers>,
    failed_endpoints: Mutex<Vec<String>>,
}

impl RequestContext {
    pub fn new(
        trace_id: String,
        remote_addr: Option<IpAddr>,
        gateway_host: String,
        inbound_auth: InboundAuth,
        sink: ClientSink,
    ) -> Self {
        Self {
            trace_id,
            remote_addr,
            gateway_host,
            inbound_auth,
            sink,
            annotations: Mutex::new(Headers::new()),
            failed_endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn annotate(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut guard) = self.annotations.lock() {
            header_set(&mut guard, name, value);
        }
    }

    pub fn annotations(&self) -> Headers {
        self.annotations
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn record_failed(&self, endpoint: &str) {
        if let Ok(mut guard) = self.failed_endpoints.lock() {
            if !guard.iter().any(|name| name == endpoint) {
                guard.push(endpoint.to_string());
            }
        }
    }

    pub fn failed_endpoints(&self) -> Vec<String> {
        self.failed_endpoints
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}
