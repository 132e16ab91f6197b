use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::debug;

use aicentral_common::ClientIdentity;
use aicentral_protocol::{CallKind, SseScanner, TokenEstimator, usage as usage_payload};

use crate::context::{RequestContext, ResponseHead};
use crate::headers::{
    AFFINITY_HEADER, FAILED_SERVERS_HEADER, ResponseMetadata, SERVER_HEADER, header_set,
    headers_to_map,
};
use crate::usage::DownstreamUsage;

/// Per-attempt dispatch record: everything the relay needs to turn a raw
/// response into a usage record without reaching back into the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    pub endpoint: String,
    pub host: String,
    pub kind: CallKind,
    pub deployment: Option<String>,
    pub mapped_model: Option<String>,
    pub prompt: Option<String>,
    pub client: Option<ClientIdentity>,
    pub remote_addr: Option<IpAddr>,
    pub started_at: OffsetDateTime,
    pub started_instant: Instant,
}

impl DispatchAttempt {
    pub fn usage_base(&self, streaming: bool, success: bool) -> DownstreamUsage {
        DownstreamUsage {
            endpoint: Some(self.endpoint.clone()),
            host: Some(self.host.clone()),
            model: self.mapped_model.clone(),
            deployment: self.deployment.clone(),
            client: self.client.clone(),
            kind: self.kind,
            streaming,
            prompt: self.prompt.clone(),
            response_text: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            estimated: false,
            remote_addr: self.remote_addr,
            started_at: self.started_at,
            duration: self.started_instant.elapsed(),
            success,
        }
    }
}

/// How the client gets its answer.
#[derive(Debug)]
pub enum ClientResult {
    /// Not yet written; the pipeline finalizer sends it after post-processing
    /// so steps can still adjust headers.
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Already relayed chunk-by-chunk through the client sink.
    Streamed { status: StatusCode },
}

/// The single value a pipeline execution produces: the usage record paired
/// with the client-facing result.
#[derive(Debug)]
pub struct GatewayResponse {
    pub usage: DownstreamUsage,
    pub result: ClientResult,
    /// Endpoint follow-up requests must stick to, when the response points at
    /// a polling location.
    pub affinity_endpoint: Option<String>,
}

impl GatewayResponse {
    pub fn rejection(status: StatusCode, headers: HeaderMap, message: &str, usage: DownstreamUsage) -> Self {
        let body = serde_json::json!({"error": {"message": message}});
        Self {
            usage,
            result: ClientResult::Buffered {
                status,
                headers,
                body: Bytes::from(body.to_string()),
            },
            affinity_endpoint: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.result {
            ClientResult::Buffered { status, .. } => *status,
            ClientResult::Streamed { status } => *status,
        }
    }
}

/// Turns a raw downstream response into a `(usage, client result)` pair.
pub struct ResponseRelay {
    estimator: Arc<TokenEstimator>,
}

impl ResponseRelay {
    pub fn new(estimator: Arc<TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// Buffered path: the whole body is in hand. 2xx responses contribute
    /// reported token counts; anything else is replayed verbatim with an
    /// unsuccessful usage record so accounting still runs.
    pub fn buffered(
        &self,
        attempt: &DispatchAttempt,
        status: u16,
        metadata: &ResponseMetadata,
        body: Bytes,
    ) -> GatewayResponse {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut usage = attempt.usage_base(false, status.is_success());

        if status.is_success() {
            let (model, payload) = usage_payload::extract_usage(&body);
            if model.is_some() {
                usage.model = model;
            }
            usage.prompt_tokens = payload.prompt_tokens;
            usage.completion_tokens = payload.completion_tokens;
            usage.total_tokens = payload.total_tokens;
            usage.response_text = usage_payload::completion_text(&body);
        }

        GatewayResponse {
            usage,
            result: ClientResult::Buffered {
                status,
                headers: headers_to_map(&metadata.sanitized),
                body,
            },
            affinity_endpoint: metadata
                .requires_affinity
                .then(|| attempt.endpoint.clone()),
        }
    }

    /// Streaming path: every chunk is forwarded to the client the moment it
    /// arrives, while an SSE scanner watches the same bytes for the model name
    /// and assistant text. Token counts are estimated after the stream ends;
    /// estimation problems never fail the request.
    pub async fn streamed(
        &self,
        ctx: &RequestContext,
        attempt: &DispatchAttempt,
        status: u16,
        metadata: &ResponseMetadata,
        mut body: mpsc::Receiver<Bytes>,
    ) -> GatewayResponse {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);

        let mut head_headers = metadata.sanitized.clone();
        if !head_headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        {
            header_set(&mut head_headers, "content-type", "text/event-stream");
        }
        for (name, value) in ctx.annotations() {
            header_set(&mut head_headers, name, value);
        }
        header_set(&mut head_headers, SERVER_HEADER, attempt.endpoint.clone());
        let failed = ctx.failed_endpoints();
        if !failed.is_empty() {
            header_set(&mut head_headers, FAILED_SERVERS_HEADER, failed.join(","));
        }
        if metadata.requires_affinity {
            header_set(&mut head_headers, AFFINITY_HEADER, attempt.endpoint.clone());
        }

        ctx.sink.send_head(ResponseHead {
            status,
            headers: headers_to_map(&head_headers),
        });

        let mut scanner = SseScanner::new();
        while let Some(chunk) = body.recv().await {
            scanner.push_bytes(&chunk);
            if !ctx.sink.send_chunk(chunk).await {
                debug!(event = "client_disconnected", trace_id = %ctx.trace_id);
                break;
            }
        }
        let summary = scanner.finish();

        let model = summary
            .model
            .clone()
            .or_else(|| attempt.mapped_model.clone());
        let prompt_tokens = attempt
            .prompt
            .as_deref()
            .map(|prompt| self.estimator.estimate(model.as_deref(), prompt));
        let completion_tokens = self
            .estimator
            .estimate(model.as_deref(), &summary.content);

        let mut usage = attempt.usage_base(true, status.is_success());
        usage.model = model;
        usage.response_text = Some(summary.content);
        usage.prompt_tokens = prompt_tokens;
        usage.completion_tokens = Some(completion_tokens);
        usage.estimated = true;

        GatewayResponse {
            usage,
            result: ClientResult::Streamed { status },
            affinity_endpoint: metadata
                .requires_affinity
                .then(|| attempt.endpoint.clone()),
        }
    }
}

impl std::fmt::Debug for ResponseRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRelay").finish()
    }
}
