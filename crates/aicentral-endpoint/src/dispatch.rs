use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use aicentral_protocol::{TokenEstimator, usage as usage_payload};

use crate::auth::AuthHandler;
use crate::backoff::BackoffTracker;
use crate::call::{CallBody, CallDetails, FormPart};
use crate::client::{
    RequestBody, UpstreamBody, UpstreamClient, UpstreamMethod, UpstreamRequest,
};
use crate::context::RequestContext;
use crate::error::{AttemptError, FailureKind};
use crate::headers::{Headers, extract_metadata, header_set, headers_to_map, retry_after};
use crate::relay::{DispatchAttempt, GatewayResponse, ResponseRelay};
use crate::resilience::{ResilienceError, ResiliencyConfig, ResiliencyStrategy};

/// Which vendor wire shape the downstream endpoint speaks.
#[derive(Debug, Clone)]
pub enum EndpointFlavor {
    /// Deployment in the path, `api-key` auth, `api-version` query parameter.
    AzureOpenAi { api_version: String },
    /// Model in the body, bearer auth, `/v1` paths.
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub name: String,
    /// Scheme + host (+ optional port), no trailing slash.
    pub base_url: String,
    pub flavor: EndpointFlavor,
    /// Requested name -> downstream deployment/model. Empty map forwards
    /// names unchanged; a missing entry in a non-empty map is a 404.
    pub model_map: HashMap<String, String>,
    /// Backoff applied after a 429 without `Retry-After`.
    pub backoff_window: Duration,
}

impl EndpointSettings {
    pub fn host(&self) -> String {
        let rest = match self.base_url.find("://") {
            Some(idx) => &self.base_url[idx + 3..],
            None => self.base_url.as_str(),
        };
        rest.split('/').next().unwrap_or(rest).to_string()
    }
}

/// Owns one downstream backend: request building, endpoint auth, the
/// resiliency strategy around the physical call, and the response relay.
pub struct EndpointDispatcher {
    id: Uuid,
    settings: EndpointSettings,
    host: String,
    auth: Arc<dyn AuthHandler>,
    client: Arc<dyn UpstreamClient>,
    resilience: ResiliencyStrategy,
    backoff: Arc<BackoffTracker>,
    relay: ResponseRelay,
}

impl EndpointDispatcher {
    pub fn new(
        settings: EndpointSettings,
        auth: Arc<dyn AuthHandler>,
        client: Arc<dyn UpstreamClient>,
        resilience: ResiliencyConfig,
        backoff: Arc<BackoffTracker>,
        estimator: Arc<TokenEstimator>,
    ) -> Self {
        let host = settings.host();
        let resilience = ResiliencyStrategy::new(&settings.name, resilience);
        Self {
            id: Uuid::new_v4(),
            host,
            auth,
            client,
            resilience,
            backoff,
            relay: ResponseRelay::new(estimator),
            settings,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// One full attempt against this backend. Retryable failures come back as
    /// `AttemptError` values for the selector loop — unless this is the last
    /// chance, in which case the client always gets a response, synthesized
    /// if nothing better exists.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        call: &CallDetails,
        last_chance: bool,
    ) -> Result<GatewayResponse, AttemptError> {
        let mapped_model = match self.resolve_model(call) {
            Ok(mapped) => mapped,
            Err(requested) => {
                warn!(
                    event = "model_not_mapped",
                    trace_id = %ctx.trace_id,
                    endpoint = %self.settings.name,
                    model = %requested
                );
                return Ok(self.not_found(call, &requested));
            }
        };

        if let Some(remaining) = self.backoff.active(&self.host) {
            if last_chance {
                return Ok(self.rate_limited(call, remaining));
            }
            return Err(self.fail(ctx, FailureKind::BackoffActive {
                retry_after: remaining,
            }));
        }

        let attempt = DispatchAttempt {
            endpoint: self.settings.name.clone(),
            host: self.host.clone(),
            kind: call.kind,
            deployment: call.deployment.clone(),
            mapped_model: mapped_model.clone(),
            prompt: call.prompt_text(),
            client: call.client.clone(),
            remote_addr: ctx.remote_addr,
            started_at: OffsetDateTime::now_utc(),
            started_instant: Instant::now(),
        };

        let request = self.build_request(ctx, call, mapped_model.as_deref());
        info!(
            event = "dispatch",
            trace_id = %ctx.trace_id,
            endpoint = %self.settings.name,
            host = %self.host,
            kind = call.kind.as_str(),
            model = mapped_model.as_deref().unwrap_or("-"),
            stream = request.want_stream,
            last_chance = last_chance
        );

        let response = match self.resilience.execute(self.client.as_ref(), request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    event = "dispatch_failed",
                    trace_id = %ctx.trace_id,
                    endpoint = %self.settings.name,
                    elapsed_ms = attempt.started_instant.elapsed().as_millis() as u64,
                    error = %describe(&err)
                );
                let kind = match err {
                    ResilienceError::BreakerOpen => FailureKind::BreakerOpen,
                    ResilienceError::BulkheadFull => FailureKind::BulkheadFull,
                    ResilienceError::Transport(err) => FailureKind::Transport(err),
                };
                if last_chance {
                    return Ok(self.terminal_failure(&attempt, kind));
                }
                return Err(self.fail(ctx, kind));
            }
        };

        info!(
            event = "dispatch_response",
            trace_id = %ctx.trace_id,
            endpoint = %self.settings.name,
            status = response.status,
            elapsed_ms = attempt.started_instant.elapsed().as_millis() as u64
        );

        if response.status == 429 {
            let window = retry_after(&response.headers);
            self.backoff.record(&self.host, window.or(Some(self.settings.backoff_window)));
        }

        if !response.is_success() && !last_chance {
            let body = match response.body {
                UpstreamBody::Bytes(bytes) => bytes,
                // Non-success responses are always buffered by the client.
                UpstreamBody::Stream(_) => bytes::Bytes::new(),
            };
            return Err(self.fail(ctx, FailureKind::Upstream {
                status: response.status,
                headers: response.headers,
                body,
            }));
        }

        let metadata = extract_metadata(&response.headers, &self.settings.name, &ctx.gateway_host);
        match response.body {
            UpstreamBody::Stream(rx) => Ok(self
                .relay
                .streamed(ctx, &attempt, response.status, &metadata, rx)
                .await),
            UpstreamBody::Bytes(bytes) => {
                Ok(self.relay.buffered(&attempt, response.status, &metadata, bytes))
            }
        }
    }

    fn resolve_model(&self, call: &CallDetails) -> Result<Option<String>, String> {
        if !call.kind.requires_model() {
            return Ok(call.deployment.clone());
        }
        let Some(requested) = call.deployment.as_deref() else {
            return Err("(none)".to_string());
        };
        if self.settings.model_map.is_empty() {
            return Ok(Some(requested.to_string()));
        }
        match self.settings.model_map.get(requested) {
            Some(mapped) if !mapped.is_empty() => Ok(Some(mapped.clone())),
            _ => Err(requested.to_string()),
        }
    }

    fn build_request(
        &self,
        ctx: &RequestContext,
        call: &CallDetails,
        mapped_model: Option<&str>,
    ) -> UpstreamRequest {
        let suffix = call.kind.path_suffix();
        let url = match &self.settings.flavor {
            EndpointFlavor::AzureOpenAi { api_version } => {
                let deployment = mapped_model.unwrap_or("_");
                let query = call
                    .query
                    .clone()
                    .filter(|q| q.contains("api-version="))
                    .unwrap_or_else(|| format!("api-version={api_version}"));
                format!(
                    "{}/openai/deployments/{}/{}?{}",
                    self.settings.base_url, deployment, suffix, query
                )
            }
            EndpointFlavor::OpenAi => match &call.query {
                Some(query) => format!("{}/v1/{}?{}", self.settings.base_url, suffix, query),
                None => format!("{}/v1/{}", self.settings.base_url, suffix),
            },
        };

        let mut headers = Headers::new();
        let body = match &call.body {
            CallBody::Json(value) => {
                header_set(&mut headers, "content-type", "application/json");
                let bytes = match mapped_model {
                    Some(model) => usage_payload::inject_model(value, model),
                    None => serde_json::to_vec(value).unwrap_or_default(),
                };
                RequestBody::Bytes(bytes::Bytes::from(bytes))
            }
            CallBody::Multipart(parts) => RequestBody::Form(self.rebuild_form(parts, mapped_model)),
            CallBody::Empty => RequestBody::Empty,
        };

        self.auth.apply(ctx, &mut headers);

        UpstreamRequest {
            method: UpstreamMethod::Post,
            url,
            headers,
            body,
            want_stream: call.wants_stream(),
        }
    }

    fn rebuild_form(&self, parts: &[FormPart], mapped_model: Option<&str>) -> Vec<FormPart> {
        parts
            .iter()
            .map(|part| {
                if part.name == "model"
                    && let Some(model) = mapped_model
                {
                    return FormPart {
                        name: part.name.clone(),
                        filename: None,
                        content_type: None,
                        data: bytes::Bytes::from(model.to_string().into_bytes()),
                    };
                }
                part.clone()
            })
            .collect()
    }

    fn fail(&self, ctx: &RequestContext, kind: FailureKind) -> AttemptError {
        ctx.record_failed(&self.settings.name);
        AttemptError::new(self.settings.name.clone(), kind)
    }

    fn not_found(&self, call: &CallDetails, requested: &str) -> GatewayResponse {
        let usage = crate::usage::DownstreamUsage::short_circuit(
            call.kind,
            call.deployment.clone(),
            call.client.clone(),
            None,
        );
        GatewayResponse::rejection(
            StatusCode::NOT_FOUND,
            http::HeaderMap::new(),
            &format!("no downstream mapping for model {requested}"),
            usage,
        )
    }

    fn rate_limited(&self, call: &CallDetails, retry_after: Duration) -> GatewayResponse {
        let mut headers = Headers::new();
        header_set(
            &mut headers,
            "retry-after",
            retry_after.as_secs().max(1).to_string(),
        );
        let usage = crate::usage::DownstreamUsage::short_circuit(
            call.kind,
            call.deployment.clone(),
            call.client.clone(),
            None,
        );
        GatewayResponse::rejection(
            StatusCode::TOO_MANY_REQUESTS,
            headers_to_map(&headers),
            "backend is rate limited",
            usage,
        )
    }

    fn terminal_failure(&self, attempt: &DispatchAttempt, kind: FailureKind) -> GatewayResponse {
        let error = AttemptError::new(self.settings.name.clone(), kind);
        let usage = attempt.usage_base(false, false);
        GatewayResponse::rejection(
            error.status_hint(),
            http::HeaderMap::new(),
            &error.to_string(),
            usage,
        )
    }
}

impl std::fmt::Debug for EndpointDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDispatcher")
            .field("name", &self.settings.name)
            .field("host", &self.host)
            .finish()
    }
}

fn describe(err: &ResilienceError) -> String {
    match err {
        ResilienceError::BreakerOpen => "circuit open".to_string(),
        ResilienceError::BulkheadFull => "bulkhead full".to_string(),
        ResilienceError::Transport(err) => err.to_string(),
    }
}
