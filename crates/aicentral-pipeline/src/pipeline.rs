use std::sync::Arc;
use std::time::Instant;

use http::{HeaderName, HeaderValue};
use tracing::{info, warn};

use aicentral_endpoint::{
    AFFINITY_HEADER, CallDetails, ClientResult, DownstreamUsage, FAILED_SERVERS_HEADER,
    GatewayResponse, RequestContext, ResponseHead, SERVER_HEADER, UsageSink,
};

use crate::select::EndpointSelector;
use crate::step::{Next, PipelineStep};

/// Terminal link of the chain: hands the call to the endpoint selector with
/// `last_chance = true`, so the client is guaranteed an answer.
pub struct SelectorAdapter {
    selector: Arc<EndpointSelector>,
}

impl SelectorAdapter {
    pub(crate) async fn execute(&self, ctx: &RequestContext, call: CallDetails) -> GatewayResponse {
        match self.selector.handle(ctx, &call, true).await {
            Ok(response) => response,
            Err(err) => {
                // Selectors must answer on the last chance; this is the
                // belt-and-braces path for an empty candidate set.
                warn!(
                    event = "selector_exhausted",
                    trace_id = %ctx.trace_id,
                    error = %err
                );
                let usage = DownstreamUsage::short_circuit(
                    call.kind,
                    call.deployment.clone(),
                    call.client.clone(),
                    ctx.remote_addr,
                );
                GatewayResponse::rejection(
                    err.status_hint(),
                    http::HeaderMap::new(),
                    "no endpoint could serve the request",
                    usage,
                )
            }
        }
    }
}

/// The ordered step chain plus its terminal selector. One `execute` produces
/// exactly one client response and exactly one usage record.
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn PipelineStep>>,
    adapter: SelectorAdapter,
    usage_sink: Arc<dyn UsageSink>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Arc<dyn PipelineStep>>,
        selector: Arc<EndpointSelector>,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            name: name.into(),
            steps,
            adapter: SelectorAdapter { selector },
            usage_sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn execute(&self, ctx: &RequestContext, call: CallDetails) -> GatewayResponse {
        let started = Instant::now();
        let kind = call.kind;

        let response = Next {
            steps: &self.steps,
            terminal: &self.adapter,
        }
        .run(ctx, call)
        .await;

        let response = self.finalize(ctx, response).await;

        info!(
            event = "pipeline_complete",
            trace_id = %ctx.trace_id,
            pipeline = %self.name,
            kind = kind.as_str(),
            status = response.status().as_u16(),
            endpoint = response.usage.endpoint.as_deref().unwrap_or("-"),
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        self.usage_sink.record(&response.usage);

        response
    }

    /// Buffered responses are written here, after every step has had its
    /// post-processing turn; streamed responses went out through the sink
    /// already and only get accounted.
    async fn finalize(&self, ctx: &RequestContext, response: GatewayResponse) -> GatewayResponse {
        let ClientResult::Buffered {
            status,
            headers,
            body,
        } = &response.result
        else {
            return response;
        };

        let mut headers = headers.clone();
        for (name, value) in ctx.annotations() {
            insert_header(&mut headers, &name, &value);
        }
        if let Some(endpoint) = response.usage.endpoint.as_deref() {
            insert_header(&mut headers, SERVER_HEADER, endpoint);
        }
        let failed = ctx.failed_endpoints();
        if !failed.is_empty() {
            insert_header(&mut headers, FAILED_SERVERS_HEADER, &failed.join(","));
        }
        if let Some(endpoint) = response.affinity_endpoint.as_deref() {
            insert_header(&mut headers, AFFINITY_HEADER, endpoint);
        }

        ctx.sink.send_head(ResponseHead {
            status: *status,
            headers,
        });
        ctx.sink.send_chunk(body.clone()).await;

        response
    }
}

fn insert_header(map: &mut http::HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        map.insert(name, value);
    }
}
