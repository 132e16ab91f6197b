use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use tracing::warn;

use aicentral_common::ClientIdentity;
use aicentral_endpoint::{CallDetails, DownstreamUsage, GatewayResponse, RequestContext};

use crate::step::{Next, PipelineStep};

#[derive(Debug, Clone, Deserialize)]
pub struct ClientKeyEntry {
    pub name: String,
    pub key: String,
}

/// First step of a pipeline: matches the presented gateway key against the
/// configured client list and stamps the call with the resulting identity.
/// Later steps partition rate limits and affinity by it.
///
/// Richer schemes (JWT, Entra) plug in as their own steps; only key matching
/// lives here.
#[derive(Debug)]
pub struct ClientKeyStep {
    clients: Vec<ClientKeyEntry>,
}

impl ClientKeyStep {
    pub fn new(clients: Vec<ClientKeyEntry>) -> Self {
        Self { clients }
    }

    fn resolve(&self, presented: &str) -> Option<ClientIdentity> {
        self.clients
            .iter()
            .find(|entry| entry.key == presented)
            .map(|entry| ClientIdentity::new(entry.name.clone(), entry.name.clone()))
    }
}

#[async_trait]
impl PipelineStep for ClientKeyStep {
    async fn handle(
        &self,
        ctx: &RequestContext,
        call: CallDetails,
        next: Next<'_>,
    ) -> GatewayResponse {
        let identity = ctx
            .inbound_auth
            .presented_key
            .as_deref()
            .and_then(|key| self.resolve(key));

        let Some(identity) = identity else {
            warn!(event = "client_rejected", trace_id = %ctx.trace_id);
            let usage = DownstreamUsage::short_circuit(
                call.kind,
                call.deployment.clone(),
                None,
                ctx.remote_addr,
            );
            return GatewayResponse::rejection(
                StatusCode::UNAUTHORIZED,
                HeaderMap::new(),
                "unknown or missing gateway key",
                usage,
            );
        };

        next.run(ctx, call.with_client(identity)).await
    }
}
