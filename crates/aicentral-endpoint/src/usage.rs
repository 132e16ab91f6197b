use std::net::IpAddr;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::info;

use aicentral_common::ClientIdentity;
use aicentral_protocol::CallKind;

/// Terminal accounting record for one pipeline execution.
///
/// Exactly one is produced per top-level request, however many candidates were
/// tried along the way. Rate-limit steps read the token fields; usage sinks
/// get the whole record.
#[derive(Debug, Clone)]
pub struct DownstreamUsage {
    /// Endpoint that produced the relayed response; `None` when the request
    /// never reached a backend (auth/rate-limit/shape rejections).
    pub endpoint: Option<String>,
    pub host: Option<String>,
    /// Model the backend reported, falling back to the mapped name.
    pub model: Option<String>,
    /// Deployment/model name the client asked for.
    pub deployment: Option<String>,
    pub client: Option<ClientIdentity>,
    pub kind: CallKind,
    pub streaming: bool,
    pub prompt: Option<String>,
    pub response_text: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// True when the token counts were estimated by the gateway rather than
    /// reported by the backend.
    pub estimated: bool,
    pub remote_addr: Option<IpAddr>,
    pub started_at: OffsetDateTime,
    pub duration: Duration,
    pub success: bool,
}

impl DownstreamUsage {
    /// Record for a request the pipeline rejected before any dispatch.
    pub fn short_circuit(
        kind: CallKind,
        deployment: Option<String>,
        client: Option<ClientIdentity>,
        remote_addr: Option<IpAddr>,
    ) -> Self {
        Self {
            endpoint: None,
            host: None,
            model: None,
            deployment,
            client,
            kind,
            streaming: false,
            prompt: None,
            response_text: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            estimated: false,
            remote_addr,
            started_at: OffsetDateTime::now_utc(),
            duration: Duration::ZERO,
            success: false,
        }
    }

    /// Tokens consumed by this call, for token-based rate limiting. Prefers
    /// the reported total, then the sum of parts.
    pub fn consumed_tokens(&self) -> u64 {
        if let Some(total) = self.total_tokens {
            return total;
        }
        self.prompt_tokens.unwrap_or(0) + self.completion_tokens.unwrap_or(0)
    }
}

/// Where completed usage records go. Audit pipelines, cost meters, and log
/// shippers implement this; the gateway core only calls it.
pub trait UsageSink: Send + Sync {
    fn record(&self, usage: &DownstreamUsage);
}

#[derive(Debug, Default)]
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _usage: &DownstreamUsage) {}
}

/// Emits each usage record as a structured tracing event.
#[derive(Debug, Default)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, usage: &DownstreamUsage) {
        info!(
            event = "downstream_usage",
            endpoint = usage.endpoint.as_deref().unwrap_or("-"),
            host = usage.host.as_deref().unwrap_or("-"),
            model = usage.model.as_deref().unwrap_or("-"),
            deployment = usage.deployment.as_deref().unwrap_or("-"),
            client = usage.client.as_ref().map(|c| c.name.as_str()).unwrap_or("-"),
            kind = usage.kind.as_str(),
            streaming = usage.streaming,
            prompt_tokens = usage.prompt_tokens.unwrap_or(0),
            completion_tokens = usage.completion_tokens.unwrap_or(0),
            total_tokens = usage.consumed_tokens(),
            estimated = usage.estimated,
            elapsed_ms = usage.duration.as_millis() as u64,
            success = usage.success
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumed_tokens_prefers_reported_total() {
        let mut usage = DownstreamUsage::short_circuit(CallKind::Chat, None, None, None);
        usage.prompt_tokens = Some(10);
        usage.completion_tokens = Some(5);
        assert_eq!(usage.consumed_tokens(), 15);
        usage.total_tokens = Some(40);
        assert_eq!(usage.consumed_tokens(), 40);
    }

    #[test]
    fn short_circuit_records_are_unsuccessful() {
        let usage = DownstreamUsage::short_circuit(CallKind::Embeddings, None, None, None);
        assert!(!usage.success);
        assert_eq!(usage.endpoint, None);
        assert_eq!(usage.consumed_tokens(), 0);
    }
}
