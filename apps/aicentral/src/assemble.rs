use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use aicentral_common::{ConfigError, ServerConfig};
use aicentral_endpoint::{
    ApiKeyAuth, AuthHandler, BackoffTracker, BearerTokenAuth, BreakerConfig, EndpointDispatcher,
    EndpointFlavor, EndpointSettings, PassThroughAuth, ResiliencyConfig, TracingUsageSink,
    UpstreamClientConfig, WreqUpstreamClient,
};
use aicentral_pipeline::{
    EndpointSelector, Pipeline, PipelineStep, RouteTarget, SingleSelector, StepRegistry,
    build_selectors,
};
use aicentral_protocol::TokenEstimator;

use crate::config::{AuthEntry, EndpointEntry, FileConfig, Flavor};

/// Everything the serve loop needs, constructed once at startup. All
/// configuration problems surface here, before the listener binds.
pub(crate) struct Gateway {
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) server: ServerConfig,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("pipeline", &self.pipeline.name())
            .field("server", &self.server)
            .finish()
    }
}

pub(crate) fn assemble(config: FileConfig, server: ServerConfig) -> Result<Gateway, ConfigError> {
    let estimator = Arc::new(TokenEstimator::new());
    let backoff = Arc::new(BackoffTracker::new(Duration::from_secs(15)));

    let mut endpoints: HashMap<String, Arc<EndpointDispatcher>> = HashMap::new();
    for entry in &config.endpoints {
        let dispatcher = build_endpoint(entry, backoff.clone(), estimator.clone())?;
        info!(
            event = "endpoint_ready",
            endpoint = %entry.name,
            host = %dispatcher.host()
        );
        if endpoints
            .insert(entry.name.clone(), Arc::new(dispatcher))
            .is_some()
        {
            return Err(ConfigError::Invalid(
                "endpoint",
                format!("duplicate endpoint name {}", entry.name),
            ));
        }
    }
    if endpoints.is_empty() {
        return Err(ConfigError::MissingField("endpoints"));
    }

    let groups = build_selectors(&config.groups, &endpoints)?;

    let selector = match groups.get(&config.pipeline.selector) {
        Some(selector) => selector.clone(),
        None => {
            let endpoint = endpoints
                .get(&config.pipeline.selector)
                .ok_or_else(|| ConfigError::UnknownReference(config.pipeline.selector.clone()))?;
            Arc::new(EndpointSelector::Single(SingleSelector::new(
                config.pipeline.selector.clone(),
                RouteTarget::Leaf(endpoint.clone()),
            )))
        }
    };

    let registry = StepRegistry::with_defaults();
    let mut steps: Vec<Arc<dyn PipelineStep>> = Vec::new();
    for step_config in &config.pipeline.steps {
        let type_name = step_config
            .get("type")
            .and_then(|value| value.as_str())
            .ok_or(ConfigError::MissingField("pipeline.steps[].type"))?;
        steps.push(registry.build(type_name, step_config)?);
        info!(event = "step_ready", step = %type_name);
    }

    let pipeline = Pipeline::new(
        config.pipeline.name.clone(),
        steps,
        selector,
        Arc::new(TracingUsageSink),
    );

    Ok(Gateway {
        pipeline: Arc::new(pipeline),
        server,
    })
}

fn build_endpoint(
    entry: &EndpointEntry,
    backoff: Arc<BackoffTracker>,
    estimator: Arc<TokenEstimator>,
) -> Result<EndpointDispatcher, ConfigError> {
    let flavor = match entry.flavor {
        Flavor::AzureOpenai => {
            let api_version = entry
                .api_version
                .clone()
                .ok_or(ConfigError::MissingField("endpoint.api_version"))?;
            EndpointFlavor::AzureOpenAi { api_version }
        }
        Flavor::Openai => EndpointFlavor::OpenAi,
    };

    let auth: Arc<dyn AuthHandler> = match &entry.auth {
        AuthEntry::ApiKey { key } => Arc::new(ApiKeyAuth::new(key.clone())),
        AuthEntry::BearerToken { token } => Arc::new(BearerTokenAuth::new(token.clone())),
        AuthEntry::PassThrough => Arc::new(PassThroughAuth),
    };

    // One physical client per endpoint, keyed by its identity, so connection
    // pools and egress proxies never bleed across backends.
    let client = WreqUpstreamClient::new(UpstreamClientConfig {
        proxy: entry.proxy.clone(),
        ..UpstreamClientConfig::default()
    })
    .map_err(|err| ConfigError::Invalid("endpoint", err.to_string()))?;

    let resilience = ResiliencyConfig {
        attempt_timeout: Duration::from_secs(entry.attempt_timeout_seconds),
        retry_max_attempts: entry.retry_max_attempts.max(1),
        retry_base_delay: Duration::from_millis(entry.retry_base_delay_ms),
        breaker: BreakerConfig {
            failure_ratio: entry.breaker.failure_ratio,
            sampling_window: Duration::from_secs(entry.breaker.sampling_window_seconds),
            min_throughput: entry.breaker.min_throughput,
            break_duration: Duration::from_secs(entry.breaker.break_seconds),
        },
        max_concurrency: entry.max_concurrency,
        max_queue: entry.max_queue,
    };

    Ok(EndpointDispatcher::new(
        EndpointSettings {
            name: entry.name.clone(),
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            flavor,
            model_map: entry.model_map.clone(),
            backoff_window: Duration::from_secs(entry.backoff_seconds),
        },
        auth,
        Arc::new(client),
        resilience,
        backoff,
        estimator,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aicentral_common::ServerConfigPatch;

    fn minimal_config(selector: &str) -> FileConfig {
        serde_json::from_value(serde_json::json!({
            "endpoints": [{
                "name": "east",
                "base_url": "https://east.example.com",
                "flavor": "openai",
                "auth": {"type": "bearer-token", "token": "t"}
            }],
            "groups": [
                {"name": "main", "strategy": "single", "member": "east"}
            ],
            "pipeline": {"selector": selector, "steps": []}
        }))
        .unwrap()
    }

    fn server() -> ServerConfig {
        ServerConfigPatch::default().into_config().unwrap()
    }

    #[test]
    fn assembles_a_minimal_gateway() {
        let gateway = assemble(minimal_config("main"), server()).unwrap();
        assert_eq!(gateway.pipeline.name(), "main");
    }

    #[test]
    fn a_bare_endpoint_can_terminate_the_pipeline() {
        assert!(assemble(minimal_config("east"), server()).is_ok());
    }

    #[test]
    fn unknown_selector_reference_fails_fast() {
        let err = assemble(minimal_config("nope"), server()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference(_)));
    }

    #[test]
    fn azure_endpoints_require_an_api_version() {
        let config: FileConfig = serde_json::from_value(serde_json::json!({
            "endpoints": [{
                "name": "east",
                "base_url": "https://east.openai.azure.com",
                "flavor": "azure-openai",
                "auth": {"type": "api-key", "key": "k"}
            }],
            "pipeline": {"selector": "east", "steps": []}
        }))
        .unwrap();
        let err = assemble(config, server()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("endpoint.api_version")));
    }

    #[test]
    fn unknown_step_type_fails_fast() {
        let mut config = minimal_config("main");
        config.pipeline.steps = vec![serde_json::json!({"type": "no-such-step"})];
        let err = assemble(config, server()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType { .. }));
    }
}
