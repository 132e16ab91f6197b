use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use aicentral_common::ServerConfigPatch;
use aicentral_pipeline::GroupConfig;

/// Root of the JSON configuration file.
#[derive(Debug, Deserialize)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) server: ServerSection,
    pub(crate) endpoints: Vec<EndpointEntry>,
    #[serde(default)]
    pub(crate) groups: Vec<GroupConfig>,
    pub(crate) pipeline: PipelineSection,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ServerSection {
    pub(crate) host: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) public_host: Option<String>,
}

impl ServerSection {
    pub(crate) fn patch(&self) -> ServerConfigPatch {
        ServerConfigPatch {
            host: self.host.clone(),
            port: self.port,
            public_host: self.public_host.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Flavor {
    AzureOpenai,
    Openai,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum AuthEntry {
    ApiKey { key: String },
    BearerToken { token: String },
    PassThrough,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BreakerEntry {
    #[serde(default = "default_failure_ratio")]
    pub(crate) failure_ratio: f64,
    #[serde(default = "default_sampling_seconds")]
    pub(crate) sampling_window_seconds: u64,
    #[serde(default = "default_min_throughput")]
    pub(crate) min_throughput: usize,
    #[serde(default = "default_break_seconds")]
    pub(crate) break_seconds: u64,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            failure_ratio: default_failure_ratio(),
            sampling_window_seconds: default_sampling_seconds(),
            min_throughput: default_min_throughput(),
            break_seconds: default_break_seconds(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EndpointEntry {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) flavor: Flavor,
    /// Required for azure-openai endpoints.
    pub(crate) api_version: Option<String>,
    pub(crate) auth: AuthEntry,
    #[serde(default)]
    pub(crate) model_map: HashMap<String, String>,
    /// Backoff after a 429 without Retry-After.
    #[serde(default = "default_backoff_seconds")]
    pub(crate) backoff_seconds: u64,
    #[serde(default = "default_attempt_timeout_seconds")]
    pub(crate) attempt_timeout_seconds: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub(crate) retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub(crate) retry_base_delay_ms: u64,
    #[serde(default)]
    pub(crate) breaker: BreakerEntry,
    pub(crate) max_concurrency: Option<usize>,
    #[serde(default = "default_max_queue")]
    pub(crate) max_queue: usize,
    /// Optional outbound proxy for this endpoint's egress.
    pub(crate) proxy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PipelineSection {
    #[serde(default = "default_pipeline_name")]
    pub(crate) name: String,
    /// Endpoint or group name the chain terminates in.
    pub(crate) selector: String,
    #[serde(default)]
    pub(crate) steps: Vec<Value>,
}

fn default_backoff_seconds() -> u64 {
    15
}

fn default_attempt_timeout_seconds() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_sampling_seconds() -> u64 {
    5
}

fn default_min_throughput() -> usize {
    10
}

fn default_break_seconds() -> u64 {
    30
}

fn default_max_queue() -> usize {
    16
}

fn default_pipeline_name() -> String {
    "main".to_string()
}
