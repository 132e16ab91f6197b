use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use aicentral_common::ConfigError;
use aicentral_endpoint::EndpointDispatcher;

use crate::affinity::{AffinityConfig, AffinityStep};
use crate::client_auth::{ClientKeyEntry, ClientKeyStep};
use crate::rate_limit::{
    FixedWindowConfig, FixedWindowRateLimiterStep, TokenRateLimiterStep, TokenWindowConfig,
};
use crate::select::{
    EndpointSelector, LowestLatencySelector, PrioritySelector, RandomSelector, RouteTarget,
    SingleSelector,
};
use crate::step::PipelineStep;

/// Configuration of one endpoint group (a named selector).
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(flatten)]
    pub strategy: GroupStrategy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum GroupStrategy {
    Single {
        member: String,
    },
    Random {
        members: Vec<String>,
    },
    Priority {
        primary: Vec<String>,
        fallback: Vec<String>,
    },
    LowestLatency {
        members: Vec<String>,
    },
}

impl GroupStrategy {
    fn references(&self) -> Vec<&str> {
        match self {
            GroupStrategy::Single { member } => vec![member.as_str()],
            GroupStrategy::Random { members } | GroupStrategy::LowestLatency { members } => {
                members.iter().map(String::as_str).collect()
            }
            GroupStrategy::Priority { primary, fallback } => primary
                .iter()
                .chain(fallback.iter())
                .map(String::as_str)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Building,
    Done,
}

/// Resolves group configs into selector instances. A group may reference
/// endpoints or other groups; a group that reaches itself, directly or
/// through intermediaries, is a configuration error caught here rather than
/// an infinite recursion at request time.
pub fn build_selectors(
    groups: &[GroupConfig],
    endpoints: &HashMap<String, Arc<EndpointDispatcher>>,
) -> Result<HashMap<String, Arc<EndpointSelector>>, ConfigError> {
    let configs: HashMap<&str, &GroupConfig> = groups
        .iter()
        .map(|group| (group.name.as_str(), group))
        .collect();

    let mut built: HashMap<String, Arc<EndpointSelector>> = HashMap::new();
    let mut state: HashMap<String, BuildState> = HashMap::new();

    for group in groups {
        build_group(group, &configs, endpoints, &mut built, &mut state)?;
    }
    Ok(built)
}

fn build_group(
    group: &GroupConfig,
    configs: &HashMap<&str, &GroupConfig>,
    endpoints: &HashMap<String, Arc<EndpointDispatcher>>,
    built: &mut HashMap<String, Arc<EndpointSelector>>,
    state: &mut HashMap<String, BuildState>,
) -> Result<Arc<EndpointSelector>, ConfigError> {
    if let Some(existing) = built.get(&group.name) {
        return Ok(existing.clone());
    }
    if state.get(&group.name) == Some(&BuildState::Building) {
        return Err(ConfigError::CircularReference(group.name.clone()));
    }
    state.insert(group.name.clone(), BuildState::Building);

    if group.strategy.references().is_empty() {
        return Err(ConfigError::Invalid(
            "group",
            format!("group {} has no members", group.name),
        ));
    }

    let mut resolve = |name: &str| -> Result<RouteTarget, ConfigError> {
        if let Some(endpoint) = endpoints.get(name) {
            return Ok(RouteTarget::Leaf(endpoint.clone()));
        }
        if let Some(nested) = configs.get(name).copied() {
            let selector = build_group(nested, configs, endpoints, built, state)?;
            return Ok(RouteTarget::Group(selector));
        }
        Err(ConfigError::UnknownReference(name.to_string()))
    };

    let selector = match &group.strategy {
        GroupStrategy::Single { member } => {
            EndpointSelector::Single(SingleSelector::new(group.name.clone(), resolve(member)?))
        }
        GroupStrategy::Random { members } => {
            let targets = members
                .iter()
                .map(|name| resolve(name))
                .collect::<Result<Vec<_>, _>>()?;
            EndpointSelector::Random(RandomSelector::new(group.name.clone(), targets))
        }
        GroupStrategy::Priority { primary, fallback } => {
            let primary = primary
                .iter()
                .map(|name| resolve(name))
                .collect::<Result<Vec<_>, _>>()?;
            let fallback = fallback
                .iter()
                .map(|name| resolve(name))
                .collect::<Result<Vec<_>, _>>()?;
            EndpointSelector::Priority(PrioritySelector::new(group.name.clone(), primary, fallback))
        }
        GroupStrategy::LowestLatency { members } => {
            let targets = members
                .iter()
                .map(|name| resolve(name))
                .collect::<Result<Vec<_>, _>>()?;
            EndpointSelector::LowestLatency(LowestLatencySelector::new(group.name.clone(), targets))
        }
    };

    let selector = Arc::new(selector);
    built.insert(group.name.clone(), selector.clone());
    state.insert(group.name.clone(), BuildState::Done);
    Ok(selector)
}

pub type StepBuilder = fn(&Value) -> Result<Arc<dyn PipelineStep>, ConfigError>;

/// Explicit name-to-constructor table for pipeline steps, resolved once at
/// startup. Hosts can register their own cross-cutting steps alongside the
/// built-in ones.
pub struct StepRegistry {
    builders: HashMap<&'static str, StepBuilder>,
}

impl StepRegistry {
    pub fn with_defaults() -> Self {
        let mut builders: HashMap<&'static str, StepBuilder> = HashMap::new();
        builders.insert("client-key-auth", build_client_key_auth);
        builders.insert("fixed-window-rate-limit", build_fixed_window);
        builders.insert("token-rate-limit", build_token_window);
        builders.insert("endpoint-affinity", build_affinity);
        Self { builders }
    }

    pub fn register(&mut self, name: &'static str, builder: StepBuilder) {
        self.builders.insert(name, builder);
    }

    pub fn build(
        &self,
        type_name: &str,
        config: &Value,
    ) -> Result<Arc<dyn PipelineStep>, ConfigError> {
        let builder = self
            .builders
            .get(type_name)
            .ok_or_else(|| ConfigError::UnknownType {
                kind: "step",
                name: type_name.to_string(),
            })?;
        builder(config)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&&str> = self.builders.keys().collect();
        names.sort();
        f.debug_struct("StepRegistry").field("steps", &names).finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ClientKeyAuthConfig {
    clients: Vec<ClientKeyEntry>,
}

fn build_client_key_auth(config: &Value) -> Result<Arc<dyn PipelineStep>, ConfigError> {
    let config: ClientKeyAuthConfig = parse("client-key-auth", config)?;
    Ok(Arc::new(ClientKeyStep::new(config.clients)))
}

fn build_fixed_window(config: &Value) -> Result<Arc<dyn PipelineStep>, ConfigError> {
    let config: FixedWindowConfig = parse("fixed-window-rate-limit", config)?;
    Ok(Arc::new(FixedWindowRateLimiterStep::from_config(config)))
}

fn build_token_window(config: &Value) -> Result<Arc<dyn PipelineStep>, ConfigError> {
    let config: TokenWindowConfig = parse("token-rate-limit", config)?;
    Ok(Arc::new(TokenRateLimiterStep::from_config(config)))
}

fn build_affinity(config: &Value) -> Result<Arc<dyn PipelineStep>, ConfigError> {
    let config: AffinityConfig = parse("endpoint-affinity", config)?;
    Ok(Arc::new(AffinityStep::from_config(config)))
}

fn parse<T: serde::de::DeserializeOwned>(
    label: &'static str,
    config: &Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(config.clone())
        .map_err(|err| ConfigError::Invalid(label, err.to_string()))
}
