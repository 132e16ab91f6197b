use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("unknown endpoint or group reference: {0}")]
    UnknownReference(String),
    #[error("endpoint group {0} references itself")]
    CircularReference(String),
    #[error("unknown {kind} type: {name}")]
    UnknownType { kind: &'static str, name: String },
    #[error("invalid config for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Final, merged server configuration used by the running process.
///
/// Merge order: CLI > ENV > config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Hostname clients use to reach this gateway; polling locations are
    /// rewritten against it.
    pub public_host: String,
}

/// Optional layer used when merging server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub public_host: Option<String>,
}

impl ServerConfigPatch {
    pub fn overlay(&mut self, other: ServerConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.public_host.is_some() {
            self.public_host = other.public_host;
        }
    }

    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let host = self.host.unwrap_or_else(|| "0.0.0.0".to_string());
        let port = self.port.unwrap_or(8787);
        let public_host = self
            .public_host
            .unwrap_or_else(|| format!("localhost:{port}"));
        Ok(ServerConfig {
            host,
            port,
            public_host,
        })
    }
}

impl From<ServerConfig> for ServerConfigPatch {
    fn from(value: ServerConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            public_host: Some(value.public_host),
        }
    }
}

/// The authenticated caller of a gateway pipeline. Partition keys for rate
/// limiting and affinity are derived from `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: String,
    pub name: String,
}

impl ClientIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

pub fn new_trace_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
