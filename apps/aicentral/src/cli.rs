use clap::Parser;

use aicentral_common::ServerConfigPatch;

#[derive(Parser)]
#[command(name = "aicentral")]
pub(crate) struct Cli {
    /// Path to the gateway configuration file (JSON).
    #[arg(long, env = "AICENTRAL_CONFIG", default_value = "aicentral.json")]
    pub(crate) config: String,
    #[arg(long, env = "AICENTRAL_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "AICENTRAL_PORT")]
    pub(crate) port: Option<u16>,
    /// Hostname clients use to reach the gateway; polling locations are
    /// rewritten against it.
    #[arg(long, env = "AICENTRAL_PUBLIC_HOST")]
    pub(crate) public_host: Option<String>,
}

impl Cli {
    pub(crate) fn server_patch(&self) -> ServerConfigPatch {
        ServerConfigPatch {
            host: self.host.clone(),
            port: self.port,
            public_host: self.public_host.clone(),
        }
    }
}
