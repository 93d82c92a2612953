// crates/conduit-daemon/src/config.rs
//
// Runtime configuration for the Conduit daemon.
// Loaded from a TOML file or populated with sensible defaults.

use serde::Deserialize;
use std::fs;

use conduit_rpc::RpcConfig;

/// Runtime configuration for the daemon.
///
/// The binding sections (`[http]`, `[duplex]`, `[events]`, `[streaming]`)
/// sit at the top level of the file next to `log_level`.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(flatten)]
    pub rpc: RpcConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            rpc: RpcConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file at the given path.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: DaemonConfig = toml::from_str(contents)?;
        Ok(config)
    }
}
