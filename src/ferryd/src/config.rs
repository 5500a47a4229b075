use std::fs;
use std::path::Path;

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use ferry::ContextConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Number of client threads driven through the finalize barrier.
    pub clients: usize,
    /// Bytes moved per client in each direction.
    pub transfer_size: u64,
    /// Number of buffers each client scatters its region over.
    pub segments: usize,
    pub progress_timeout_ms: u64,
    /// Deadline for a single call, and for the server to see any activity.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    #[serde(default)]
    pub context: ContextConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let server = &self.server;
        ensure!(server.clients > 0, "at least one client is required");
        ensure!(server.segments > 0, "segments must be positive");
        ensure!(
            server.transfer_size >= server.segments as u64,
            "transfer_size {} cannot be split into {} non-empty segments",
            server.transfer_size,
            server.segments
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        log_level = "info"

        [context]
        max_transfer_retries = 5

        [server]
        clients = 4
        transfer_size = 65536
        segments = 3
        progress_timeout_ms = 50
    "#;

    #[test]
    fn parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.clients, 4);
        assert_eq!(config.server.rpc_timeout_ms, 5000);
        assert_eq!(config.context.max_transfer_retries, 5);
        assert_eq!(config.context.max_handler_depth, 2);
        config.validate().unwrap();
    }

    #[test]
    fn too_many_segments() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.server.transfer_size = 2;
        assert!(config.validate().is_err());
    }
}
