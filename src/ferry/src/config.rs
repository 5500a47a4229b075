use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// How many times a micro-transfer failing with a transient network error is reissued
    /// before its request fails.
    pub max_transfer_retries: u32,
    /// Deepest progress nesting at which inbound requests are still dispatched. Depth 1 is the
    /// outermost `process`; a wait inside a handler runs at depth 2.
    pub max_handler_depth: usize,
    pub finalize_timeout_ms: u64,
    /// Poll interval of the background progress thread.
    pub progress_timeout_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            max_transfer_retries: 3,
            max_handler_depth: 2,
            finalize_timeout_ms: 5000,
            progress_timeout_ms: 100,
        }
    }
}

impl ContextConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = toml::from_str(config.unwrap_or(""))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(ContextConfig::new(None).unwrap(), ContextConfig::default());
    }

    #[test]
    fn partial_override() {
        let config = ContextConfig::new(Some("max_transfer_retries = 7\n")).unwrap();
        assert_eq!(config.max_transfer_retries, 7);
        assert_eq!(config.max_handler_depth, 2);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(ContextConfig::new(Some("retries = 1")).is_err());
    }
}
