use serde_derive::{Deserialize, Serialize};

/// Node-wide settings loaded via `confy`, independent of the per-invocation
/// role/index chosen on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for `logs/` and `data/`, relative to the working
    /// directory unless absolute.
    pub root: String,

    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { root: ".".to_string(), log_level: "info".to_string() }
    }
}

impl NodeConfig {
    /// Loads `twopc`'s config file (created with defaults on first run), or
    /// falls back to the baked-in defaults if it can't be read or parsed.
    pub fn load() -> Self {
        match confy::load("twopc", "config") {
            Ok(config) => config,
            Err(err) => {
                log::warn!("failed to load config, using defaults: {}", err);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_working_directory() {
        let config = NodeConfig::default();
        assert_eq!(config.root, ".");
        assert_eq!(config.log_level, "info");
    }
}
