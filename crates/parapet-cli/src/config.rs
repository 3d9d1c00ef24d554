use std::path::{Path, PathBuf};

use serde::Deserialize;

use parapet_core::config::ClientConfig;
use parapet_types::{ParapetError, Result};

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Address of the parapet agent (host:port).
    pub agent_addr: String,

    /// Root of the watched directory tree. Paths in the repository are
    /// relative to this.
    #[serde(default)]
    pub source_root: Option<String>,

    /// Inline passphrase (discouraged; prefer passcommand or the prompt).
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Command whose stdout is the passphrase.
    #[serde(default)]
    pub passcommand: Option<String>,

    /// Seconds between watch-mode scans of the source tree.
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,

    /// Default retention horizon for `gc`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default)]
    pub client: ClientConfig,
}

fn default_poll_seconds() -> u64 {
    2
}

fn default_retention_days() -> u32 {
    30
}

/// Config lookup order: `--config`, `$PARAPET_CONFIG`, `./parapet.yaml`.
pub fn resolve_config_path(flag: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("PARAPET_CONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from("parapet.yaml");
    local.exists().then_some(local)
}

pub fn load(path: &Path) -> Result<CliConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ParapetError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    serde_yaml::from_str(&text)
        .map_err(|e| ParapetError::Config(format!("invalid config '{}': {e}", path.display())))
}

pub fn minimal_config_template() -> &'static str {
    "\
# parapet client configuration
agent_addr: \"127.0.0.1:8440\"
source_root: \"/path/to/watched/tree\"
# passcommand: \"pass show backup/parapet\"
# retention_days: 30
"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses() {
        let cfg: CliConfig = serde_yaml::from_str(minimal_config_template()).unwrap();
        assert_eq!(cfg.agent_addr, "127.0.0.1:8440");
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.poll_seconds, 2);
    }

    #[test]
    fn minimal_config_needs_only_agent_addr() {
        let cfg: CliConfig = serde_yaml::from_str("agent_addr: \"localhost:1\"").unwrap();
        assert!(cfg.source_root.is_none());
        assert_eq!(cfg.client.upload_window, 8);
    }
}
