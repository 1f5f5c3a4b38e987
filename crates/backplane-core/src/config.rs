//! Domain configuration loading

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::hotswap::SwapTimeout;

/// Configuration for one management domain's entity registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name, used as the prefix of every entity's reported name.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub hot_swap: HotSwapConfig,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self { name: default_name(), hot_swap: HotSwapConfig::default() }
    }
}

fn default_name() -> String {
    "backplane".to_string()
}

/// Default hot-swap timing applied to newly created entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotSwapConfig {
    /// Auto-activate timeout in milliseconds. Absent means wait forever for
    /// an explicit activate; zero means activate immediately.
    #[serde(default)]
    pub auto_activate_ms: Option<u64>,
    /// Auto-deactivate timeout in milliseconds, same convention.
    #[serde(default)]
    pub auto_deactivate_ms: Option<u64>,
}

impl HotSwapConfig {
    pub fn auto_activate(&self) -> SwapTimeout {
        timeout_from_ms(self.auto_activate_ms)
    }

    pub fn auto_deactivate(&self) -> SwapTimeout {
        timeout_from_ms(self.auto_deactivate_ms)
    }
}

fn timeout_from_ms(ms: Option<u64>) -> SwapTimeout {
    match ms {
        None => SwapTimeout::Never,
        Some(0) => SwapTimeout::Now,
        Some(ms) => SwapTimeout::After(Duration::from_millis(ms)),
    }
}

impl DomainConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DomainConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded domain configuration");
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            info!(
                path = %path.display(),
                "Configuration file not found, using defaults"
            );
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DomainConfig::default();
        assert_eq!(config.name, "backplane");
        assert_eq!(config.hot_swap.auto_activate(), SwapTimeout::Never);
    }

    #[test]
    fn test_parse_partial_file() {
        let config: DomainConfig = toml::from_str(
            r#"
            name = "rack12"

            [hot_swap]
            auto_activate_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "rack12");
        assert_eq!(
            config.hot_swap.auto_activate(),
            SwapTimeout::After(Duration::from_millis(5000))
        );
        assert_eq!(config.hot_swap.auto_deactivate(), SwapTimeout::Never);
    }

    #[test]
    fn test_zero_means_immediate() {
        let config: DomainConfig =
            toml::from_str("[hot_swap]\nauto_activate_ms = 0\n").unwrap();
        assert_eq!(config.hot_swap.auto_activate(), SwapTimeout::Now);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DomainConfig::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.name, "backplane");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domain.toml");
        std::fs::write(&path, "name = \"shelf-3\"\n").unwrap();
        let config = DomainConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "shelf-3");
    }
}
