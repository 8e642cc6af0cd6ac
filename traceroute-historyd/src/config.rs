use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Destinations registered at start-up when missing
    #[serde(default)]
    pub destinations: Vec<SeedDestination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound applied to every paginated response
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments placed before the destination address
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedDestination {
    pub name: String,
    pub address: String,
    /// Group name, created if it does not exist yet
    pub group: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/traceroute-history/history.db")
}

fn default_listen() -> String {
    "127.0.0.1:5001".to_string()
}

fn default_max_page_size() -> u32 {
    500
}

fn default_enabled() -> bool {
    true
}

fn default_command() -> String {
    "traceroute".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-n".to_string()]
}

fn default_interval() -> u64 {
    300
}

fn default_timeout() -> u64 {
    60
}

fn default_concurrency() -> usize {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            command: default_command(),
            args: default_args(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            concurrency: default_concurrency(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.api.listen, "127.0.0.1:5001");
        assert_eq!(config.api.max_page_size, 500);
        assert_eq!(config.probe.command, "traceroute");
        assert_eq!(config.probe.args, vec!["-n".to_string()]);
        assert!(config.probe.enabled);
        assert!(config.destinations.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = Config::parse(
            r#"
            [store]
            db_path = "/tmp/history.db"

            [api]
            listen = "0.0.0.0:8080"
            max_page_size = 50

            [probe]
            enabled = false
            command = "tracert"
            args = ["-d"]
            interval_secs = 30
            timeout_secs = 10
            concurrency = 2

            [[destinations]]
            name = "edge-gw"
            address = "10.0.0.1"
            group = "core"

            [[destinations]]
            name = "dns"
            address = "9.9.9.9"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.db_path, PathBuf::from("/tmp/history.db"));
        assert_eq!(config.api.max_page_size, 50);
        assert!(!config.probe.enabled);
        assert_eq!(config.probe.concurrency, 2);
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[0].group.as_deref(), Some("core"));
        assert_eq!(config.destinations[1].group, None);
    }

    #[test]
    fn test_rejects_unknown_types() {
        assert!(Config::parse("[api]\nmax_page_size = \"lots\"").is_err());
    }
}
