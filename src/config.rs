use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::discovery::{DiscoverySettings, ScanMode};
use crate::store::MergePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub networks: HashMap<String, NetworkConfig>,
    pub default_network: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub explorer_url: Option<String>,
    pub gas: GasConfig,
}

impl NetworkConfig {
    pub fn address_url(&self, address: &str) -> Option<String> {
        self.explorer_url
            .as_ref()
            .map(|base| format!("{}/address/{}", base.trim_end_matches('/'), address))
    }

    pub fn transaction_url(&self, hash: &str) -> Option<String> {
        self.explorer_url
            .as_ref()
            .map(|base| format!("{}/tx/{}", base.trim_end_matches('/'), hash))
    }
}

/// Explicit gas parameters; wallet defaults are never used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    pub deploy_gas_limit: u64,
    pub mint_gas_limit: u64,
    pub gas_price: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub batch_size: u64,
    pub recent_window: u64,
    pub incremental_window: u64,
    pub scan_mode: ScanMode,
    pub merge_policy: MergePolicy,
    pub transaction_concurrency: usize,
    pub extraction_concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let settings = DiscoverySettings::default();
        Self {
            batch_size: settings.batch_size,
            recent_window: settings.recent_window,
            incremental_window: settings.incremental_window,
            scan_mode: settings.scan_mode,
            merge_policy: settings.merge_policy,
            transaction_concurrency: settings.transaction_concurrency,
            extraction_concurrency: settings.extraction_concurrency,
        }
    }
}

impl DiscoveryConfig {
    pub fn settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            batch_size: self.batch_size,
            recent_window: self.recent_window,
            incremental_window: self.incremental_window,
            scan_mode: self.scan_mode,
            merge_policy: self.merge_policy,
            transaction_concurrency: self.transaction_concurrency,
            extraction_concurrency: self.extraction_concurrency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub poll_interval_ms: u64,
    /// `None` keeps polling until the server shuts down.
    pub max_poll_attempts: Option<u32>,
    pub soft_timeout_secs: u64,
    pub token_artifact: Option<PathBuf>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_attempts: Some(600),
            soft_timeout_secs: 60,
            token_artifact: None,
        }
    }
}

impl TransactionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Base URL of the interactions API, e.g. `https://host/api/interactions`.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_cache_path(&self) -> PathBuf {
        self.cache_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("token-forge")
                .join("deployed-tokens.json")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub allow_write_operations: bool,
    /// Name of the environment variable holding the signing key.
    pub private_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub transport: String,
    pub stdio: StdioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioConfig {
    pub buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let mut networks = HashMap::new();

        networks.insert(
            "shardeum-unstable".to_string(),
            NetworkConfig {
                rpc_url: "https://api-unstable.shardeum.org".to_string(),
                chain_id: 8080,
                explorer_url: Some("https://explorer-unstable.shardeum.org".to_string()),
                gas: GasConfig {
                    deploy_gas_limit: 3_000_000,
                    mint_gas_limit: 200_000,
                    gas_price: None,
                },
            },
        );

        networks.insert(
            "shardeum-testnet".to_string(),
            NetworkConfig {
                rpc_url: "https://api-mezame.shardeum.org".to_string(),
                chain_id: 8119,
                explorer_url: Some("https://explorer-mezame.shardeum.org".to_string()),
                gas: GasConfig {
                    deploy_gas_limit: 3_000_000,
                    mint_gas_limit: 200_000,
                    gas_price: None,
                },
            },
        );

        networks.insert(
            "localhost".to_string(),
            NetworkConfig {
                rpc_url: "http://127.0.0.1:8545".to_string(),
                chain_id: 1337,
                explorer_url: None,
                gas: GasConfig {
                    deploy_gas_limit: 6_000_000,
                    mint_gas_limit: 300_000,
                    gas_price: Some(1_000_000_000), // 1 Gwei
                },
            },
        );

        Self {
            networks,
            default_network: "shardeum-unstable".to_string(),
            discovery: DiscoveryConfig::default(),
            transactions: TransactionConfig::default(),
            tracking: TrackingConfig::default(),
            storage: StorageConfig::default(),
            security: SecurityConfig {
                allow_write_operations: false,
                private_key_env: "TOKEN_FORGE_PRIVATE_KEY".to_string(),
            },
            server: ServerConfig {
                transport: "stdio".to_string(),
                stdio: StdioConfig {
                    buffer_size: Some(1024 * 1024), // 1MB buffer
                },
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    #[allow(dead_code)]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    anyhow!("Failed to create config directory {:?}: {}", parent, e)
                })?;
            }
        }

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", path, e))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub async fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Self {
        let mut config = match path {
            Some(path) => match Self::load_from_file(path).await {
                Ok(config) => {
                    tracing::info!("Loaded configuration from file");
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load config file, using defaults: {}", e);
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env_vars();
        config
    }

    pub fn network(&self, network: Option<&str>) -> Result<&NetworkConfig> {
        let network_name = network.unwrap_or(&self.default_network);
        self.networks
            .get(network_name)
            .ok_or_else(|| anyhow!("Network '{}' not configured", network_name))
    }

    pub fn available_networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.keys().cloned().collect();
        names.sort();
        names
    }

    fn apply_env_vars(&mut self) {
        if let Ok(url) = std::env::var("TRACKING_API_URL") {
            if !url.trim().is_empty() {
                tracing::info!("Using TRACKING_API_URL environment variable for interaction tracking");
                self.tracking.base_url = Some(url.trim().to_string());
            }
        }

        if std::env::var(&self.security.private_key_env).is_err() && self.security.allow_write_operations {
            tracing::warn!(
                "Write operations are enabled but {} is not set",
                self.security.private_key_env
            );
        }

        if self.discovery.scan_mode == ScanMode::SampleBatchEnd {
            tracing::warn!(
                "Discovery samples only the last block of every {}-block batch; deployments in other blocks will be missed",
                self.discovery.batch_size
            );
        }
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("token-forge").join("config.toml"))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let sample_config = r#"# Token Forge Configuration File
# Networks, discovery tuning, transaction tracking and storage.

# Default network to use when none is specified
default_network = "shardeum-unstable"

[networks.shardeum-unstable]
rpc_url = "https://api-unstable.shardeum.org"
chain_id = 8080
explorer_url = "https://explorer-unstable.shardeum.org"

[networks.shardeum-unstable.gas]
deploy_gas_limit = 3_000_000
mint_gas_limit = 200_000
# gas_price = 20_000_000_000  # 20 Gwei, omit to let the node price it

[networks.shardeum-testnet]
rpc_url = "https://api-mezame.shardeum.org"
chain_id = 8119
explorer_url = "https://explorer-mezame.shardeum.org"

[networks.shardeum-testnet.gas]
deploy_gas_limit = 3_000_000
mint_gas_limit = 200_000

[networks.localhost]
rpc_url = "http://127.0.0.1:8545"
chain_id = 1337

[networks.localhost.gas]
deploy_gas_limit = 6_000_000
mint_gas_limit = 300_000
gas_price = 1_000_000_000  # 1 Gwei

[discovery]
batch_size = 50
recent_window = 1000
incremental_window = 100
# "every_block" inspects each block; "sample_batch_end" only the last block of each batch
scan_mode = "every_block"
# "first_seen_wins" keeps cached metadata; "refresh_metadata" overwrites it on rediscovery
merge_policy = "first_seen_wins"
transaction_concurrency = 8
extraction_concurrency = 4

[transactions]
poll_interval_ms = 1000
max_poll_attempts = 600
soft_timeout_secs = 60
# token_artifact = "artifacts/contracts/CustomToken.sol/CustomToken.json"

[tracking]
# base_url = "https://your-app.example.com/api/interactions"
timeout_secs = 10

[storage]
# cache_path = "/path/to/deployed-tokens.json"

# Security settings
[security]
allow_write_operations = false
private_key_env = "TOKEN_FORGE_PRIVATE_KEY"

# Server configuration
[server]
transport = "stdio"

[server.stdio]
buffer_size = 1048576  # 1MB

# Environment variables that can be used:
# TOKEN_FORGE_PRIVATE_KEY - Hex private key used to sign deploy and mint transactions
# TRACKING_API_URL - Overrides tracking.base_url
"#;
        sample_config.to_string()
    }
}
