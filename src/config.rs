use alloy::primitives::Address;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub rpc_http: String,
    /// The equity token contract, 0x-prefixed hex.
    pub token_address: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blocks behind head the watcher stays, to avoid most reorgs outright.
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_batch_size() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_reorg_depth() -> u64 {
    64
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl ChainConfig {
    pub fn token(&self) -> eyre::Result<Address> {
        self.token_address
            .parse()
            .map_err(|e| eyre::eyre!("Invalid token address '{}': {}", self.token_address, e))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// ============================================================
// API Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

fn default_api_port() -> u16 {
    3000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        let chain = &self.chain;
        let addr = &chain.token_address;
        if !addr.starts_with("0x")
            || addr.len() != 42
            || !addr[2..].chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(eyre::eyre!(
                "Invalid token address '{}' on chain '{}'",
                addr,
                chain.name
            ));
        }
        if chain.batch_size == 0 {
            return Err(eyre::eyre!("Chain '{}': batch_size must be positive", chain.name));
        }
        if chain.max_reorg_depth == 0 {
            return Err(eyre::eyre!(
                "Chain '{}': max_reorg_depth must be positive",
                chain.name
            ));
        }
        if chain.poll_interval_ms == 0 {
            return Err(eyre::eyre!(
                "Chain '{}': poll_interval_ms must be positive",
                chain.name
            ));
        }
        Ok(())
    }
}
