use alloy::primitives::utils::parse_ether;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint - env RPC_URL overrides
    #[serde(default)]
    pub rpc_url: String,
    /// Lottery contract address - env LOTTERY_CONTRACT_ADDRESS overrides
    #[serde(default)]
    pub contract_address: String,
    /// Signing key - only ever loaded from env PRIVATE_KEY
    #[serde(skip)]
    pub private_key: String,
    /// Decimals of the token the prize pool is paid in (USDC).
    #[serde(default = "default_prize_decimals")]
    pub prize_decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds between scheduled round checks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on any single RPC read.
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Upper bound on waiting for the endRound receipt.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// Gas balance warning threshold, in ETH (decimal string, no floats).
    #[serde(default = "default_min_balance_eth")]
    pub min_balance_eth: String,
    /// How long an in-flight close may keep running after a shutdown signal.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// env PORT overrides
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_prize_decimals() -> u8 {
    6
}
fn default_interval_secs() -> u64 {
    60
}
fn default_rpc_timeout_secs() -> u64 {
    15
}
fn default_confirmation_timeout_secs() -> u64 {
    120
}
fn default_min_balance_eth() -> String {
    "0.001".to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            contract_address: String::new(),
            private_key: String::new(),
            prize_decimals: default_prize_decimals(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            min_balance_eth: default_min_balance_eth(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Read an env var through `lookup`, treating empty values as unset.
fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents, |name| std::env::var(name).ok())
    }

    /// Load a default config with everything taken from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_toml_str(
        contents: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.overlay(&lookup)?;
        Ok(config)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config {
            chain: ChainConfig::default(),
            watchdog: WatchdogConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.overlay(&lookup)?;
        Ok(config)
    }

    // Secrets and deployment-specific values always come from the environment
    // when present (never store the key in the config file).
    fn overlay(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = non_empty(lookup, "RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Some(addr) = non_empty(lookup, "LOTTERY_CONTRACT_ADDRESS") {
            self.chain.contract_address = addr;
        }
        if let Some(key) = non_empty(lookup, "PRIVATE_KEY") {
            self.chain.private_key = key;
        }
        if let Some(port) = non_empty(lookup, "PORT") {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "PORT",
                reason: format!("{port:?} is not a port number"),
            })?;
        }
        Ok(())
    }

    /// Reject a config the watchdog cannot run with. Called before anything
    /// touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.rpc_url.is_empty() {
            return Err(ConfigError::MissingEnv("RPC_URL".to_string()));
        }
        if self.chain.private_key.is_empty() {
            return Err(ConfigError::MissingEnv("PRIVATE_KEY".to_string()));
        }
        if self.chain.contract_address.is_empty() {
            return Err(ConfigError::MissingEnv("LOTTERY_CONTRACT_ADDRESS".to_string()));
        }

        self.rpc_url()?;
        let address = self.contract_address()?;
        if address == Address::ZERO {
            return Err(ConfigError::Invalid {
                field: "LOTTERY_CONTRACT_ADDRESS",
                reason: "contract not deployed (zero address)".to_string(),
            });
        }
        self.signer()?;

        let w = &self.watchdog;
        for (field, value) in [
            ("watchdog.interval_secs", w.interval_secs),
            ("watchdog.rpc_timeout_secs", w.rpc_timeout_secs),
            ("watchdog.confirmation_timeout_secs", w.confirmation_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        parse_ether(&w.min_balance_eth).map_err(|e| ConfigError::Invalid {
            field: "watchdog.min_balance_eth",
            reason: e.to_string(),
        })?;

        Ok(())
    }

    pub fn rpc_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.chain.rpc_url).map_err(|e| ConfigError::Invalid {
            field: "RPC_URL",
            reason: e.to_string(),
        })
    }

    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        Address::from_str(self.chain.contract_address.trim()).map_err(|e| ConfigError::Invalid {
            field: "LOTTERY_CONTRACT_ADDRESS",
            reason: e.to_string(),
        })
    }

    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        // Never echo the key itself.
        PrivateKeySigner::from_str(self.chain.private_key.trim()).map_err(|_| ConfigError::Invalid {
            field: "PRIVATE_KEY",
            reason: "not a valid secp256k1 private key".to_string(),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // Anvil's first dev account.
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const CONTRACT: &str = "0x520066b9340dCEc3A876Cec21973390c9d67ac8f";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    fn full_env() -> impl Fn(&str) -> Option<String> {
        env(&[
            ("RPC_URL", "https://sepolia.base.org"),
            ("PRIVATE_KEY", DEV_KEY),
            ("LOTTERY_CONTRACT_ADDRESS", CONTRACT),
            ("PORT", "4100"),
        ])
    }

    #[test]
    fn test_env_only_config_validates() {
        let config = Config::from_lookup(full_env()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.watchdog.interval_secs, 60);
        assert_eq!(config.chain.prize_decimals, 6);
        assert_eq!(
            config.signer().unwrap().address(),
            Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap()
        );
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let config = Config::from_lookup(env(&[
            ("RPC_URL", "https://sepolia.base.org"),
            ("LOTTERY_CONTRACT_ADDRESS", CONTRACT),
        ]))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEnv(name)) if name == "PRIVATE_KEY"
        ));
    }

    #[test]
    fn test_zero_contract_address_rejected() {
        let config = Config::from_lookup(env(&[
            ("RPC_URL", "https://sepolia.base.org"),
            ("PRIVATE_KEY", DEV_KEY),
            ("LOTTERY_CONTRACT_ADDRESS", "0x0000000000000000000000000000000000000000"),
        ]))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "LOTTERY_CONTRACT_ADDRESS", .. })
        ));
    }

    #[test]
    fn test_bad_port_rejected() {
        let err = Config::from_lookup(env(&[("PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "PORT", .. }));
    }

    #[test]
    fn test_toml_file_with_env_secrets() {
        let toml = r#"
            [chain]
            rpc_url = "http://localhost:8545"
            contract_address = "0x520066b9340dCEc3A876Cec21973390c9d67ac8f"

            [watchdog]
            interval_secs = 30
            min_balance_eth = "0.05"

            [logging]
            json = true
        "#;
        let config = Config::from_toml_str(toml, env(&[("PRIVATE_KEY", DEV_KEY)])).unwrap();
        config.validate().unwrap();
        assert_eq!(config.chain.rpc_url, "http://localhost:8545");
        assert_eq!(config.watchdog.interval_secs, 30);
        assert_eq!(config.watchdog.rpc_timeout_secs, 15);
        assert_eq!(config.server.port, 3001);
        assert!(config.logging.json);
        assert_eq!(config.bind_addr(), "0.0.0.0:3001");
    }

    #[test]
    fn test_private_key_in_file_is_ignored() {
        let toml = r#"
            [chain]
            rpc_url = "http://localhost:8545"
            contract_address = "0x520066b9340dCEc3A876Cec21973390c9d67ac8f"
            private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
        "#;
        let config = Config::from_toml_str(toml, env(&[])).unwrap();
        assert!(config.chain.private_key.is_empty());
        assert!(matches!(config.validate(), Err(ConfigError::MissingEnv(_))));
    }

    #[test]
    fn test_zero_interval_and_bad_threshold_rejected() {
        let mut config = Config::from_lookup(full_env()).unwrap();
        config.watchdog.interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "watchdog.interval_secs", .. })
        ));

        let mut config = Config::from_lookup(full_env()).unwrap();
        config.watchdog.min_balance_eth = "lots".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "watchdog.min_balance_eth", .. })
        ));
    }
}
