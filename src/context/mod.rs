//! Shared handles every component receives: chain client, clock, settings.
//!
//! Built once at startup and cloned into each component. All chain reads go
//! through here so every one of them carries the RPC timeout.

use crate::chain::{ChainClient, ChainReadError, RoundSnapshot, RpcChainClient, WalletSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigError};

use alloy::primitives::utils::parse_ether;
use alloy::primitives::U256;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Runtime knobs derived from config.
#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub rpc_timeout: Duration,
    pub confirmation_timeout: Duration,
    /// Wallet balance under which the watchdog warns, and which a blocked
    /// wallet must reach before submissions resume.
    pub min_balance_wei: U256,
    pub shutdown_grace: Duration,
    pub prize_decimals: u8,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(15),
            confirmation_timeout: Duration::from_secs(120),
            // 0.001 ETH
            min_balance_wei: U256::from(1_000_000_000_000_000u64),
            shutdown_grace: Duration::from_secs(30),
            prize_decimals: 6,
        }
    }
}

impl WatchdogSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let w = &config.watchdog;
        let min_balance_wei = parse_ether(&w.min_balance_eth).map_err(|e| ConfigError::Invalid {
            field: "watchdog.min_balance_eth",
            reason: e.to_string(),
        })?;

        Ok(Self {
            interval: Duration::from_secs(w.interval_secs),
            rpc_timeout: Duration::from_secs(w.rpc_timeout_secs),
            confirmation_timeout: Duration::from_secs(w.confirmation_timeout_secs),
            min_balance_wei,
            shutdown_grace: Duration::from_secs(w.shutdown_grace_secs),
            prize_decimals: config.chain.prize_decimals,
        })
    }
}

#[derive(Clone)]
pub struct WatchdogContext {
    pub chain: Arc<dyn ChainClient>,
    pub clock: Arc<dyn Clock>,
    pub settings: WatchdogSettings,
}

impl WatchdogContext {
    pub fn new(chain: Arc<dyn ChainClient>, clock: Arc<dyn Clock>, settings: WatchdogSettings) -> Self {
        Self {
            chain,
            clock,
            settings,
        }
    }

    /// Production context: alloy client against the configured RPC, system clock.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let settings = WatchdogSettings::from_config(config)?;
        let chain = RpcChainClient::new(
            config.rpc_url()?,
            config.contract_address()?,
            config.signer()?,
        );
        Ok(Self::new(Arc::new(chain), Arc::new(SystemClock), settings))
    }

    /// Run a chain read, failing with `ChainReadError::Timeout` if it stalls.
    pub async fn bounded<T, F>(&self, read: F) -> Result<T, ChainReadError>
    where
        F: Future<Output = Result<T, ChainReadError>>,
    {
        let limit = self.settings.rpc_timeout;
        match tokio::time::timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => Err(ChainReadError::Timeout(limit)),
        }
    }

    pub async fn read_round(&self) -> Result<RoundSnapshot, ChainReadError> {
        self.bounded(self.chain.read_round_snapshot()).await
    }

    pub async fn read_current_round_id(&self) -> Result<u64, ChainReadError> {
        self.bounded(self.chain.read_current_round_id()).await
    }

    pub async fn read_wallet(&self) -> Result<WalletSnapshot, ChainReadError> {
        self.bounded(self.chain.read_wallet_snapshot()).await
    }
}
