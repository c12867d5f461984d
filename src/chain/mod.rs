//! Typed access to the lottery contract and the watchdog wallet.
//!
//! The contract is an external collaborator; the watchdog only ever:
//! 1. Reads the current round (`getCurrentRound`, `currentRoundId`)
//! 2. Reads the wallet's native balance (gas)
//! 3. Submits `endRound()` and waits for its receipt
//!
//! Architecture:
//! - `ChainClient`: the trait every other component talks to
//! - `RpcChainClient`: alloy HTTP provider with a local signer
//! - `MockChainClient`: scripted in-memory contract for tests

pub mod abi;
pub mod error;
pub mod mock;
pub mod rpc;
pub mod types;

pub use error::{ChainReadError, ChainWriteError, ConfirmationError, WriteFailure};
pub use mock::MockChainClient;
pub use rpc::RpcChainClient;
pub use types::{CloseReceipt, PendingClose, RoundSnapshot, WalletSnapshot};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::time::Duration;

/// Read/write interface to the lottery contract.
///
/// Reads are idempotent. `submit_close_round` sends exactly one transaction
/// per call and has no other side effect.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Address of the signing wallet.
    fn wallet_address(&self) -> Address;

    async fn read_round_snapshot(&self) -> Result<RoundSnapshot, ChainReadError>;

    async fn read_current_round_id(&self) -> Result<u64, ChainReadError>;

    /// Native balance of the signing wallet, in wei.
    async fn read_wallet_balance(&self) -> Result<U256, ChainReadError>;

    /// Broadcast `endRound()`.
    async fn submit_close_round(&self) -> Result<PendingClose, ChainWriteError>;

    /// Wait up to `timeout` for the receipt of a submitted close.
    async fn await_confirmation(
        &self,
        pending: PendingClose,
        timeout: Duration,
    ) -> Result<CloseReceipt, ConfirmationError>;

    async fn read_wallet_snapshot(&self) -> Result<WalletSnapshot, ChainReadError> {
        let native_balance = self.read_wallet_balance().await?;
        Ok(WalletSnapshot {
            address: self.wallet_address(),
            native_balance,
        })
    }
}
