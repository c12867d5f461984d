//! Chain error taxonomy.
//!
//! Reads fail with [`ChainReadError`] and are always transient. Writes fail
//! with [`ChainWriteError`], whose [`WriteFailure`] cause drives how the
//! submitter reacts. Confirmation waits fail with [`ConfirmationError`].

use alloy::primitives::B256;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainReadError {
    #[error("rpc request failed: {0}")]
    Rpc(String),
    #[error("rpc request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed contract response: {0}")]
    Decode(String),
}

/// Why an `endRound()` submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// Wallet cannot pay for gas. Fatal for this wallet until topped up.
    InsufficientFunds,
    /// Another transaction from this wallet holds the nonce.
    NonceConflict,
    /// The contract rejected the call, typically because the round is
    /// already closed.
    Reverted,
    NetworkError,
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteFailure::InsufficientFunds => write!(f, "insufficient_funds"),
            WriteFailure::NonceConflict => write!(f, "nonce_conflict"),
            WriteFailure::Reverted => write!(f, "reverted"),
            WriteFailure::NetworkError => write!(f, "network_error"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("endRound submission failed ({cause}): {message}")]
pub struct ChainWriteError {
    pub cause: WriteFailure,
    pub message: String,
}

impl ChainWriteError {
    pub fn new(cause: WriteFailure, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }

    /// Build from a raw provider error, classifying it by its text.
    pub fn from_provider(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            cause: classify_write_error(&message),
            message,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("no receipt for {tx_hash} within {after:?}")]
    Timeout { tx_hash: B256, after: Duration },
    #[error("transaction {tx_hash} failed on-chain (gas used {gas_used})")]
    TransactionFailed { tx_hash: B256, gas_used: u64 },
    #[error("receipt lookup for {tx_hash} failed: {message}")]
    Network { tx_hash: B256, message: String },
}

/// Classify provider error text into a [`WriteFailure`].
///
/// Node implementations disagree on wording, so this matches on the common
/// substrings used by geth, erigon, reth and the hosted RPC gateways.
pub fn classify_write_error(message: &str) -> WriteFailure {
    let m = message.to_ascii_lowercase();

    if m.contains("insufficient funds") || m.contains("insufficient balance") {
        WriteFailure::InsufficientFunds
    } else if m.contains("nonce too low")
        || m.contains("nonce too high")
        || m.contains("nonce expired")
        || m.contains("nonce_expired")
        || m.contains("replacement transaction underpriced")
        || m.contains("already known")
    {
        WriteFailure::NonceConflict
    } else if m.contains("revert") {
        WriteFailure::Reverted
    } else {
        WriteFailure::NetworkError
    }
}
