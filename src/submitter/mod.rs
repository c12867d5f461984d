//! Close-round submission.
//!
//! Takes ownership of a [`ClosePermit`], submits `endRound()`, waits for the
//! receipt and classifies whatever went wrong. The permit is dropped before
//! `close` returns, whichever way it returns.
//!
//! | failure                        | handling                                  |
//! |--------------------------------|-------------------------------------------|
//! | insufficient funds             | fatal for the wallet, no retry            |
//! | nonce conflict                 | transient, re-evaluated next tick         |
//! | revert / failed receipt        | re-read; benign if the round is closed    |
//! | network error / receipt timeout| transient, retried next tick              |

use crate::chain::{
    ChainWriteError, CloseReceipt, ConfirmationError, PendingClose, RoundSnapshot, WriteFailure,
};
use crate::context::WatchdogContext;
use crate::guard::ClosePermit;

use alloy::primitives::{Address, B256};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    Confirmed(CloseReceipt),
    /// The submission was rejected but the round is closed anyway.
    AlreadyHandled { round_id: u64 },
    Failed(CloseFailure),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseFailure {
    #[error("insufficient funds for gas in wallet {wallet}: {message}")]
    InsufficientFunds { wallet: Address, message: String },
    #[error("nonce conflict, another submission may be in flight: {0}")]
    NonceConflict(String),
    #[error("endRound for round {round_id} rejected while round still open: {message}")]
    RevertAnomaly { round_id: u64, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("no receipt for {tx_hash} within {after:?}")]
    ConfirmationTimeout { tx_hash: B256, after: Duration },
}

impl CloseFailure {
    /// Fatal failures stop submissions until an operator acts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CloseFailure::InsufficientFunds { .. })
    }
}

pub struct TransactionSubmitter {
    ctx: WatchdogContext,
}

impl TransactionSubmitter {
    pub fn new(ctx: WatchdogContext) -> Self {
        Self { ctx }
    }

    pub async fn close(&self, permit: ClosePermit, snapshot: &RoundSnapshot) -> CloseOutcome {
        let round_id = permit.round_id();
        info!(
            round = round_id,
            tickets = snapshot.ticket_count,
            "round expired with tickets, ending round"
        );

        let pending = match self.submit().await {
            Ok(pending) => pending,
            Err(e) => return self.on_write_error(permit, e).await,
        };

        permit.record_submission(pending.tx_hash, self.ctx.clock.now());
        info!(round = round_id, tx = %pending.tx_hash, "transaction sent");

        let limit = self.ctx.settings.confirmation_timeout;
        let confirmation = match tokio::time::timeout(
            limit,
            self.ctx.chain.await_confirmation(pending, limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConfirmationError::Timeout {
                tx_hash: pending.tx_hash,
                after: limit,
            }),
        };

        match confirmation {
            Ok(receipt) => {
                info!(
                    round = round_id,
                    tx = %receipt.tx_hash,
                    gas_used = receipt.gas_used,
                    "round ended successfully"
                );
                permit.settle();
                CloseOutcome::Confirmed(receipt)
            }
            Err(ConfirmationError::Timeout { tx_hash, after }) => {
                warn!(
                    round = round_id,
                    tx = %tx_hash,
                    after_secs = after.as_secs(),
                    "confirmation timed out, will re-evaluate next tick"
                );
                CloseOutcome::Failed(CloseFailure::ConfirmationTimeout { tx_hash, after })
            }
            Err(e @ ConfirmationError::TransactionFailed { .. }) => {
                self.check_already_closed(permit, e.to_string()).await
            }
            Err(e @ ConfirmationError::Network { .. }) => {
                warn!(round = round_id, error = %e, "receipt lookup failed, will retry next tick");
                CloseOutcome::Failed(CloseFailure::Network(e.to_string()))
            }
        }
    }

    async fn submit(&self) -> Result<PendingClose, ChainWriteError> {
        let limit = self.ctx.settings.rpc_timeout;
        match tokio::time::timeout(limit, self.ctx.chain.submit_close_round()).await {
            Ok(result) => result,
            Err(_) => Err(ChainWriteError::new(
                WriteFailure::NetworkError,
                format!("endRound submission timed out after {limit:?}"),
            )),
        }
    }

    async fn on_write_error(&self, permit: ClosePermit, e: ChainWriteError) -> CloseOutcome {
        let round_id = permit.round_id();
        match e.cause {
            WriteFailure::InsufficientFunds => {
                let wallet = self.ctx.chain.wallet_address();
                error!(
                    round = round_id,
                    wallet = %wallet,
                    "CRITICAL: insufficient funds for gas, add ETH to wallet"
                );
                CloseOutcome::Failed(CloseFailure::InsufficientFunds {
                    wallet,
                    message: e.message,
                })
            }
            WriteFailure::NonceConflict => {
                warn!(
                    round = round_id,
                    error = %e.message,
                    "nonce error, transaction may have been sent by another process"
                );
                CloseOutcome::Failed(CloseFailure::NonceConflict(e.message))
            }
            WriteFailure::Reverted => self.check_already_closed(permit, e.message).await,
            WriteFailure::NetworkError => {
                warn!(round = round_id, error = %e.message, "endRound submission failed, will retry next tick");
                CloseOutcome::Failed(CloseFailure::Network(e.message))
            }
        }
    }

    /// A rejected close is fine if the round turns out to be closed already,
    /// e.g. the contract closed it between our read and our submit.
    async fn check_already_closed(&self, permit: ClosePermit, message: String) -> CloseOutcome {
        let round_id = permit.round_id();

        let closed = match self.ctx.read_round().await {
            Ok(fresh) => (fresh.round_id == round_id && fresh.ended) || fresh.round_id > round_id,
            // Fall back to the round counter: a later round means ours is over.
            Err(_) => matches!(self.ctx.read_current_round_id().await, Ok(id) if id > round_id),
        };

        if closed {
            info!(round = round_id, reason = %message, "endRound rejected, round already ended");
            permit.settle();
            CloseOutcome::AlreadyHandled { round_id }
        } else {
            error!(round = round_id, reason = %message, "endRound rejected but round still open");
            CloseOutcome::Failed(CloseFailure::RevertAnomaly { round_id, message })
        }
    }
}
