//! Scripted in-memory lottery contract.
//!
//! Behaves like the real contract for the calls the watchdog makes: a
//! confirmed `endRound()` flips `ended` on the current round. Failures are
//! queued up front and consumed one per call.

use crate::chain::{
    ChainClient, ChainReadError, ChainWriteError, CloseReceipt, ConfirmationError, PendingClose,
    RoundSnapshot, WriteFailure,
};

use alloy::primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// How the next `await_confirmation` call settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmBehavior {
    /// Receipt with status 1; the round is marked ended.
    Succeed,
    /// Report `ConfirmationError::Timeout` straight away.
    Timeout,
    /// Receipt with status 0.
    Fail,
    /// Receipt lookup fails at the transport.
    NetworkError,
    /// Never settle; the caller's own timeout must fire.
    Hang,
}

#[derive(Debug)]
struct MockState {
    round: RoundSnapshot,
    balance: U256,
    read_failures: VecDeque<ChainReadError>,
    balance_failures: VecDeque<ChainReadError>,
    submit_failures: VecDeque<ChainWriteError>,
    close_before_next_revert: bool,
    stall_next_submit: bool,
    confirm: ConfirmBehavior,
    gas_used: u64,
}

pub struct MockChainClient {
    wallet: Address,
    state: Mutex<MockState>,
    submit_calls: AtomicUsize,
    round_reads: AtomicUsize,
    submitted: Notify,
    /// When set, confirmations wait for a permit from `release_confirmations`.
    gate: Option<Arc<Semaphore>>,
}

impl MockChainClient {
    pub fn new(wallet: Address, round: RoundSnapshot, balance: U256) -> Self {
        Self {
            wallet,
            state: Mutex::new(MockState {
                round,
                balance,
                read_failures: VecDeque::new(),
                balance_failures: VecDeque::new(),
                submit_failures: VecDeque::new(),
                close_before_next_revert: false,
                stall_next_submit: false,
                confirm: ConfirmBehavior::Succeed,
                gas_used: 52_314,
            }),
            submit_calls: AtomicUsize::new(0),
            round_reads: AtomicUsize::new(0),
            submitted: Notify::new(),
            gate: None,
        }
    }

    /// Hold every confirmation until `release_confirmations` hands out permits.
    pub fn with_held_confirmations(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release_confirmations(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_round(&self, round: RoundSnapshot) {
        self.state().round = round;
    }

    pub fn round(&self) -> RoundSnapshot {
        self.state().round.clone()
    }

    pub fn set_balance(&self, balance: U256) {
        self.state().balance = balance;
    }

    pub fn set_confirm_behavior(&self, confirm: ConfirmBehavior) {
        self.state().confirm = confirm;
    }

    pub fn push_read_failure(&self, err: ChainReadError) {
        self.state().read_failures.push_back(err);
    }

    pub fn push_balance_failure(&self, err: ChainReadError) {
        self.state().balance_failures.push_back(err);
    }

    pub fn push_submit_failure(&self, err: ChainWriteError) {
        self.state().submit_failures.push_back(err);
    }

    /// Next submission reverts because someone else closed the round first.
    pub fn revert_as_already_closed(&self) {
        let mut state = self.state();
        state.close_before_next_revert = true;
        state
            .submit_failures
            .push_back(ChainWriteError::new(WriteFailure::Reverted, "execution reverted: round already ended"));
    }

    /// Next submission never returns; the caller's own timeout must fire.
    pub fn stall_next_submit(&self) {
        self.state().stall_next_submit = true;
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn round_reads(&self) -> usize {
        self.round_reads.load(Ordering::SeqCst)
    }

    /// Resolve once at least `n` submissions have been made.
    pub async fn wait_for_submissions(&self, n: usize) {
        loop {
            let notified = self.submitted.notified();
            if self.submit_calls() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn wallet_address(&self) -> Address {
        self.wallet
    }

    async fn read_round_snapshot(&self) -> Result<RoundSnapshot, ChainReadError> {
        self.round_reads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        Ok(state.round.clone())
    }

    async fn read_current_round_id(&self) -> Result<u64, ChainReadError> {
        let mut state = self.state();
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        Ok(state.round.round_id)
    }

    async fn read_wallet_balance(&self) -> Result<U256, ChainReadError> {
        let mut state = self.state();
        if let Some(err) = state.balance_failures.pop_front() {
            return Err(err);
        }
        Ok(state.balance)
    }

    async fn submit_close_round(&self) -> Result<PendingClose, ChainWriteError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let stall = std::mem::take(&mut self.state().stall_next_submit);
        if stall {
            self.submitted.notify_waiters();
            return std::future::pending().await;
        }
        let result = {
            let mut state = self.state();
            match state.submit_failures.pop_front() {
                Some(err) => {
                    if err.cause == WriteFailure::Reverted && state.close_before_next_revert {
                        state.close_before_next_revert = false;
                        state.round.ended = true;
                    }
                    Err(err)
                }
                None => {
                    let seed = format!("endRound:{}:{}", state.round.round_id, n);
                    Ok(PendingClose {
                        tx_hash: keccak256(seed.as_bytes()),
                    })
                }
            }
        };
        self.submitted.notify_waiters();
        result
    }

    async fn await_confirmation(
        &self,
        pending: PendingClose,
        timeout: Duration,
    ) -> Result<CloseReceipt, ConfirmationError> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let (confirm, gas_used) = {
            let state = self.state();
            (state.confirm, state.gas_used)
        };
        let tx_hash: B256 = pending.tx_hash;

        match confirm {
            ConfirmBehavior::Succeed => {
                self.state().round.ended = true;
                Ok(CloseReceipt {
                    tx_hash,
                    gas_used,
                    success: true,
                })
            }
            ConfirmBehavior::Timeout => Err(ConfirmationError::Timeout {
                tx_hash,
                after: timeout,
            }),
            ConfirmBehavior::Fail => Err(ConfirmationError::TransactionFailed { tx_hash, gas_used }),
            ConfirmBehavior::NetworkError => Err(ConfirmationError::Network {
                tx_hash,
                message: "error sending request: connection reset by peer".to_string(),
            }),
            ConfirmBehavior::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_round() -> RoundSnapshot {
        RoundSnapshot {
            round_id: 7,
            start_time: 0,
            end_time: 100,
            ticket_count: 12,
            prize_pool: U256::from(1_200_000u64),
            ended: false,
        }
    }

    #[tokio::test]
    async fn test_confirmed_close_marks_round_ended() {
        let mock = MockChainClient::new(Address::ZERO, open_round(), U256::from(1u64));
        let pending = mock.submit_close_round().await.unwrap();
        let receipt = mock
            .await_confirmation(pending, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(receipt.success);
        assert!(mock.round().ended);
        assert_eq!(mock.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_consumed_in_order() {
        let mock = MockChainClient::new(Address::ZERO, open_round(), U256::from(1u64));
        mock.push_read_failure(ChainReadError::Rpc("connection reset".into()));

        assert!(mock.read_round_snapshot().await.is_err());
        assert_eq!(mock.read_round_snapshot().await.unwrap().round_id, 7);
        assert_eq!(mock.round_reads(), 2);
    }

    #[tokio::test]
    async fn test_revert_as_already_closed() {
        let mock = MockChainClient::new(Address::ZERO, open_round(), U256::from(1u64));
        mock.revert_as_already_closed();

        let err = mock.submit_close_round().await.unwrap_err();
        assert_eq!(err.cause, WriteFailure::Reverted);
        assert!(mock.round().ended);
    }
}
