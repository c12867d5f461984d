//! Single-flight guard for `endRound()` submissions.
//!
//! One token for the whole watchdog. Whoever holds the [`ClosePermit`] is the
//! only caller allowed to submit a close; everyone else gets
//! [`AcquireError::InProgress`]. The permit releases the token when dropped,
//! so a timeout, an error or a cancelled future cannot leave it held.
//!
//! The guard also remembers the last round it saw confirmed closed, and
//! refuses to start a second close for that round even if a lagging RPC node
//! still reports it open.

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// The in-flight close. Exists only while a permit is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseAttempt {
    pub round_id: u64,
    pub acquired_at: DateTime<Utc>,
    pub tx_hash: Option<B256>,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("close of round {held} already in progress")]
    InProgress { held: u64 },
    #[error("round {round_id} already closed by this watchdog")]
    AlreadySettled { round_id: u64 },
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: Option<CloseAttempt>,
    last_settled: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SingleFlightGuard {
    slot: Arc<Mutex<Slot>>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SingleFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, round_id: u64, now: DateTime<Utc>) -> Result<ClosePermit, AcquireError> {
        let mut slot = lock(&self.slot);

        if let Some(attempt) = &slot.in_flight {
            return Err(AcquireError::InProgress {
                held: attempt.round_id,
            });
        }
        if slot.last_settled == Some(round_id) {
            return Err(AcquireError::AlreadySettled { round_id });
        }

        slot.in_flight = Some(CloseAttempt {
            round_id,
            acquired_at: now,
            tx_hash: None,
            submitted_at: None,
        });
        debug!(round = round_id, "close guard acquired");

        Ok(ClosePermit {
            slot: Arc::clone(&self.slot),
            round_id,
        })
    }

    /// The in-flight attempt, if any.
    pub fn current(&self) -> Option<CloseAttempt> {
        lock(&self.slot).in_flight.clone()
    }

    pub fn is_held(&self) -> bool {
        lock(&self.slot).in_flight.is_some()
    }

    pub fn last_settled(&self) -> Option<u64> {
        lock(&self.slot).last_settled
    }
}

/// Exclusive right to close one round.
#[derive(Debug)]
pub struct ClosePermit {
    slot: Arc<Mutex<Slot>>,
    round_id: u64,
}

impl ClosePermit {
    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn record_submission(&self, tx_hash: B256, at: DateTime<Utc>) {
        if let Some(attempt) = lock(&self.slot).in_flight.as_mut() {
            attempt.tx_hash = Some(tx_hash);
            attempt.submitted_at = Some(at);
        }
    }

    /// Mark the round as closed on-chain and release the guard.
    pub fn settle(self) {
        lock(&self.slot).last_settled = Some(self.round_id);
    }
}

impl Drop for ClosePermit {
    fn drop(&mut self) {
        lock(&self.slot).in_flight = None;
        debug!(round = self.round_id, "close guard released");
    }
}
