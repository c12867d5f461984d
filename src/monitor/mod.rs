//! Round expiry decision.
//!
//! `decide` maps one round snapshot and the current time to an action. It
//! holds no state, so re-running it every tick is always safe: a round whose
//! close failed simply yields `CloseRound` again on the next tick.

use crate::chain::{ChainReadError, RoundSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Round already closed on-chain.
    Skip,
    /// Round still live.
    SkipActive,
    /// Round expired with no tickets. Left open so the next purchase starts a
    /// fresh round; closing it would burn gas with no beneficiary.
    SkipEmptyExpired,
    CloseRound,
    /// The snapshot could not be read.
    Error(ChainReadError),
}

impl Decision {
    pub fn is_close(&self) -> bool {
        matches!(self, Decision::CloseRound)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Skip => write!(f, "skip_already_ended"),
            Decision::SkipActive => write!(f, "skip_active"),
            Decision::SkipEmptyExpired => write!(f, "skip_empty_expired"),
            Decision::CloseRound => write!(f, "close_round"),
            Decision::Error(e) => write!(f, "error({e})"),
        }
    }
}

/// Check order matters: `ended` first, then expiry, then the ticket count.
pub fn decide(snapshot: &RoundSnapshot, now: u64) -> Decision {
    if snapshot.ended {
        Decision::Skip
    } else if now < snapshot.end_time {
        Decision::SkipActive
    } else if snapshot.ticket_count == 0 {
        Decision::SkipEmptyExpired
    } else {
        Decision::CloseRound
    }
}

/// `decide` over the result of a snapshot read.
pub fn evaluate(read: &Result<RoundSnapshot, ChainReadError>, now: u64) -> Decision {
    match read {
        Ok(snapshot) => decide(snapshot, now),
        Err(e) => Decision::Error(e.clone()),
    }
}
