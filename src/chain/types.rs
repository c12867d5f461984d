//! Point-in-time values read from the lottery contract and the signing wallet.

use alloy::primitives::utils::{format_ether, format_units};
use alloy::primitives::{Address, B256, U256};

/// One read of `getCurrentRound()`. Fetched fresh every tick, never cached
/// across ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub round_id: u64,
    /// Unix seconds.
    pub start_time: u64,
    /// Unix seconds.
    pub end_time: u64,
    pub ticket_count: u64,
    /// Raw fixed-point amount in the payment token's smallest unit.
    pub prize_pool: U256,
    pub ended: bool,
}

impl RoundSnapshot {
    /// Seconds until `end_time`, zero once expired.
    pub fn seconds_remaining(&self, now: u64) -> u64 {
        self.end_time.saturating_sub(now)
    }

    /// Prize pool formatted with the token's decimals, e.g. "1.200000" for 1_200_000
    /// at 6 decimals. Falls back to the raw integer if the decimals are invalid.
    pub fn prize_pool_display(&self, decimals: u8) -> String {
        format_units(self.prize_pool, decimals).unwrap_or_else(|_| self.prize_pool.to_string())
    }
}

impl std::fmt::Display for RoundSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Round #{}(tickets={}, end={}, ended={})",
            self.round_id, self.ticket_count, self.end_time, self.ended
        )
    }
}

/// The watchdog wallet and its native (gas) balance in wei.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub address: Address,
    pub native_balance: U256,
}

impl WalletSnapshot {
    pub fn balance_eth(&self) -> String {
        format_ether(self.native_balance)
    }

    pub fn is_below(&self, threshold_wei: U256) -> bool {
        self.native_balance < threshold_wei
    }
}

/// Handle to a broadcast `endRound()` transaction awaiting inclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingClose {
    pub tx_hash: B256,
}

/// Settled `endRound()` transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReceipt {
    pub tx_hash: B256,
    pub gas_used: u64,
    pub success: bool,
}
