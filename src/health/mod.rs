//! Last-observed watchdog state for external monitoring.
//!
//! The scheduler writes tick results here; the `/health` route reads them.
//! Nothing in this module triggers chain writes.

use crate::chain::{RoundSnapshot, WalletSnapshot};
use crate::context::WatchdogContext;
use crate::guard::CloseAttempt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedError {
    pub kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthState {
    pub round: Option<RoundSnapshot>,
    pub wallet: Option<WalletSnapshot>,
    /// Last tick that did not fail.
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_error: Option<RecordedError>,
    /// Condition that needs an operator (e.g. wallet out of gas).
    pub critical: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthReporter {
    state: Arc<RwLock<HealthState>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HealthState {
        self.state.read().await.clone()
    }

    pub async fn record_round(&self, round: RoundSnapshot) {
        self.state.write().await.round = Some(round);
    }

    pub async fn record_wallet(&self, wallet: WalletSnapshot) {
        self.state.write().await.wallet = Some(wallet);
    }

    pub async fn record_success(&self, at: DateTime<Utc>, outcome: String) {
        let mut state = self.state.write().await;
        state.last_tick_at = Some(at);
        state.last_outcome = Some(outcome);
        state.last_error = None;
    }

    pub async fn record_error(&self, at: DateTime<Utc>, kind: &'static str, message: String) {
        let mut state = self.state.write().await;
        state.last_outcome = Some(format!("failed: {kind}"));
        state.last_error = Some(RecordedError { kind, message, at });
    }

    pub async fn set_critical(&self, message: String) {
        self.state.write().await.critical = Some(message);
    }

    pub async fn clear_critical(&self) {
        self.state.write().await.critical = None;
    }

    /// Assemble the `/health` body. Balance and current round are read live
    /// (bounded by the RPC timeout); the rest comes from the last ticks.
    pub async fn report(
        &self,
        ctx: &WatchdogContext,
        scheduler_state: &'static str,
        in_flight: Option<CloseAttempt>,
    ) -> HealthReport {
        let wallet = ctx.chain.wallet_address();
        let now = ctx.clock.now();
        let live_wallet = ctx.read_wallet().await;
        let live_round = ctx.read_round().await;

        if let Ok(w) = &live_wallet {
            self.record_wallet(w.clone()).await;
        }
        let state = self.snapshot().await;

        let mut report = HealthReport {
            status: HealthStatus::Ok,
            message: None,
            wallet: wallet.to_string(),
            balance: None,
            current_round: None,
            timestamp: iso(now),
            round: state
                .round
                .as_ref()
                .map(|r| RoundView::from_snapshot(r, ctx.settings.prize_decimals)),
            last_tick_at: state.last_tick_at.map(iso),
            last_outcome: state.last_outcome.clone(),
            last_error: state.last_error.as_ref().map(|e| ErrorView {
                kind: e.kind,
                message: e.message.clone(),
                at: iso(e.at),
            }),
            scheduler_state,
            in_flight: in_flight.map(AttemptView::from),
        };

        match (&live_wallet, &live_round) {
            (Ok(w), Ok(r)) => {
                report.balance = Some(w.balance_eth());
                report.current_round = Some(r.round_id);
            }
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "health read failed");
                report.status = HealthStatus::Error;
                report.message = Some(e.to_string());
                report.balance = live_wallet.as_ref().ok().map(|w| w.balance_eth());
                report.current_round = live_round.as_ref().ok().map(|r| r.round_id);
            }
        }

        // An operator condition outranks a healthy read.
        if let Some(critical) = state.critical {
            report.status = HealthStatus::Error;
            report.message = Some(critical);
        }

        report
    }
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub wallet: String,
    /// ETH, full precision.
    pub balance: Option<String>,
    pub current_round: Option<u64>,
    pub timestamp: String,
    pub round: Option<RoundView>,
    pub last_tick_at: Option<String>,
    pub last_outcome: Option<String>,
    pub last_error: Option<ErrorView>,
    pub scheduler_state: &'static str,
    pub in_flight: Option<AttemptView>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundView {
    pub round_id: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub ticket_count: u64,
    pub prize_pool: String,
    pub ended: bool,
}

impl RoundView {
    fn from_snapshot(r: &RoundSnapshot, prize_decimals: u8) -> Self {
        Self {
            round_id: r.round_id,
            start_time: r.start_time,
            end_time: r.end_time,
            ticket_count: r.ticket_count,
            prize_pool: r.prize_pool_display(prize_decimals),
            ended: r.ended,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorView {
    pub kind: &'static str,
    pub message: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub round_id: u64,
    pub tx_hash: Option<String>,
    pub acquired_at: String,
    pub submitted_at: Option<String>,
}

impl From<CloseAttempt> for AttemptView {
    fn from(a: CloseAttempt) -> Self {
        Self {
            round_id: a.round_id,
            tx_hash: a.tx_hash.map(|h| h.to_string()),
            acquired_at: iso(a.acquired_at),
            submitted_at: a.submitted_at.map(iso),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainReadError, MockChainClient};
    use crate::clock::ManualClock;
    use crate::context::WatchdogSettings;
    use alloy::primitives::{Address, U256};

    fn ctx() -> (Arc<MockChainClient>, WatchdogContext) {
        let round = RoundSnapshot {
            round_id: 4,
            start_time: 100,
            end_time: 200,
            ticket_count: 2,
            prize_pool: U256::from(200_000u64),
            ended: false,
        };
        let mock = Arc::new(MockChainClient::new(
            Address::repeat_byte(0x42),
            round,
            U256::from(5_000_000_000_000_000u64),
        ));
        let ctx = WatchdogContext::new(
            mock.clone(),
            Arc::new(ManualClock::at(150)),
            WatchdogSettings::default(),
        );
        (mock, ctx)
    }

    #[tokio::test]
    async fn test_healthy_report_reads_live_values() {
        let (_mock, ctx) = ctx();
        let reporter = HealthReporter::new();
        reporter.record_success(ctx.clock.now(), "skip_active".into()).await;

        let report = reporter.report(&ctx, "idle", None).await;
        assert!(report.is_ok());
        assert_eq!(report.balance.as_deref(), Some("0.005000000000000000"));
        assert_eq!(report.current_round, Some(4));
        assert_eq!(report.last_outcome.as_deref(), Some("skip_active"));
        assert!(reporter.snapshot().await.wallet.is_some());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["currentRound"], 4);
        assert!(json.get("message").is_none());
    }

    #[tokio::test]
    async fn test_read_failure_reports_error() {
        let (mock, ctx) = ctx();
        mock.push_read_failure(ChainReadError::Rpc("connection refused".into()));

        let report = HealthReporter::new().report(&ctx, "idle", None).await;
        assert!(!report.is_ok());
        assert!(report.message.unwrap().contains("connection refused"));
        assert!(report.balance.is_some());
        assert_eq!(report.current_round, None);
    }

    #[tokio::test]
    async fn test_critical_condition_overrides_ok_reads() {
        let (_mock, ctx) = ctx();
        let reporter = HealthReporter::new();
        reporter
            .set_critical(format!("insufficient funds for gas, add ETH to wallet {}", Address::repeat_byte(0x42)))
            .await;

        let report = reporter.report(&ctx, "idle", None).await;
        assert_eq!(report.status, HealthStatus::Error);
        assert!(report.message.unwrap().contains(&report.wallet));

        reporter.clear_critical().await;
        assert!(reporter.report(&ctx, "idle", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_then_success_clears_last_error() {
        let reporter = HealthReporter::new();
        let at = Utc::now();
        reporter.record_error(at, "chain_read", "timeout".into()).await;
        assert_eq!(reporter.snapshot().await.last_error.unwrap().kind, "chain_read");

        reporter.record_success(at, "closed".into()).await;
        let state = reporter.snapshot().await;
        assert!(state.last_error.is_none());
        assert_eq!(state.last_tick_at, Some(at));
    }
}
