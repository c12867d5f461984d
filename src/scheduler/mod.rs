//! Round-lifecycle scheduler.
//!
//! Every check, whether fired by the interval timer or by a manual trigger,
//! goes through [`Scheduler::tick`]:
//!
//! ```text
//! Idle --fire--> Ticking --skip/abort--> Idle
//!                   |
//!                 close
//!                   v
//!            AwaitingGuard --denied--> Idle
//!                   |
//!                acquired
//!                   v
//!                Closing --settled--> Idle
//! ```
//!
//! Ticks may overlap (a manual trigger during a timer tick). Reads are safe to
//! overlap; the single-flight guard makes sure only one of them submits.
//! Errors never leave a tick: they become [`TickOutcome::Failed`], are logged
//! and are recorded for `/health`.

use crate::chain::{ChainReadError, CloseReceipt, RoundSnapshot};
use crate::context::WatchdogContext;
use crate::guard::{AcquireError, SingleFlightGuard};
use crate::health::{HealthReport, HealthReporter};
use crate::monitor::{self, Decision};
use crate::submitter::{CloseFailure, CloseOutcome, TransactionSubmitter};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Ticking,
    AwaitingGuard,
    Closing,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Ticking => "ticking",
            SchedulerState::AwaitingGuard => "awaiting_guard",
            SchedulerState::Closing => "closing",
        }
    }

    /// Next state, or `None` if `event` is not valid here.
    pub fn on(self, event: TickEvent) -> Option<SchedulerState> {
        use SchedulerState::*;
        use TickEvent::*;
        match (self, event) {
            (Idle, Fire) => Some(Ticking),
            (Ticking, Skip) | (Ticking, Abort) => Some(Idle),
            (Ticking, Close) => Some(AwaitingGuard),
            (AwaitingGuard, GuardAcquired) => Some(Closing),
            (AwaitingGuard, GuardDenied) => Some(Idle),
            (Closing, Settled) => Some(Idle),
            _ => None,
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickEvent {
    Fire,
    Skip,
    /// Tick ended before a decision could be acted on.
    Abort,
    Close,
    GuardAcquired,
    GuardDenied,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Timer,
    Manual,
}

impl std::fmt::Display for TickSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickSource::Timer => write!(f, "timer"),
            TickSource::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyEnded { round_id: u64 },
    Active { round_id: u64, seconds_remaining: u64 },
    EmptyExpired { round_id: u64 },
    /// Another tick holds the close guard.
    InProgress { round_id: u64 },
    /// This watchdog already saw the round closed.
    AlreadySettled { round_id: u64 },
    /// Waiting for the wallet to be topped up.
    FundsBlocked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error(transparent)]
    ChainRead(#[from] ChainReadError),
    #[error(transparent)]
    Close(#[from] CloseFailure),
    #[error("tick task failed: {0}")]
    Task(String),
}

impl TickError {
    pub fn kind(&self) -> &'static str {
        match self {
            TickError::ChainRead(_) => "chain_read",
            TickError::Close(CloseFailure::InsufficientFunds { .. }) => "insufficient_funds",
            TickError::Close(CloseFailure::NonceConflict(_)) => "nonce_conflict",
            TickError::Close(CloseFailure::RevertAnomaly { .. }) => "reverted",
            TickError::Close(CloseFailure::Network(_)) => "network",
            TickError::Close(CloseFailure::ConfirmationTimeout { .. }) => "confirmation_timeout",
            TickError::Task(_) => "task",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Closed { round_id: u64, receipt: CloseReceipt },
    /// Our close was rejected because the round was already closed.
    AlreadyClosed { round_id: u64 },
    Failed(TickError),
}

impl TickOutcome {
    /// True when the round is now closed.
    pub fn success(&self) -> bool {
        matches!(self, TickOutcome::Closed { .. } | TickOutcome::AlreadyClosed { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TickOutcome::Failed(_))
    }

    pub fn message(&self) -> String {
        match self {
            TickOutcome::Closed { .. } => "Round ended successfully".to_string(),
            TickOutcome::AlreadyClosed { .. } => "Round already ended".to_string(),
            TickOutcome::Skipped(SkipReason::InProgress { .. }) => "Skipped: in-progress".to_string(),
            TickOutcome::Skipped(SkipReason::FundsBlocked) => {
                "Skipped: insufficient funds, waiting for wallet top-up".to_string()
            }
            TickOutcome::Skipped(_) => "No action needed".to_string(),
            TickOutcome::Failed(e) => e.to_string(),
        }
    }
}

impl std::fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickOutcome::Skipped(SkipReason::AlreadyEnded { round_id }) => {
                write!(f, "round {round_id} already ended")
            }
            TickOutcome::Skipped(SkipReason::Active { round_id, seconds_remaining }) => {
                write!(f, "round {round_id} active, {}m remaining", seconds_remaining / 60)
            }
            TickOutcome::Skipped(SkipReason::EmptyExpired { round_id }) => {
                write!(f, "round {round_id} expired with no tickets")
            }
            TickOutcome::Skipped(SkipReason::InProgress { round_id }) => {
                write!(f, "round {round_id} close in progress")
            }
            TickOutcome::Skipped(SkipReason::AlreadySettled { round_id }) => {
                write!(f, "round {round_id} already closed by watchdog")
            }
            TickOutcome::Skipped(SkipReason::FundsBlocked) => write!(f, "blocked on wallet funds"),
            TickOutcome::Closed { round_id, receipt } => {
                write!(f, "round {round_id} closed in {}", receipt.tx_hash)
            }
            TickOutcome::AlreadyClosed { round_id } => write!(f, "round {round_id} closed elsewhere"),
            TickOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// State shown on `/health`, tagged with the tick that last wrote it.
#[derive(Debug)]
struct Published {
    owner: u64,
    state: SchedulerState,
}

/// One tick's walk through the state machine. Publishes each state so
/// `/health` can show it. The latest tick to publish owns the cell; an
/// overlapping tick that finishes earlier leaves it alone, and the owner
/// resets it to `Idle` when dropped.
struct TickTrace<'a> {
    shared: &'a Mutex<Published>,
    id: u64,
    state: SchedulerState,
}

impl<'a> TickTrace<'a> {
    fn start(shared: &'a Mutex<Published>, id: u64) -> Self {
        let mut trace = Self {
            shared,
            id,
            state: SchedulerState::Idle,
        };
        trace.step(TickEvent::Fire);
        trace
    }

    fn step(&mut self, event: TickEvent) {
        match self.state.on(event) {
            Some(next) => {
                debug!(from = %self.state, to = %next, ?event, "scheduler transition");
                self.state = next;
                self.publish(next);
            }
            None => warn!(state = %self.state, ?event, "ignoring invalid scheduler transition"),
        }
    }

    fn publish(&self, state: SchedulerState) {
        let mut published = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        published.owner = self.id;
        published.state = state;
    }
}

impl Drop for TickTrace<'_> {
    fn drop(&mut self) {
        let mut published = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        if published.owner == self.id {
            published.state = SchedulerState::Idle;
        }
    }
}

pub struct Scheduler {
    ctx: WatchdogContext,
    guard: SingleFlightGuard,
    submitter: TransactionSubmitter,
    health: HealthReporter,
    /// Set after an insufficient-funds failure; cleared by a balance check.
    funds_blocked: AtomicBool,
    state: Mutex<Published>,
    next_tick: AtomicU64,
}

impl Scheduler {
    pub fn new(ctx: WatchdogContext, health: HealthReporter) -> Self {
        Self {
            submitter: TransactionSubmitter::new(ctx.clone()),
            ctx,
            guard: SingleFlightGuard::new(),
            health,
            funds_blocked: AtomicBool::new(false),
            state: Mutex::new(Published {
                owner: 0,
                state: SchedulerState::Idle,
            }),
            next_tick: AtomicU64::new(1),
        }
    }

    pub fn guard(&self) -> &SingleFlightGuard {
        &self.guard
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    pub fn is_funds_blocked(&self) -> bool {
        self.funds_blocked.load(Ordering::SeqCst)
    }

    /// Closing whenever a close is in flight, otherwise the state most
    /// recently published by a tick.
    pub fn state(&self) -> SchedulerState {
        if self.guard.is_held() {
            return SchedulerState::Closing;
        }
        self.state.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub async fn health_report(&self) -> HealthReport {
        self.health
            .report(&self.ctx, self.state().as_str(), self.guard.current())
            .await
    }

    /// Log the wallet and its balance before the first tick.
    pub async fn startup_check(&self) {
        info!(
            wallet = %self.ctx.chain.wallet_address(),
            interval_secs = self.ctx.settings.interval.as_secs(),
            "lottery watchdog starting"
        );
        self.refresh_wallet().await;
    }

    /// Run a manual tick on its own task. The caller going away (an HTTP
    /// client disconnecting) must not cancel a close after `endRound()` has
    /// been broadcast, which would release the guard unsettled.
    pub async fn trigger(self: Arc<Self>) -> TickOutcome {
        let task = tokio::spawn(async move { self.tick(TickSource::Manual).await });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "manual tick task failed");
                TickOutcome::Failed(TickError::Task(e.to_string()))
            }
        }
    }

    /// Run one check-and-close cycle. Never fails; errors are in the outcome.
    pub async fn tick(&self, source: TickSource) -> TickOutcome {
        let id = self.next_tick.fetch_add(1, Ordering::SeqCst);
        let mut trace = TickTrace::start(&self.state, id);
        debug!(source = %source, "checking if round needs to end");

        let outcome = self.run_tick(&mut trace).await;

        match &outcome {
            TickOutcome::Failed(e) => {
                self.health
                    .record_error(self.ctx.clock.now(), e.kind(), e.to_string())
                    .await;
            }
            other => {
                self.health
                    .record_success(self.ctx.clock.now(), other.to_string())
                    .await;
            }
        }
        outcome
    }

    async fn run_tick(&self, trace: &mut TickTrace<'_>) -> TickOutcome {
        if self.is_funds_blocked() && !self.funds_recovered().await {
            trace.step(TickEvent::Abort);
            return TickOutcome::Skipped(SkipReason::FundsBlocked);
        }

        let read = self.ctx.read_round().await;
        let now = self.ctx.clock.now_unix();
        let decision = monitor::evaluate(&read, now);

        let snapshot = match (decision.clone(), read) {
            (Decision::Error(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to read round, will retry next tick");
                trace.step(TickEvent::Abort);
                return TickOutcome::Failed(TickError::ChainRead(e));
            }
            (_, Ok(snapshot)) => snapshot,
        };

        info!(
            round = snapshot.round_id,
            tickets = snapshot.ticket_count,
            ended = snapshot.ended,
            decision = %decision,
            "round status"
        );
        self.health.record_round(snapshot.clone()).await;

        let round_id = snapshot.round_id;
        match decision {
            Decision::CloseRound => {
                trace.step(TickEvent::Close);
                self.close(trace, snapshot).await
            }
            Decision::Skip => {
                trace.step(TickEvent::Skip);
                TickOutcome::Skipped(SkipReason::AlreadyEnded { round_id })
            }
            Decision::SkipActive => {
                let seconds_remaining = snapshot.seconds_remaining(now);
                info!(
                    round = round_id,
                    minutes_left = seconds_remaining / 60,
                    "round still active"
                );
                trace.step(TickEvent::Skip);
                TickOutcome::Skipped(SkipReason::Active {
                    round_id,
                    seconds_remaining,
                })
            }
            Decision::SkipEmptyExpired => {
                info!(round = round_id, "round expired with no tickets, skipping");
                trace.step(TickEvent::Skip);
                TickOutcome::Skipped(SkipReason::EmptyExpired { round_id })
            }
            // Handled above.
            Decision::Error(e) => TickOutcome::Failed(TickError::ChainRead(e)),
        }
    }

    async fn close(&self, trace: &mut TickTrace<'_>, snapshot: RoundSnapshot) -> TickOutcome {
        let round_id = snapshot.round_id;

        let permit = match self.guard.try_acquire(round_id, self.ctx.clock.now()) {
            Ok(permit) => permit,
            Err(AcquireError::InProgress { held }) => {
                warn!(round = round_id, held, "close already in progress, skipping");
                trace.step(TickEvent::GuardDenied);
                return TickOutcome::Skipped(SkipReason::InProgress { round_id });
            }
            Err(AcquireError::AlreadySettled { .. }) => {
                info!(round = round_id, "round already closed by this watchdog, skipping");
                trace.step(TickEvent::GuardDenied);
                return TickOutcome::Skipped(SkipReason::AlreadySettled { round_id });
            }
        };
        trace.step(TickEvent::GuardAcquired);

        let outcome = self.submitter.close(permit, &snapshot).await;
        trace.step(TickEvent::Settled);

        match outcome {
            CloseOutcome::Confirmed(receipt) => {
                self.refresh_round().await;
                self.refresh_wallet().await;
                TickOutcome::Closed { round_id, receipt }
            }
            CloseOutcome::AlreadyHandled { round_id } => {
                self.refresh_round().await;
                TickOutcome::AlreadyClosed { round_id }
            }
            CloseOutcome::Failed(failure) => {
                if failure.is_fatal() {
                    self.block_on_funds().await;
                }
                TickOutcome::Failed(TickError::Close(failure))
            }
        }
    }

    async fn block_on_funds(&self) {
        self.funds_blocked.store(true, Ordering::SeqCst);
        let wallet = self.ctx.chain.wallet_address();
        self.health
            .set_critical(format!(
                "insufficient funds for gas, add ETH to wallet {wallet}"
            ))
            .await;
    }

    /// Balance check gating a blocked wallet. True once the balance is back
    /// at or above the threshold.
    async fn funds_recovered(&self) -> bool {
        match self.ctx.read_wallet().await {
            Ok(wallet) => {
                let recovered = !wallet.is_below(self.ctx.settings.min_balance_wei);
                if recovered {
                    info!(
                        wallet = %wallet.address,
                        balance_eth = %wallet.balance_eth(),
                        "wallet topped up, resuming round closes"
                    );
                    self.funds_blocked.store(false, Ordering::SeqCst);
                    self.health.clear_critical().await;
                } else {
                    warn!(
                        wallet = %wallet.address,
                        balance_eth = %wallet.balance_eth(),
                        "wallet still short of gas, not retrying close"
                    );
                }
                self.health.record_wallet(wallet).await;
                recovered
            }
            Err(e) => {
                warn!(error = %e, "balance check failed, wallet stays blocked");
                false
            }
        }
    }

    async fn refresh_round(&self) {
        match self.ctx.read_round().await {
            Ok(round) => self.health.record_round(round).await,
            Err(e) => warn!(error = %e, "failed to refresh round after close"),
        }
    }

    async fn refresh_wallet(&self) {
        match self.ctx.read_wallet().await {
            Ok(wallet) => {
                info!(balance_eth = %wallet.balance_eth(), "wallet balance");
                if wallet.is_below(self.ctx.settings.min_balance_wei) {
                    warn!(
                        wallet = %wallet.address,
                        balance_eth = %wallet.balance_eth(),
                        "wallet balance is low, add more ETH to continue operations"
                    );
                }
                self.health.record_wallet(wallet).await;
            }
            Err(e) => error!(error = %e, "error checking balance"),
        }
    }

    /// Tick on the configured interval until `shutdown` flips. The first tick
    /// fires immediately. A tick already running when shutdown arrives gets
    /// the grace period to finish; past that it is dropped, which releases
    /// the close guard.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        let mut interval = tokio::time::interval(self.ctx.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let grace = self.ctx.settings.shutdown_grace;

        info!(
            interval_secs = self.ctx.settings.interval.as_secs(),
            "round checks scheduled"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let tick = self.tick(TickSource::Timer);
                    tokio::pin!(tick);
                    tokio::select! {
                        _ = &mut tick => {}
                        _ = shutdown.changed() => {
                            info!(grace_secs = grace.as_secs(), "shutdown requested mid-tick, waiting for it");
                            if tokio::time::timeout(grace, &mut tick).await.is_err() {
                                warn!("tick did not finish within grace period, abandoning it");
                            }
                            break;
                        }
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}
