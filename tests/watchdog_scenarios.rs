//! End-to-end runs over HTTP against the in-memory contract.

use lottery_watchdog::api::{self, ApiState, TriggerResponse};
use lottery_watchdog::chain::{ChainReadError, ChainWriteError, MockChainClient, RoundSnapshot};
use lottery_watchdog::clock::ManualClock;
use lottery_watchdog::context::{WatchdogContext, WatchdogSettings};
use lottery_watchdog::health::HealthReporter;
use lottery_watchdog::scheduler::{Scheduler, SkipReason, TickOutcome, TickSource};

use alloy::primitives::{Address, U256};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const END: i64 = 1_700_000_000;
const ONE_ETH: u64 = 1_000_000_000_000_000_000;

struct Harness {
    mock: Arc<MockChainClient>,
    scheduler: Arc<Scheduler>,
    base: String,
    http: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(mock: MockChainClient, now: i64) -> Self {
        let mock = Arc::new(mock);
        let ctx = WatchdogContext::new(
            mock.clone(),
            Arc::new(ManualClock::at(now)),
            WatchdogSettings::default(),
        );
        let scheduler = Arc::new(Scheduler::new(ctx, HealthReporter::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = oneshot::channel::<()>();
        let state = ApiState {
            scheduler: scheduler.clone(),
        };
        let server = tokio::spawn(api::serve_listener(listener, state, async move {
            let _ = stopped.await;
        }));

        Self {
            mock,
            scheduler,
            base,
            http: reqwest::Client::new(),
            stop: Some(stop),
            server,
        }
    }

    async fn trigger(&self) -> (StatusCode, TriggerResponse) {
        let resp = self
            .http
            .post(format!("{}/trigger-end-round", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn health(&self) -> (StatusCode, Value) {
        let resp = self
            .http
            .get(format!("{}/health", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.server.await.unwrap().unwrap();
    }
}

fn round(round_id: u64, ticket_count: u64) -> RoundSnapshot {
    RoundSnapshot {
        round_id,
        start_time: END as u64 - 86_400,
        end_time: END as u64,
        ticket_count,
        prize_pool: U256::from(ticket_count * 1_000_000),
        ended: false,
    }
}

fn wallet() -> Address {
    Address::repeat_byte(0x5a)
}

#[tokio::test]
async fn test_expired_round_closed_by_manual_trigger() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(7, 12), U256::from(ONE_ETH)),
        END + 30,
    )
    .await;

    let (status, body) = h.trigger().await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.success);
    assert_eq!(body.message, "Round ended successfully");
    assert!(body.timestamp.ends_with('Z'));
    assert_eq!(h.mock.submit_calls(), 1);
    assert!(h.mock.round().ended);

    let (status, body) = h.trigger().await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.success);
    assert_eq!(body.message, "No action needed");
    assert_eq!(h.mock.submit_calls(), 1);

    let (status, health) = h.health().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["currentRound"], 7);
    assert_eq!(health["round"]["ended"], true);
    assert_eq!(health["round"]["prizePool"], "12.000000");
    assert_eq!(health["schedulerState"], "idle");
    assert!(health["inFlight"].is_null());

    h.shutdown().await;
}

#[tokio::test]
async fn test_expired_empty_round_is_left_alone() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(8, 0), U256::from(ONE_ETH)),
        END + 30,
    )
    .await;

    let (status, body) = h.trigger().await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.success);
    assert_eq!(body.message, "No action needed");
    assert_eq!(h.mock.submit_calls(), 0);
    assert!(!h.mock.round().ended);

    h.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_triggers_submit_once() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(7, 12), U256::from(ONE_ETH)).with_held_confirmations(),
        END + 30,
    )
    .await;
    let h = Arc::new(h);

    let first = tokio::spawn({
        let h = h.clone();
        async move { h.trigger().await }
    });
    h.mock.wait_for_submissions(1).await;

    let (health_status, health) = h.health().await;
    assert_eq!(health_status, StatusCode::OK);
    assert_eq!(health["schedulerState"], "closing");
    assert_eq!(health["inFlight"]["roundId"], 7);
    assert!(health["inFlight"]["txHash"].is_string());

    let (a, b) = futures::join!(h.trigger(), h.trigger());
    for (status, body) in [a, b] {
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert_eq!(body.message, "Skipped: in-progress");
    }

    h.mock.release_confirmations(1);
    let (status, body) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.message, "Round ended successfully");
    assert_eq!(h.mock.submit_calls(), 1);
    assert!(!h.scheduler.guard().is_held());

    if let Ok(h) = Arc::try_unwrap(h) {
        h.shutdown().await;
    }
}

#[tokio::test]
async fn test_client_hanging_up_does_not_release_close() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(7, 12), U256::from(ONE_ETH)).with_held_confirmations(),
        END + 30,
    )
    .await;

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let res = impatient
        .post(format!("{}/trigger-end-round", h.base))
        .send()
        .await;
    assert!(res.is_err());
    assert_eq!(h.mock.submit_calls(), 1);
    assert!(h.scheduler.guard().is_held());

    // Timer tick while the first close is still unconfirmed.
    let timer = h.scheduler.tick(TickSource::Timer).await;
    assert_eq!(timer, TickOutcome::Skipped(SkipReason::InProgress { round_id: 7 }));
    assert_eq!(h.mock.submit_calls(), 1);

    h.mock.release_confirmations(1);
    while h.scheduler.guard().is_held() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.scheduler.guard().last_settled(), Some(7));

    let after = h.scheduler.tick(TickSource::Timer).await;
    assert_eq!(after, TickOutcome::Skipped(SkipReason::AlreadyEnded { round_id: 7 }));
    assert_eq!(h.mock.submit_calls(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_trigger_burst_never_double_closes() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(9, 3), U256::from(ONE_ETH)),
        END + 1,
    )
    .await;

    let results = futures::future::join_all((0..8).map(|_| h.trigger())).await;
    let closed = results
        .iter()
        .filter(|(_, body)| body.message == "Round ended successfully")
        .count();
    assert_eq!(closed, 1);
    assert!(results.iter().all(|(status, _)| *status == StatusCode::OK));
    assert_eq!(h.mock.submit_calls(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_failed_close_reports_500() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(7, 12), U256::from(ONE_ETH)),
        END + 30,
    )
    .await;
    h.mock
        .push_submit_failure(ChainWriteError::from_provider("nonce too low: next nonce 5, tx nonce 4"));

    let (status, body) = h.trigger().await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.success);
    assert!(body.message.contains("nonce"));

    let (_, health) = h.health().await;
    assert_eq!(health["lastError"]["kind"], "nonce_conflict");

    // Retried on the next trigger.
    let (status, body) = h.trigger().await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.success);
    assert_eq!(h.mock.submit_calls(), 2);

    h.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_500_when_rpc_down() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(4, 1), U256::from(ONE_ETH)),
        END - 3600,
    )
    .await;
    h.mock
        .push_read_failure(ChainReadError::Rpc("error sending request: connection refused".into()));

    let (status, health) = h.health().await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(health["status"], "error");
    assert!(health["message"].as_str().unwrap().contains("connection refused"));
    assert_eq!(health["wallet"], wallet().to_string());

    let (status, health) = h.health().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["currentRound"], 4);
    assert_eq!(health["balance"], "1.000000000000000000");

    h.shutdown().await;
}

#[tokio::test]
async fn test_out_of_gas_marks_health_critical() {
    let h = Harness::start(
        MockChainClient::new(wallet(), round(7, 12), U256::ZERO),
        END + 30,
    )
    .await;
    h.mock.push_submit_failure(ChainWriteError::from_provider(
        "insufficient funds for gas * price + value",
    ));

    let (status, body) = h.trigger().await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.success);

    let (status, health) = h.health().await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(health["message"]
        .as_str()
        .unwrap()
        .contains(&wallet().to_string()));

    h.mock.set_balance(U256::from(ONE_ETH));
    let (status, body) = h.trigger().await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.success);

    let (status, _) = h.health().await;
    assert_eq!(status, StatusCode::OK);

    h.shutdown().await;
}
