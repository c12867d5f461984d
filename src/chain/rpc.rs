//! alloy-backed [`ChainClient`] talking JSON-RPC over HTTP.

use crate::chain::abi::Lottery::{self, LotteryInstance};
use crate::chain::{
    ChainClient, ChainReadError, ChainWriteError, CloseReceipt, ConfirmationError, PendingClose,
    RoundSnapshot,
};

use alloy::network::{EthereumWallet, ReceiptResponse};
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Lottery contract client signing with a local private key.
pub struct RpcChainClient {
    provider: DynProvider,
    contract: LotteryInstance<DynProvider>,
    wallet: Address,
}

impl RpcChainClient {
    /// Build the provider. No network traffic happens here; the first request
    /// is made on the first read.
    pub fn new(rpc_url: Url, contract_address: Address, signer: PrivateKeySigner) -> Self {
        let wallet = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(rpc_url)
            .erased();
        let contract = Lottery::new(contract_address, provider.clone());

        info!(contract = %contract_address, wallet = %wallet, "lottery chain client ready");

        Self {
            provider,
            contract,
            wallet,
        }
    }
}

fn narrow(field: &'static str, value: U256) -> Result<u64, ChainReadError> {
    u64::try_from(value)
        .map_err(|_| ChainReadError::Decode(format!("{field} {value} does not fit in u64")))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    fn wallet_address(&self) -> Address {
        self.wallet
    }

    async fn read_round_snapshot(&self) -> Result<RoundSnapshot, ChainReadError> {
        let round = self
            .contract
            .getCurrentRound()
            .call()
            .await
            .map_err(|e| ChainReadError::Rpc(e.to_string()))?;

        Ok(RoundSnapshot {
            round_id: narrow("roundId", round.roundId)?,
            start_time: narrow("startTime", round.startTime)?,
            end_time: narrow("endTime", round.endTime)?,
            ticket_count: narrow("totalTickets", round.totalTickets)?,
            prize_pool: round.prizePool,
            ended: round.ended,
        })
    }

    async fn read_current_round_id(&self) -> Result<u64, ChainReadError> {
        let id = self
            .contract
            .currentRoundId()
            .call()
            .await
            .map_err(|e| ChainReadError::Rpc(e.to_string()))?;
        narrow("currentRoundId", id)
    }

    async fn read_wallet_balance(&self) -> Result<U256, ChainReadError> {
        self.provider
            .get_balance(self.wallet)
            .await
            .map_err(|e| ChainReadError::Rpc(e.to_string()))
    }

    async fn submit_close_round(&self) -> Result<PendingClose, ChainWriteError> {
        // Gas estimation runs inside send(), so a revert surfaces here
        // rather than as a failed receipt.
        let pending = self
            .contract
            .endRound()
            .send()
            .await
            .map_err(|e| ChainWriteError::from_provider(e.to_string()))?;

        let tx_hash = *pending.tx_hash();
        debug!(tx = %tx_hash, "endRound broadcast");
        Ok(PendingClose { tx_hash })
    }

    async fn await_confirmation(
        &self,
        pending: PendingClose,
        timeout: Duration,
    ) -> Result<CloseReceipt, ConfirmationError> {
        let tx_hash = pending.tx_hash;
        let watch = PendingTransactionBuilder::new(self.provider.root().clone(), tx_hash);

        let receipt = match tokio::time::timeout(timeout, watch.get_receipt()).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                return Err(ConfirmationError::Network {
                    tx_hash,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ConfirmationError::Timeout {
                    tx_hash,
                    after: timeout,
                })
            }
        };

        if !receipt.status() {
            return Err(ConfirmationError::TransactionFailed {
                tx_hash,
                gas_used: receipt.gas_used,
            });
        }

        Ok(CloseReceipt {
            tx_hash,
            gas_used: receipt.gas_used,
            success: true,
        })
    }
}
