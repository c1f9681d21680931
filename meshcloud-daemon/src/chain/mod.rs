//! Escrow adapter (design §4.B): the sole boundary between the orchestrator
//! and the on-chain escrow contract. Grounded on the teacher's
//! `rpc/escrow.rs` query shapes and `escrow/auto_release.rs` ticker, but
//! unified behind one trait per the resolved Open Question in SPEC_FULL
//! §A4 — callers never match on a concrete client type.

use async_trait::async_trait;
use meshcloud_common::amount::Amount;
use meshcloud_common::api::domain::PendingDeposit;

use crate::error::EscrowError;

#[derive(Debug, Clone)]
pub struct ConfirmedBalance {
    pub wallet_address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone)]
pub struct SettlementItem {
    pub user_id: String,
    pub node_wallet_address: String,
    pub amount: Amount,
    pub usage_record_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SettlementResult {
    pub usage_record_ids: Vec<String>,
    pub tx_hash: String,
}

/// Everything the rest of the daemon needs from the chain, behind one
/// trait so a test double can stand in without touching reqwest.
#[async_trait]
pub trait EscrowClient: Send + Sync {
    /// Scans `[from_block, to_block]` (inclusive) for escrow deposit events.
    /// Callers are responsible for keeping the window at or below
    /// `DEPOSIT_SCAN_MAX_BLOCK_WINDOW` (design §4.D).
    async fn scan_deposits(&self, from_block: u64, to_block: u64) -> Result<Vec<PendingDeposit>, EscrowError>;

    /// Current chain head, used to compute confirmation counts.
    async fn current_block(&self) -> Result<u64, EscrowError>;

    /// Confirmed, withdrawable escrow balance for a wallet.
    async fn confirmed_balance(&self, wallet_address: &str) -> Result<Amount, EscrowError>;

    /// Submit a single settlement (one (user, node) group) on-chain.
    async fn execute_settlement(&self, item: SettlementItem) -> Result<SettlementResult, EscrowError>;

    /// Submit up to `SETTLEMENT_BATCH_MAX_ITEMS` settlements atomically:
    /// either every item in the batch settles or none do (design §4.L).
    async fn execute_batch_settlement(
        &self,
        items: Vec<SettlementItem>,
    ) -> Result<Vec<SettlementResult>, EscrowError>;
}

/// `reqwest`-based JSON-RPC implementation talking to the escrow contract's
/// sidecar service, in the style of the teacher's own JSON-RPC client calls
/// in `rpc/escrow.rs`.
pub struct HttpEscrowClient {
    http: reqwest::Client,
    rpc_url: String,
}

impl HttpEscrowClient {
    pub fn new(rpc_url: String, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("escrow http client");
        Self { http, rpc_url }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, EscrowError> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            jsonrpc: &'a str,
            id: u64,
            method: &'a str,
            params: serde_json::Value,
        }

        #[derive(serde::Deserialize)]
        struct RpcError {
            message: String,
        }

        #[derive(serde::Deserialize)]
        struct Response<T> {
            result: Option<T>,
            error: Option<RpcError>,
        }

        let body = Request {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EscrowError::Rpc(e.to_string()))?;

        let parsed: Response<T> = response
            .json()
            .await
            .map_err(|e| EscrowError::Rpc(e.to_string()))?;

        match (parsed.result, parsed.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) if err.message.to_lowercase().contains("revert") => {
                Err(EscrowError::Reverted(err.message))
            }
            (None, Some(err)) if err.message.to_lowercase().contains("nonce") => {
                Err(EscrowError::NonceCollision)
            }
            (None, Some(err)) => Err(EscrowError::Rpc(err.message)),
            (None, None) => Err(EscrowError::Rpc("empty rpc response".into())),
        }
    }
}

#[async_trait]
impl EscrowClient for HttpEscrowClient {
    async fn scan_deposits(&self, from_block: u64, to_block: u64) -> Result<Vec<PendingDeposit>, EscrowError> {
        self.call(
            "escrow_scanDeposits",
            serde_json::json!({ "fromBlock": from_block, "toBlock": to_block }),
        )
        .await
    }

    async fn current_block(&self) -> Result<u64, EscrowError> {
        self.call("escrow_currentBlock", serde_json::json!({})).await
    }

    async fn confirmed_balance(&self, wallet_address: &str) -> Result<Amount, EscrowError> {
        let micros: u64 = self
            .call("escrow_confirmedBalance", serde_json::json!({ "wallet": wallet_address }))
            .await?;
        Ok(Amount::from_micros(micros))
    }

    async fn execute_settlement(&self, item: SettlementItem) -> Result<SettlementResult, EscrowError> {
        self.call(
            "escrow_executeSettlement",
            serde_json::json!({
                "wallet": item.node_wallet_address,
                "amountMicros": item.amount.micros(),
            }),
        )
        .await
        .map(|tx_hash: String| SettlementResult {
            usage_record_ids: item.usage_record_ids,
            tx_hash,
        })
    }

    async fn execute_batch_settlement(
        &self,
        items: Vec<SettlementItem>,
    ) -> Result<Vec<SettlementResult>, EscrowError> {
        debug_assert!(items.len() <= crate::config::SETTLEMENT_BATCH_MAX_ITEMS);
        let payload: Vec<_> = items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "wallet": item.node_wallet_address,
                    "amountMicros": item.amount.micros(),
                })
            })
            .collect();

        let tx_hashes: Vec<String> = self
            .call("escrow_executeBatchSettlement", serde_json::json!({ "items": payload }))
            .await?;

        Ok(items
            .into_iter()
            .zip(tx_hashes)
            .map(|(item, tx_hash)| SettlementResult {
                usage_record_ids: item.usage_record_ids,
                tx_hash,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeEscrowClient;

    #[async_trait]
    impl EscrowClient for FakeEscrowClient {
        async fn scan_deposits(&self, _from: u64, _to: u64) -> Result<Vec<PendingDeposit>, EscrowError> {
            Ok(vec![])
        }
        async fn current_block(&self) -> Result<u64, EscrowError> {
            Ok(1000)
        }
        async fn confirmed_balance(&self, _wallet: &str) -> Result<Amount, EscrowError> {
            Ok(Amount::from_micros(42))
        }
        async fn execute_settlement(&self, item: SettlementItem) -> Result<SettlementResult, EscrowError> {
            Ok(SettlementResult {
                usage_record_ids: item.usage_record_ids,
                tx_hash: "0xfake".into(),
            })
        }
        async fn execute_batch_settlement(
            &self,
            items: Vec<SettlementItem>,
        ) -> Result<Vec<SettlementResult>, EscrowError> {
            Ok(items
                .into_iter()
                .map(|i| SettlementResult {
                    usage_record_ids: i.usage_record_ids,
                    tx_hash: "0xfakebatch".into(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn fake_client_satisfies_the_trait_object() {
        let client: Box<dyn EscrowClient> = Box::new(FakeEscrowClient);
        assert_eq!(client.current_block().await.unwrap(), 1000);
    }
}
