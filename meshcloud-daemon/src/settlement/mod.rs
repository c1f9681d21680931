//! Settlement ticker (design §4.L): periodically pushes accrued,
//! unsettled usage on-chain, grouped by (user, node) and filtered by a
//! minimum amount so settlement gas isn't spent moving dust. Groups go out
//! either one at a time or as an all-or-nothing batch depending on
//! configuration.

use std::collections::HashMap;
use std::sync::Arc;

use meshcloud_common::amount::Amount;
use meshcloud_common::task::spawn_task;

use crate::chain::{EscrowClient, SettlementItem};
use crate::config::SETTLEMENT_BATCH_MAX_ITEMS;
use crate::store::DataStore;

pub struct SettlementTicker {
    store: Arc<DataStore>,
    escrow: Arc<dyn EscrowClient>,
    min_settlement_amount: Amount,
    batching_enabled: bool,
}

impl SettlementTicker {
    pub fn new(
        store: Arc<DataStore>,
        escrow: Arc<dyn EscrowClient>,
        min_settlement_amount: Amount,
        batching_enabled: bool,
    ) -> Self {
        Self { store, escrow, min_settlement_amount, batching_enabled }
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        let groups = self.group_unsettled_usage();

        let eligible: Vec<SettlementItem> = groups
            .into_iter()
            .filter(|item| item.amount >= self.min_settlement_amount)
            .collect();

        if eligible.is_empty() {
            return Ok(());
        }

        if self.batching_enabled {
            for chunk in eligible.chunks(SETTLEMENT_BATCH_MAX_ITEMS) {
                self.submit_batch(chunk.to_vec()).await?;
            }
        } else {
            for item in eligible {
                self.submit_single(item).await?;
            }
        }

        Ok(())
    }

    fn group_unsettled_usage(&self) -> Vec<SettlementItem> {
        let mut groups: HashMap<(String, String), SettlementItem> = HashMap::new();

        for record in self.store.all_unsettled_usage() {
            let Some(node) = self.store.get_node(&record.node_id) else { continue };
            let key = (record.user_id.clone(), node.id.clone());
            let entry = groups.entry(key).or_insert_with(|| SettlementItem {
                user_id: record.user_id.clone(),
                node_wallet_address: node.wallet_address.clone(),
                amount: Amount::ZERO,
                usage_record_ids: vec![],
            });
            entry.amount = entry.amount + record.node_share;
            entry.usage_record_ids.push(record.id.clone());
        }

        groups.into_values().collect()
    }

    async fn submit_single(&self, item: SettlementItem) -> anyhow::Result<()> {
        let record_ids = item.usage_record_ids.clone();
        match self.escrow.execute_settlement(item).await {
            Ok(result) => self.mark_settled(&record_ids, &result.tx_hash),
            Err(err) if err.is_retryable() => {
                log::warn!("settlement retryable failure, leaving unsettled: {err}");
                Ok(())
            }
            Err(err) => {
                log::error!("settlement permanently failed: {err}");
                Ok(())
            }
        }
    }

    /// All-or-nothing per batch (design §4.L): if the chain call itself
    /// errors, nothing in the batch is marked settled and the whole group
    /// is retried next cycle.
    async fn submit_batch(&self, items: Vec<SettlementItem>) -> anyhow::Result<()> {
        match self.escrow.execute_batch_settlement(items).await {
            Ok(results) => {
                for result in results {
                    self.mark_settled(&result.usage_record_ids, &result.tx_hash)?;
                }
                Ok(())
            }
            Err(err) => {
                log::warn!("batch settlement failed, retrying next cycle: {err}");
                Ok(())
            }
        }
    }

    fn mark_settled(&self, usage_record_ids: &[String], tx_hash: &str) -> anyhow::Result<()> {
        for id in usage_record_ids {
            if let Some(records) = self.find_usage(id) {
                let mut record = records;
                record.settled_on_chain = true;
                record.settlement_tx_hash = Some(tx_hash.to_string());
                self.store.put_usage(record)?;
            }
        }
        metrics::counter!("meshcloud_settlements_total").increment(1);
        Ok(())
    }

    fn find_usage(&self, id: &str) -> Option<meshcloud_common::api::domain::UsageRecord> {
        self.store
            .all_unsettled_usage()
            .into_iter()
            .find(|r| r.id == id)
    }
}

pub fn spawn(ticker: Arc<SettlementTicker>, interval_secs: u64) {
    spawn_task("settlement-ticker", async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(err) = ticker.tick().await {
                log::warn!("settlement ticker tick failed: {err:#}");
            }
        }
    });
}
