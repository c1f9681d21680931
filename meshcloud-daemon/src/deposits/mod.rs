//! Deposit monitor (design §4.D): polls the escrow chain for new deposit
//! events in bounded block windows, upserts them into the store, and sweeps
//! out ones that have reached full confirmation — the store's pending-
//! deposit tree is a cache of in-flight deposits, not a ledger of all time.

use std::sync::Arc;

use meshcloud_common::task::spawn_task;

use crate::chain::EscrowClient;
use crate::config::DEPOSIT_SCAN_MAX_BLOCK_WINDOW;
use crate::store::DataStore;

pub struct DepositMonitor {
    store: Arc<DataStore>,
    escrow: Arc<dyn EscrowClient>,
    required_confirmations: u64,
    last_scanned_block: std::sync::atomic::AtomicU64,
}

impl DepositMonitor {
    pub fn new(store: Arc<DataStore>, escrow: Arc<dyn EscrowClient>, required_confirmations: u64) -> Self {
        Self {
            store,
            escrow,
            required_confirmations,
            last_scanned_block: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// One scan pass: advances `[last_scanned_block + 1, min(head, last + MAX_WINDOW)]`,
    /// upserting anything found and sweeping deposits that have reached
    /// `required_confirmations`.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let head = self.escrow.current_block().await?;
        let last = self.last_scanned_block.load(std::sync::atomic::Ordering::SeqCst);
        if head <= last {
            self.sweep_confirmed(head).await?;
            return Ok(());
        }

        let from = last + 1;
        let to = (from + DEPOSIT_SCAN_MAX_BLOCK_WINDOW - 1).min(head);

        let deposits = self.escrow.scan_deposits(from, to).await?;
        for mut deposit in deposits {
            deposit.confirmations = head.saturating_sub(deposit.block_number);
            self.store.upsert_deposit(deposit)?;
        }

        self.last_scanned_block.store(to, std::sync::atomic::Ordering::SeqCst);
        self.sweep_confirmed(head).await?;
        Ok(())
    }

    /// Refreshes every tracked deposit's confirmation count against the
    /// current head and deletes anything that has crossed the threshold —
    /// the escrow contract's own balance becomes the source of truth for
    /// those funds at that point (design §4.D step 4, §8 scenario 1). This
    /// runs every tick, not only when a deposit's original block falls in
    /// the freshly scanned window, so `GET /api/balance` reports a rising
    /// confirmation count tick over tick even once scanning has moved past
    /// the deposit's block.
    async fn sweep_confirmed(&self, head: u64) -> anyhow::Result<()> {
        for mut deposit in self.store.all_deposits() {
            let confirmations = head.saturating_sub(deposit.block_number);
            if confirmations >= self.required_confirmations {
                self.store.remove_deposit(&deposit.tx_hash)?;
                metrics::counter!("meshcloud_deposits_confirmed_total").increment(1);
            } else if confirmations != deposit.confirmations {
                deposit.confirmations = confirmations;
                self.store.upsert_deposit(deposit)?;
            }
        }
        Ok(())
    }
}

pub fn spawn(monitor: Arc<DepositMonitor>, interval_secs: u64) {
    spawn_task("deposit-monitor", async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(err) = monitor.tick().await {
                log::warn!("deposit monitor tick failed: {err:#}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshcloud_common::amount::Amount;
    use meshcloud_common::api::domain::PendingDeposit;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::chain::{SettlementItem, SettlementResult};
    use crate::error::EscrowError;

    struct FakeEscrow {
        head: AtomicU64,
        deposit_block: u64,
    }

    #[async_trait]
    impl EscrowClient for FakeEscrow {
        async fn scan_deposits(&self, from: u64, to: u64) -> Result<Vec<PendingDeposit>, EscrowError> {
            if (from..=to).contains(&self.deposit_block) {
                Ok(vec![PendingDeposit {
                    tx_hash: "0xdeadbeef".into(),
                    wallet_address: "0xa".into(),
                    amount: Amount::from_micros(10_000_000),
                    block_number: self.deposit_block,
                    confirmations: 0,
                    chain_id: 1,
                }])
            } else {
                Ok(vec![])
            }
        }
        async fn current_block(&self) -> Result<u64, EscrowError> {
            Ok(self.head.load(Ordering::SeqCst))
        }
        async fn confirmed_balance(&self, _wallet: &str) -> Result<Amount, EscrowError> {
            Ok(Amount::ZERO)
        }
        async fn execute_settlement(&self, item: SettlementItem) -> Result<SettlementResult, EscrowError> {
            Ok(SettlementResult { usage_record_ids: item.usage_record_ids, tx_hash: "0x1".into() })
        }
        async fn execute_batch_settlement(
            &self,
            items: Vec<SettlementItem>,
        ) -> Result<Vec<SettlementResult>, EscrowError> {
            Ok(items
                .into_iter()
                .map(|i| SettlementResult { usage_record_ids: i.usage_record_ids, tx_hash: "0x1".into() })
                .collect())
        }
    }

    /// §8 scenario 1: a deposit at block 1000 with `required = 20` is still
    /// pending (with a rising confirmation count) at block 1005, and is gone
    /// — folded into the escrow's confirmed balance — by block 1020.
    #[tokio::test]
    async fn deposit_tracks_confirmations_then_clears_at_the_threshold() {
        let dir = tempdir::TempDir::new("meshcloud-deposits-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let escrow = Arc::new(FakeEscrow { head: AtomicU64::new(1005), deposit_block: 1000 });
        let monitor = Arc::new(DepositMonitor::new(store.clone(), escrow.clone(), 20));

        monitor.tick().await.unwrap();
        let deposits = store.deposits_by_wallet("0xa");
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].confirmations, 5);

        escrow.head.store(1012, Ordering::SeqCst);
        monitor.tick().await.unwrap();
        let deposits = store.deposits_by_wallet("0xa");
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].confirmations, 12);

        escrow.head.store(1020, Ordering::SeqCst);
        monitor.tick().await.unwrap();
        assert!(store.deposits_by_wallet("0xa").is_empty());
    }

    #[tokio::test]
    async fn scan_window_is_capped_at_the_configured_block_span() {
        let dir = tempdir::TempDir::new("meshcloud-deposits-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let escrow = Arc::new(FakeEscrow { head: AtomicU64::new(DEPOSIT_SCAN_MAX_BLOCK_WINDOW * 3), deposit_block: 1 });
        let monitor = Arc::new(DepositMonitor::new(store.clone(), escrow, 1_000_000));

        monitor.tick().await.unwrap();
        assert_eq!(
            monitor.last_scanned_block.load(std::sync::atomic::Ordering::SeqCst),
            DEPOSIT_SCAN_MAX_BLOCK_WINDOW
        );
    }
}
