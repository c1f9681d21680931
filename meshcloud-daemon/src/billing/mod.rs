//! Billing ticker (design §4.K): every cycle, computes the cost accrued by
//! each running General-purpose VM since its last billing timestamp,
//! settles it against credits then escrow balance, and stops VMs that run
//! out of funds after a grace period of consecutive failed cycles.

use std::sync::Arc;

use meshcloud_common::amount::Amount;
use meshcloud_common::api::command::CommandType;
use meshcloud_common::api::domain::{Node, Pricing, UsageRecord, VmSpec, VmStatus, VmType};
use meshcloud_common::task::spawn_task;

use crate::attestation::AttestationTracker;
use crate::balance::{compute_balance, consume_credits, prune_expired_credits};
use crate::chain::EscrowClient;
use crate::commands::CommandBus;
use crate::error::StoreError;
use crate::store::DataStore;

/// The hourly rate a VM is billed at, quoted by its placed node's pricing
/// (§3 `VirtualMachine.billing.hourlyRateCrypto`). Captured once at
/// placement time rather than recomputed every cycle, so a later change to
/// a node's advertised pricing never retroactively alters a running VM's
/// rate.
pub fn hourly_rate(spec: &VmSpec, pricing: &Pricing) -> Amount {
    Amount::from_micros(
        (pricing.cpu_per_hour.micros() * spec.vcpus as u64)
            + (pricing.mem_per_gb_per_hour.micros() * (spec.mem_bytes >> 30)),
    )
}

pub struct BillingTicker {
    store: Arc<DataStore>,
    escrow: Arc<dyn EscrowClient>,
    commands: Arc<CommandBus>,
    attestation: Arc<AttestationTracker>,
    platform_fee_bps: u32,
    required_confirmations: u64,
    out_of_funds_grace_cycles: u32,
}

impl BillingTicker {
    pub fn new(
        store: Arc<DataStore>,
        escrow: Arc<dyn EscrowClient>,
        commands: Arc<CommandBus>,
        attestation: Arc<AttestationTracker>,
        platform_fee_bps: u32,
        required_confirmations: u64,
        out_of_funds_grace_cycles: u32,
    ) -> Self {
        Self {
            store,
            escrow,
            commands,
            attestation,
            platform_fee_bps,
            required_confirmations,
            out_of_funds_grace_cycles,
        }
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        let now = chrono::Utc::now();

        for vm in self.store.vms_by_status(VmStatus::Running) {
            if vm.spec.vm_type != VmType::General {
                continue;
            }
            if vm.billing.stopped_reason.is_some() {
                continue;
            }
            if let Err(err) = self.bill_vm(&vm, now).await {
                log::warn!("billing cycle failed for vm {}: {err:#}", vm.id);
            }
        }

        Ok(())
    }

    async fn bill_vm(&self, vm: &meshcloud_common::api::domain::VirtualMachine, now: chrono::DateTime<chrono::Utc>) -> anyhow::Result<()> {
        let Some(node_id) = &vm.node_id else { return Ok(()) };
        let Some(node) = self.store.get_node(node_id) else { return Ok(()) };

        let period_start = vm.billing.last_billing_at.or(vm.started_at).unwrap_or(now);
        let period = now - period_start;
        if period < chrono::Duration::minutes(1) {
            return Ok(());
        }
        let period_hours = period.num_milliseconds() as f64 / 3_600_000.0;
        let period_minutes = period.num_minutes() as u64;

        let mut vm = vm.clone();

        // Attestation is paused (stale or failing): the elapsed time counts
        // as unverified runtime only — no cost is computed or billed for it,
        // per §4.K/§8 scenario 2 (a recovered VM's next usage record starts
        // fresh from the recovery point, never retroactively billing the
        // paused window).
        if !self.attestation.is_verified(&vm.id, now) {
            vm.billing.unverified_runtime_minutes += period_minutes;
            vm.billing.last_billing_at = Some(now);
            self.store.put_vm(vm)?;
            return Ok(());
        }

        let cost = Amount::from_rate_and_hours(vm.billing.hourly_rate_crypto.micros(), period_hours);
        if cost.is_zero() {
            return Ok(());
        }

        let snapshot = compute_balance(
            &self.store,
            self.escrow.as_ref(),
            &vm.owner_id,
            &node.wallet_address,
            self.required_confirmations,
        )
        .await?;

        if snapshot.has_sufficient(cost).is_ok() {
            self.settle_cost(&mut vm, &node, cost, period_minutes, period_start, now)?;
            vm.billing.consecutive_billing_failures = 0;
        } else {
            vm.billing.consecutive_billing_failures += 1;
            if vm.billing.consecutive_billing_failures > self.out_of_funds_grace_cycles {
                self.stop_for_out_of_funds(&mut vm, &node).await?;
            }
        }

        self.store.put_vm(vm)?;
        Ok(())
    }

    fn settle_cost(
        &self,
        vm: &mut meshcloud_common::api::domain::VirtualMachine,
        node: &Node,
        cost: Amount,
        minutes: u64,
        period_start: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        let mut credits = self.store.credits_for_user(&vm.owner_id);
        prune_expired_credits(&mut credits, now);
        let covered_by_credits = consume_credits(&mut credits, cost);
        self.store.put_credits_for_user(&vm.owner_id, credits)?;

        let billed_against_escrow = cost.saturating_sub(covered_by_credits);
        if !billed_against_escrow.is_zero() {
            let record = UsageRecord::new(
                uuid::Uuid::new_v4().to_string(),
                vm.id.clone(),
                vm.owner_id.clone(),
                node.id.clone(),
                period_start,
                now,
                billed_against_escrow,
                self.platform_fee_bps,
            );
            self.store.put_usage(record)?;
        }

        vm.billing.verified_runtime_minutes += minutes;
        vm.billing.total_billed = vm.billing.total_billed + cost;
        vm.billing.last_billing_at = Some(now);
        Ok(())
    }

    async fn stop_for_out_of_funds(
        &self,
        vm: &mut meshcloud_common::api::domain::VirtualMachine,
        node: &Node,
    ) -> Result<(), StoreError> {
        vm.status = VmStatus::Stopping;
        vm.billing.stopped_reason = Some("out_of_funds".to_string());
        self.commands
            .enqueue(
                node,
                CommandType::StopVm {
                    vm_id: vm.id.clone(),
                    reason: "out_of_funds".to_string(),
                },
            )
            .await;
        metrics::counter!("meshcloud_vms_stopped_out_of_funds_total").increment(1);
        Ok(())
    }
}

pub fn spawn(ticker: Arc<BillingTicker>, interval_secs: u64) {
    spawn_task("billing-ticker", async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(err) = ticker.tick().await {
                log::warn!("billing ticker tick failed: {err:#}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshcloud_common::api::domain::{
        Hardware, NatType, NetworkConfig, NodeStatus, PowerState, Pricing, QualityTier, VirtualMachine, VmSpec,
    };
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::chain::{SettlementItem, SettlementResult};
    use crate::error::EscrowError;

    struct FakeEscrow {
        confirmed_micros: AtomicU64,
    }

    #[async_trait]
    impl EscrowClient for FakeEscrow {
        async fn scan_deposits(
            &self,
            _from: u64,
            _to: u64,
        ) -> Result<Vec<meshcloud_common::api::domain::PendingDeposit>, EscrowError> {
            Ok(vec![])
        }
        async fn current_block(&self) -> Result<u64, EscrowError> {
            Ok(0)
        }
        async fn confirmed_balance(&self, _wallet: &str) -> Result<Amount, EscrowError> {
            Ok(Amount::from_micros(self.confirmed_micros.load(Ordering::SeqCst)))
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

    fn sample_node() -> Node {
        Node {
            id: "n1".into(),
            wallet_address: "0xnode".into(),
            public_ip: Some("1.2.3.4".into()),
            agent_port: 5100,
            nat_type: NatType::None,
            cgnat_info: None,
            relay_info: None,
            hardware: Hardware { cpu_cores: 8, mem_bytes: 32 << 30, disk_bytes: 500 << 30, benchmark_score: 5000 },
            pricing: Some(Pricing {
                cpu_per_hour: Amount::from_micros(10_000),
                mem_per_gb_per_hour: Amount::from_micros(1_000),
            }),
            system_vm_obligations: vec![],
            last_heartbeat_at: chrono::Utc::now(),
            status: NodeStatus::Online,
            allocated_vcpus: 0,
            allocated_mem_bytes: 0,
            allocated_disk_bytes: 0,
        }
    }

    fn sample_vm(started_at: chrono::DateTime<chrono::Utc>, rate_micros: u64) -> VirtualMachine {
        let mut billing = meshcloud_common::api::domain::VmBilling::default();
        billing.hourly_rate_crypto = Amount::from_micros(rate_micros);
        VirtualMachine {
            id: "vm1".into(),
            owner_id: "user1".into(),
            node_id: Some("n1".into()),
            name: "vm1-abcd".into(),
            spec: VmSpec {
                vm_type: VmType::General,
                vcpus: 2,
                mem_bytes: 4 << 30,
                disk_bytes: 50 << 30,
                quality_tier: QualityTier::Standard,
                image_id: "ubuntu-22.04".into(),
                region: None,
                max_price_per_hour: None,
            },
            status: VmStatus::Running,
            power_state: PowerState::Running,
            network_config: NetworkConfig::default(),
            billing,
            started_at: Some(started_at),
            updated_at: started_at,
            status_message: None,
            placement_attempts: 1,
        }
    }

    fn ticker(escrow: Arc<dyn EscrowClient>, store: Arc<DataStore>, attestation: Arc<AttestationTracker>) -> BillingTicker {
        BillingTicker::new(store, escrow, CommandBus::new(), attestation, 1_500, 20, 3)
    }

    #[tokio::test]
    async fn bills_a_verified_vm_for_its_elapsed_period() {
        let dir = tempdir::TempDir::new("meshcloud-billing-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        store.put_node(sample_node()).unwrap();

        let now = chrono::Utc::now();
        let started_at = now - chrono::Duration::minutes(10);
        store.put_vm(sample_vm(started_at, 120_000)).unwrap();

        let attestation = Arc::new(AttestationTracker::new(60));
        let mut samples = std::collections::HashMap::new();
        samples.insert(
            "vm1".to_string(),
            meshcloud_common::api::node_api::AttestationSample { valid: true, nonce: "n".into(), signature: "s".into() },
        );
        attestation.record_samples(&samples, now);

        let escrow: Arc<dyn EscrowClient> = Arc::new(FakeEscrow { confirmed_micros: AtomicU64::new(1_000_000) });
        let ticker = ticker(escrow, store.clone(), attestation);
        ticker.tick().await.unwrap();

        let vm = store.get_vm("vm1").unwrap();
        assert_eq!(vm.billing.verified_runtime_minutes, 10);
        assert_eq!(vm.billing.unverified_runtime_minutes, 0);
        assert!(vm.billing.last_billing_at.is_some());

        let usage = store.unpaid_usage_for_user("user1");
        assert_eq!(usage.len(), 1);
        // 120_000 micros/hour * 10/60 hour = 20_000 micros
        assert_eq!(usage[0].total_cost, Amount::from_micros(20_000));
    }

    #[tokio::test]
    async fn attestation_gap_is_tracked_as_unverified_with_no_usage_record() {
        let dir = tempdir::TempDir::new("meshcloud-billing-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        store.put_node(sample_node()).unwrap();

        let now = chrono::Utc::now();
        let started_at = now - chrono::Duration::minutes(15);
        store.put_vm(sample_vm(started_at, 120_000)).unwrap();

        // No samples ever recorded for this VM: liveness() treats it as stale.
        let attestation = Arc::new(AttestationTracker::new(60));

        let escrow: Arc<dyn EscrowClient> = Arc::new(FakeEscrow { confirmed_micros: AtomicU64::new(1_000_000) });
        let ticker = ticker(escrow, store.clone(), attestation);
        ticker.tick().await.unwrap();

        let vm = store.get_vm("vm1").unwrap();
        assert_eq!(vm.billing.unverified_runtime_minutes, 15);
        assert_eq!(vm.billing.verified_runtime_minutes, 0);
        assert!(store.unpaid_usage_for_user("user1").is_empty());
    }

    #[tokio::test]
    async fn sub_minute_period_is_skipped() {
        let dir = tempdir::TempDir::new("meshcloud-billing-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        store.put_node(sample_node()).unwrap();

        let now = chrono::Utc::now();
        store.put_vm(sample_vm(now - chrono::Duration::seconds(10), 120_000)).unwrap();

        let attestation = Arc::new(AttestationTracker::new(60));
        let escrow: Arc<dyn EscrowClient> = Arc::new(FakeEscrow { confirmed_micros: AtomicU64::new(1_000_000) });
        let ticker = ticker(escrow, store.clone(), attestation);
        ticker.tick().await.unwrap();

        let vm = store.get_vm("vm1").unwrap();
        assert!(vm.billing.last_billing_at.is_none());
        assert_eq!(vm.billing.unverified_runtime_minutes, 0);
        assert_eq!(vm.billing.verified_runtime_minutes, 0);
    }

    #[tokio::test]
    async fn out_of_funds_stops_the_vm_after_the_grace_period() {
        let dir = tempdir::TempDir::new("meshcloud-billing-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        store.put_node(sample_node()).unwrap();

        let started_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        store.put_vm(sample_vm(started_at, 120_000)).unwrap();

        let attestation = Arc::new(AttestationTracker::new(60));
        let mut samples = std::collections::HashMap::new();
        samples.insert(
            "vm1".to_string(),
            meshcloud_common::api::node_api::AttestationSample { valid: true, nonce: "n".into(), signature: "s".into() },
        );
        attestation.record_samples(&samples, chrono::Utc::now());

        // Confirmed balance is zero and there's no credit: every cycle fails.
        let escrow: Arc<dyn EscrowClient> = Arc::new(FakeEscrow { confirmed_micros: AtomicU64::new(0) });
        let ticker = ticker(escrow, store.clone(), attestation);

        // An insufficient-balance cycle never advances `last_billing_at`, so
        // each retry recomputes the same unpaid period and fails again.
        for _ in 0..4 {
            ticker.tick().await.unwrap();
        }

        let vm = store.get_vm("vm1").unwrap();
        assert_eq!(vm.billing.stopped_reason.as_deref(), Some("out_of_funds"));
        assert_eq!(vm.status, VmStatus::Stopping);
    }
}
