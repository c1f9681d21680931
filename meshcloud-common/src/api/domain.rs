//! Core aggregate roots (design §3). These are shared between the data
//! store, the reconcilers that own them, and the RPC layer that serializes
//! them to tenants/operators — one struct per aggregate, camelCase on the
//! wire, exactly as the teacher serializes its blockchain structs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::amount::Amount;
use crate::time::Timestamp;

pub type NodeId = String;
pub type VmId = String;
pub type UserId = String;
pub type ObligationId = String;
pub type UsageRecordId = String;

// ---------------------------------------------------------------- Node ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum NatType {
    None,
    FullCone,
    Symmetric,
    Cgnat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum NodeStatus {
    Online,
    Offline,
    Draining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CgnatInfo {
    pub assigned_relay_node_id: NodeId,
    pub tunnel_ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RelayStatus {
    Active,
    Draining,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayInfo {
    pub status: RelayStatus,
    pub capacity: u32,
    pub active_peers: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hardware {
    pub cpu_cores: u32,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub benchmark_score: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub cpu_per_hour: Amount,
    pub mem_per_gb_per_hour: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ObligationRole {
    Dht,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ObligationRoleStatus {
    Unsatisfied,
    Satisfying,
    Satisfied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemVmObligation {
    pub role: ObligationRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<VmId>,
    pub status: ObligationRoleStatus,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub wallet_address: String,
    pub public_ip: Option<String>,
    pub agent_port: u16,
    pub nat_type: NatType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgnat_info: Option<CgnatInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_info: Option<RelayInfo>,
    pub hardware: Hardware,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    pub system_vm_obligations: Vec<SystemVmObligation>,
    pub last_heartbeat_at: Timestamp,
    pub status: NodeStatus,
    /// Free-capacity accounting (not persisted on the aggregate root
    /// itself in the source design, but tracked alongside it so the
    /// scheduler never needs to recompute it from VM scans per request).
    pub allocated_vcpus: u32,
    pub allocated_mem_bytes: u64,
    pub allocated_disk_bytes: u64,
}

pub const MAX_BENCHMARK_MULTIPLIER: f64 = 3.0;
pub const BASELINE_BENCHMARK: f64 = 2000.0;

impl Node {
    /// Invariant from §3: performance multiplier = min(MaxMult,
    /// benchmarkScore / baselineBenchmark).
    pub fn performance_multiplier(&self) -> f64 {
        (self.hardware.benchmark_score as f64 / BASELINE_BENCHMARK)
            .min(MAX_BENCHMARK_MULTIPLIER)
            .max(0.0)
    }

    pub fn free_vcpus(&self, effective_vcpus: u32) -> u32 {
        effective_vcpus.saturating_sub(self.allocated_vcpus)
    }

    pub fn free_mem_bytes(&self) -> u64 {
        self.hardware.mem_bytes.saturating_sub(self.allocated_mem_bytes)
    }

    pub fn free_disk_bytes(&self) -> u64 {
        self.hardware.disk_bytes.saturating_sub(self.allocated_disk_bytes)
    }
}

// ----------------------------------------------------------------- VM -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum VmType {
    General,
    Dht,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum QualityTier {
    Burstable,
    Balanced,
    Standard,
    Guaranteed,
}

impl QualityTier {
    /// Minimum benchmark score for this tier (design §4.G defaults).
    pub fn minimum_benchmark(self) -> u32 {
        match self {
            QualityTier::Guaranteed => 4000,
            QualityTier::Standard => 2500,
            QualityTier::Balanced => 1500,
            QualityTier::Burstable => 1000,
        }
    }

    /// Default CPU overcommit ratio for this tier.
    pub fn default_cpu_overcommit_ratio(self) -> f64 {
        match self {
            QualityTier::Guaranteed => 1.0,
            QualityTier::Standard => 2.0,
            QualityTier::Balanced => 3.0,
            QualityTier::Burstable => 6.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    pub vm_type: VmType,
    pub vcpus: u32,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub quality_tier: QualityTier,
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price_per_hour: Option<Amount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicPortMapping {
    pub vm_port: u16,
    pub public_port: u16,
    pub protocol: PortProtocol,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    pub public_port_mappings: Vec<PublicPortMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmBilling {
    pub hourly_rate_crypto: Amount,
    pub total_billed: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_billing_at: Option<Timestamp>,
    pub verified_runtime_minutes: u64,
    pub unverified_runtime_minutes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    pub consecutive_billing_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum VmStatus {
    Pending,
    Placing,
    Provisioning,
    Running,
    Stopping,
    Deleting,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub id: VmId,
    pub owner_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub name: String,
    pub spec: VmSpec,
    pub status: VmStatus,
    pub power_state: PowerState,
    pub network_config: NetworkConfig,
    pub billing: VmBilling,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    pub updated_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub placement_attempts: u32,
}

// ------------------------------------------------------------ Obligation --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ObligationType {
    NodeRunDht,
    NodeRunRelay,
    NodeAssignRelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ObligationState {
    Pending,
    InFlight,
    Completed,
    Failed,
    RetryScheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obligation {
    pub id: ObligationId,
    #[serde(rename = "type")]
    pub kind: ObligationType,
    pub resource_id: String,
    pub state: ObligationState,
    pub next_attempt_at: Timestamp,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ------------------------------------------------------------ UsageRecord -

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: UsageRecordId,
    pub vm_id: VmId,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub period_start: Timestamp,
    pub period_end: Timestamp,
    pub total_cost: Amount,
    pub node_share: Amount,
    pub platform_fee: Amount,
    pub attestation_verified: bool,
    pub settled_on_chain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<String>,
}

impl UsageRecord {
    pub fn new(
        id: UsageRecordId,
        vm_id: VmId,
        user_id: UserId,
        node_id: NodeId,
        period_start: Timestamp,
        period_end: Timestamp,
        total_cost: Amount,
        platform_fee_bps: u32,
    ) -> Self {
        let (node_share, platform_fee) = total_cost.split_fee(platform_fee_bps);
        Self {
            id,
            vm_id,
            user_id,
            node_id,
            period_start,
            period_end,
            total_cost,
            node_share,
            platform_fee,
            attestation_verified: true,
            settled_on_chain: false,
            settlement_tx_hash: None,
        }
    }
}

// --------------------------------------------------------- PendingDeposit -

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeposit {
    pub tx_hash: String,
    pub wallet_address: String,
    pub amount: Amount,
    pub block_number: u64,
    pub confirmations: u64,
    pub chain_id: u64,
}

// ------------------------------------------------------------------ Route -

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RouteStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub subdomain: String,
    pub vm_id: VmId,
    pub node_public_ip: String,
    pub vm_private_ip: String,
    pub target_port: u16,
    pub status: RouteStatus,
}

// ------------------------------------------------------------ CreditGrant -

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CreditGrantType {
    Promo,
    Referral,
    Goodwill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditGrant {
    pub id: String,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: CreditGrantType,
    pub original_amount: Amount,
    pub remaining_amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

/// FIFO-by-expiry ordering for credit consumption (design §3): grants that
/// expire soonest are spent first; grants with no expiry sort last.
pub fn sort_credits_for_consumption(grants: &mut [CreditGrant]) {
    grants.sort_by(|a, b| match (a.expires_at, b.expires_at) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

pub type ReferralRedemptions = HashMap<UserId, String>;
