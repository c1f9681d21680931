//! Orchestrator configuration: CLI flags (clap) plus the tunables that the
//! design calls out as needing to be overridable at runtime rather than
//! baked in as constants (scheduling weights, quality-tier minimums — see
//! SPEC_FULL §A4).

use clap::Parser;
use meshcloud_common::api::domain::QualityTier;

// -----------------------------------------------------------------------
// Timeouts and intervals (design §5)
// -----------------------------------------------------------------------

pub const COMMAND_PUSH_TIMEOUT_SECS: u64 = 5;
pub const PROXY_UPSTREAM_DIAL_TIMEOUT_SECS: u64 = 30;
pub const ESCROW_RPC_TIMEOUT_SECS: u64 = 10;
pub const HEARTBEAT_DEADLINE_SECS: i64 = 90;
/// Expected spacing between node heartbeats; the heartbeat deadline is 3x
/// this (design §5), and the attestation tracker's own staleness rule
/// reuses the same multiplier against this same interval (design §4.F).
pub const HEARTBEAT_SAMPLE_INTERVAL_SECS: i64 = HEARTBEAT_DEADLINE_SECS / 3;
pub const BILLING_CYCLE_SECS: u64 = 5 * 60;
pub const DEPOSIT_SCAN_INTERVAL_SECS: u64 = 30;
pub const OBLIGATION_SCAN_INTERVAL_SECS: u64 = 10;
pub const DEPOSIT_SCAN_MAX_BLOCK_WINDOW: u64 = 100;
pub const SETTLEMENT_BATCH_MAX_ITEMS: usize = 100;
pub const ATTESTATION_STALE_MULTIPLIER: i64 = 3;
pub const ATTESTATION_CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;
pub const WEBSOCKET_SECURITY_CLEANUP_INTERVAL_SECS: u64 = 120;
pub const DELETING_TIMEOUT_SECS: i64 = 10 * 60;
pub const LIFECYCLE_RECONCILE_INTERVAL_SECS: u64 = 60;
pub const COMMAND_EXPIRY_SWEEP_INTERVAL_SECS: u64 = 60;

/// Weights for the scheduler's composite score (design §4.G). Exposed on
/// `Config` (not compile-time constants) so operators can retune without a
/// rebuild — the analogue of the source's `ISchedulingConfigService`.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingWeights {
    pub latency: f64,
    pub load: f64,
    pub reputation: f64,
    pub price: f64,
    pub performance: f64,
}

impl Default for SchedulingWeights {
    fn default() -> Self {
        Self {
            latency: 0.25,
            load: 0.25,
            reputation: 0.2,
            price: 0.15,
            performance: 0.15,
        }
    }
}

/// Minimum benchmark score per quality tier (design §4.G defaults).
/// Overridable at startup; the `QualityTier::minimum_benchmark` constants
/// are the fallback when a config override isn't supplied.
#[derive(Debug, Clone, Copy)]
pub struct TierMinimums {
    pub guaranteed: u32,
    pub standard: u32,
    pub balanced: u32,
    pub burstable: u32,
}

impl Default for TierMinimums {
    fn default() -> Self {
        Self {
            guaranteed: QualityTier::Guaranteed.minimum_benchmark(),
            standard: QualityTier::Standard.minimum_benchmark(),
            balanced: QualityTier::Balanced.minimum_benchmark(),
            burstable: QualityTier::Burstable.minimum_benchmark(),
        }
    }
}

impl TierMinimums {
    pub fn for_tier(&self, tier: QualityTier) -> u32 {
        match tier {
            QualityTier::Guaranteed => self.guaranteed,
            QualityTier::Standard => self.standard,
            QualityTier::Balanced => self.balanced,
            QualityTier::Burstable => self.burstable,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "meshcloudd")]
#[command(about = "meshcloud orchestrator control plane", long_about = None)]
pub struct Args {
    /// Tenant/agent HTTP API bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub rpc_bind_address: String,

    /// Path to the sled database directory backing the data store.
    #[arg(long, default_value = "./meshcloud-data")]
    pub data_dir: String,

    /// Escrow contract JSON-RPC endpoint.
    #[arg(long, default_value = "http://127.0.0.1:8545")]
    pub escrow_rpc_url: String,

    /// Number of block confirmations required before a deposit is
    /// considered final (design §4.D).
    #[arg(long, default_value_t = 20)]
    pub required_confirmations: u64,

    /// Platform fee in basis points (design §4.B, §6).
    #[arg(long, default_value_t = meshcloud_common::amount::PLATFORM_FEE_BPS)]
    pub platform_fee_bps: u32,

    /// Consecutive failed billing cycles before a VM is stopped for
    /// out-of-funds (design §A4 — resolves the undocumented grace period).
    #[arg(long, default_value_t = 3)]
    pub out_of_funds_grace_cycles: u32,

    /// Minimum aggregate amount (in micros) before a settlement batch for
    /// a (user, node) pair is worth submitting on-chain.
    #[arg(long, default_value_t = 1_000_000)]
    pub min_settlement_amount_micros: u64,

    /// Hours between settlement ticker runs.
    #[arg(long, default_value_t = 6)]
    pub settlement_interval_hours: u64,

    /// Enable the batch settlement path instead of one tx per group.
    #[arg(long, default_value_t = true)]
    pub settlement_batching_enabled: bool,

    /// Prometheus metrics route; empty disables the endpoint.
    #[arg(long, default_value = "/metrics")]
    pub prometheus_route: String,

    #[arg(long, default_value_t = false)]
    pub prometheus_enable: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub args: Args,
    pub scheduling_weights: SchedulingWeights,
    pub tier_minimums: TierMinimums,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        Self {
            args,
            scheduling_weights: SchedulingWeights::default(),
            tier_minimums: TierMinimums::default(),
        }
    }
}
