//! Scheduler (design §4.G): filter-then-score placement of a new VM spec
//! onto one of the registered nodes. Filtering and scoring are kept as
//! separate passes — first cut nodes that categorically cannot host the
//! spec, then rank what's left — so each stage stays independently
//! testable.

use meshcloud_common::api::domain::{Node, QualityTier, VmSpec};

use crate::config::{SchedulingWeights, TierMinimums};
use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy)]
pub struct ScoredNode<'a> {
    pub node: &'a Node,
    pub score: f64,
}

/// Nodes a spec is categorically disqualified from: insufficient benchmark
/// for the requested tier, insufficient free capacity under the tier's
/// overcommit ratio, or offline.
fn passes_filters(node: &Node, spec: &VmSpec, tier_minimums: &TierMinimums) -> bool {
    use meshcloud_common::api::domain::NodeStatus;

    if node.status != NodeStatus::Online {
        return false;
    }

    if node.hardware.benchmark_score < tier_minimums.for_tier(spec.quality_tier) {
        return false;
    }

    let overcommit_ratio = spec.quality_tier.default_cpu_overcommit_ratio();
    let effective_vcpus = (node.hardware.cpu_cores as f64 * overcommit_ratio) as u32;
    if node.free_vcpus(effective_vcpus) < spec.vcpus {
        return false;
    }

    if node.free_mem_bytes() < spec.mem_bytes {
        return false;
    }

    if node.free_disk_bytes() < spec.disk_bytes {
        return false;
    }

    if let Some(max_price) = spec.max_price_per_hour {
        if let Some(pricing) = &node.pricing {
            let hourly = pricing.cpu_per_hour + pricing.mem_per_gb_per_hour;
            if hourly > max_price {
                return false;
            }
        }
    }

    true
}

/// Composite score (design §4.G): higher is better. Each term is
/// normalized to roughly [0, 1] before weighting so no single dimension
/// dominates by virtue of its raw units.
fn score(node: &Node, weights: &SchedulingWeights) -> f64 {
    let load_fraction = if node.hardware.cpu_cores == 0 {
        1.0
    } else {
        node.allocated_vcpus as f64 / node.hardware.cpu_cores as f64
    };
    let load_score = (1.0 - load_fraction).clamp(0.0, 1.0);

    let performance_score = (node.performance_multiplier() / meshcloud_common::api::domain::MAX_BENCHMARK_MULTIPLIER)
        .clamp(0.0, 1.0);

    let latency_score = if node.nat_type == meshcloud_common::api::domain::NatType::Cgnat {
        0.5
    } else {
        1.0
    };

    let reputation_score = 1.0 - (node.system_vm_obligations.iter().map(|o| o.failure_count).sum::<u32>() as f64
        / 10.0)
        .clamp(0.0, 1.0);

    let price_score = match &node.pricing {
        Some(pricing) => {
            let hourly = (pricing.cpu_per_hour + pricing.mem_per_gb_per_hour).micros() as f64;
            (1.0 / (1.0 + hourly / 1_000_000.0)).clamp(0.0, 1.0)
        }
        None => 0.5,
    };

    weights.latency * latency_score
        + weights.load * load_score
        + weights.reputation * reputation_score
        + weights.price * price_score
        + weights.performance * performance_score
}

/// Picks the best node for `spec` among `nodes`. Ties are broken by higher
/// benchmark score, then lexicographically by node id, for a deterministic
/// outcome under identical load (design §4.G tie-break rule).
pub fn select_node<'a>(
    nodes: &'a [Node],
    spec: &VmSpec,
    weights: &SchedulingWeights,
    tier_minimums: &TierMinimums,
) -> Result<ScoredNode<'a>, SchedulerError> {
    let mut candidates: Vec<ScoredNode> = nodes
        .iter()
        .filter(|n| passes_filters(n, spec, tier_minimums))
        .map(|n| ScoredNode {
            node: n,
            score: score(n, weights),
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.node.hardware.benchmark_score.cmp(&a.node.hardware.benchmark_score))
            .then_with(|| a.node.id.cmp(&b.node.id))
    });

    candidates.into_iter().next().ok_or(SchedulerError::NoCapacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcloud_common::api::domain::{Hardware, NatType, NodeStatus, VmType};

    fn node(id: &str, benchmark: u32, allocated_vcpus: u32) -> Node {
        Node {
            id: id.to_string(),
            wallet_address: "0xabc".into(),
            public_ip: Some("1.2.3.4".into()),
            agent_port: 5100,
            nat_type: NatType::None,
            cgnat_info: None,
            relay_info: None,
            hardware: Hardware {
                cpu_cores: 8,
                mem_bytes: 32 << 30,
                disk_bytes: 500 << 30,
                benchmark_score: benchmark,
            },
            pricing: None,
            system_vm_obligations: vec![],
            last_heartbeat_at: chrono::Utc::now(),
            status: NodeStatus::Online,
            allocated_vcpus,
            allocated_mem_bytes: 0,
            allocated_disk_bytes: 0,
        }
    }

    fn spec(tier: QualityTier) -> VmSpec {
        VmSpec {
            vm_type: VmType::General,
            vcpus: 2,
            mem_bytes: 4 << 30,
            disk_bytes: 50 << 30,
            quality_tier: tier,
            image_id: "ubuntu-22.04".into(),
            region: None,
            max_price_per_hour: None,
        }
    }

    #[test]
    fn filters_out_nodes_below_tier_minimum_benchmark() {
        let nodes = vec![node("n1", 500, 0)];
        let result = select_node(&nodes, &spec(QualityTier::Guaranteed), &SchedulingWeights::default(), &TierMinimums::default());
        assert!(result.is_err());
    }

    #[test]
    fn prefers_less_loaded_node_when_scores_are_close() {
        let nodes = vec![node("n1", 2000, 6), node("n2", 2000, 0)];
        let result = select_node(&nodes, &spec(QualityTier::Burstable), &SchedulingWeights::default(), &TierMinimums::default()).unwrap();
        assert_eq!(result.node.id, "n2");
    }

    #[test]
    fn ties_break_by_benchmark_then_id() {
        let nodes = vec![node("b", 2000, 0), node("a", 2000, 0)];
        let result = select_node(&nodes, &spec(QualityTier::Burstable), &SchedulingWeights::default(), &TierMinimums::default()).unwrap();
        assert_eq!(result.node.id, "a");
    }

    #[test]
    fn no_capacity_when_all_nodes_full() {
        let nodes = vec![node("n1", 2000, 8)];
        let result = select_node(&nodes, &spec(QualityTier::Burstable), &SchedulingWeights::default(), &TierMinimums::default());
        assert!(matches!(result, Err(SchedulerError::NoCapacity)));
    }
}
