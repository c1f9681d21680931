//! Obligation reconciler (design §4.I): ticks over `Pending`/`RetryScheduled`
//! obligations whose `nextAttemptAt` has passed, dispatches each to a typed
//! handler, and applies the retry/backoff policy to the result. Grounded on
//! the teacher's `a2a::registry` health-failure counters and
//! `escrow::auto_release` ticker loop.

use std::sync::Arc;

use meshcloud_common::api::domain::{Node, Obligation, ObligationState, ObligationType};
use meshcloud_common::task::spawn_task;

use crate::commands::CommandBus;
use crate::error::StoreError;
use crate::relay::RelayManager;
use crate::store::DataStore;

const MAX_ATTEMPTS: u32 = 8;

pub enum HandlerOutcome {
    Completed,
    Retry { error: String },
    Fail { error: String },
}

pub struct ObligationReconciler {
    store: Arc<DataStore>,
    commands: Arc<CommandBus>,
    relay: Arc<RelayManager>,
}

impl ObligationReconciler {
    pub fn new(store: Arc<DataStore>, commands: Arc<CommandBus>, relay: Arc<RelayManager>) -> Self {
        Self { store, commands, relay }
    }

    /// Registers the system-VM obligations a freshly onboarded node must
    /// satisfy: `node.run-dht` for every node, and `node.assign-relay` when
    /// the node is behind CGNAT and so needs a relay assigned to it before
    /// it can be reached at all (design §4.I bootstrap rule). `node.run-relay`
    /// is deliberately not created here — it's only owed once the node
    /// meets relay-hosting criteria, via `create_run_relay_obligation`.
    pub fn bootstrap_for_node(&self, node: &Node) -> Result<(), StoreError> {
        let now = chrono::Utc::now();
        self.put_new(node, ObligationType::NodeRunDht, now)?;
        if node.nat_type == meshcloud_common::api::domain::NatType::Cgnat {
            self.put_new(node, ObligationType::NodeAssignRelay, now)?;
        }
        Ok(())
    }

    /// Owed once a node meets relay-hosting criteria (design §4.I: "on relay
    /// criteria met, create node.run-relay") — a publicly reachable node,
    /// i.e. one that isn't itself behind CGNAT and so can accept inbound
    /// WireGuard peers. Idempotent: a no-op if the obligation already exists.
    pub fn create_run_relay_obligation_if_eligible(&self, node: &Node) -> Result<(), StoreError> {
        if node.nat_type == meshcloud_common::api::domain::NatType::Cgnat || node.public_ip.is_none() {
            return Ok(());
        }
        let id = obligation_id(node, ObligationType::NodeRunRelay);
        if self.store.get_obligation(&id).is_some() {
            return Ok(());
        }
        self.put_new(node, ObligationType::NodeRunRelay, chrono::Utc::now())
    }

    fn put_new(&self, node: &Node, kind: ObligationType, now: chrono::DateTime<chrono::Utc>) -> Result<(), StoreError> {
        let obligation = Obligation {
            id: obligation_id(node, kind),
            kind,
            resource_id: node.id.clone(),
            state: ObligationState::Pending,
            next_attempt_at: now,
            attempts: 0,
            last_error: None,
        };
        self.store.put_obligation(obligation)
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        let now = chrono::Utc::now();
        for mut obligation in self.store.due_obligations(now) {
            obligation.state = ObligationState::InFlight;
            obligation.attempts += 1;
            self.store.put_obligation(obligation.clone())?;

            let outcome = self.dispatch(&obligation).await;
            self.apply_outcome(obligation, outcome, now)?;
        }
        Ok(())
    }

    async fn dispatch(&self, obligation: &Obligation) -> HandlerOutcome {
        let Some(node) = self.store.get_node(&obligation.resource_id) else {
            return HandlerOutcome::Fail { error: "node no longer registered".into() };
        };

        match obligation.kind {
            ObligationType::NodeRunDht => {
                self.commands
                    .enqueue(&node, meshcloud_common::api::command::CommandType::RunDht { vm_id: node.id.clone() })
                    .await;
                HandlerOutcome::Completed
            }
            ObligationType::NodeRunRelay => {
                self.commands
                    .enqueue(&node, meshcloud_common::api::command::CommandType::RunRelay { vm_id: node.id.clone() })
                    .await;
                HandlerOutcome::Completed
            }
            ObligationType::NodeAssignRelay => match self.relay.assign(&node).await {
                Ok(()) => HandlerOutcome::Completed,
                Err(err) if obligation.attempts >= MAX_ATTEMPTS => {
                    HandlerOutcome::Fail { error: err.to_string() }
                }
                Err(err) => HandlerOutcome::Retry { error: err.to_string() },
            },
        }
    }

    fn apply_outcome(
        &self,
        mut obligation: Obligation,
        outcome: HandlerOutcome,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        match outcome {
            HandlerOutcome::Completed => {
                obligation.state = ObligationState::Completed;
                obligation.last_error = None;
            }
            HandlerOutcome::Retry { error } => {
                let backoff_secs = backoff_secs(obligation.attempts);
                obligation.state = ObligationState::RetryScheduled;
                obligation.next_attempt_at = now + chrono::Duration::seconds(backoff_secs);
                obligation.last_error = Some(error);
            }
            HandlerOutcome::Fail { error } => {
                obligation.state = ObligationState::Failed;
                obligation.last_error = Some(error);
            }
        }
        self.store.put_obligation(obligation)
    }
}

fn obligation_id(node: &Node, kind: ObligationType) -> String {
    format!("{}-{:?}", node.id, kind)
}

/// Exponential backoff capped at 10 minutes (design §4.I): `2^attempts`
/// seconds, bounded so a flapping obligation doesn't retry every few
/// milliseconds nor wait an unbounded amount of time.
fn backoff_secs(attempts: u32) -> i64 {
    let raw = 2i64.saturating_pow(attempts.min(20));
    raw.min(600)
}

pub fn spawn(reconciler: Arc<ObligationReconciler>, interval_secs: u64) {
    spawn_task("obligation-reconciler", async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(err) = reconciler.tick().await {
                log::warn!("obligation reconciler tick failed: {err:#}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcloud_common::api::domain::{Hardware, NatType, NodeStatus};

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(10), 600);
        assert_eq!(backoff_secs(100), 600);
    }

    fn sample_node(id: &str, nat_type: NatType, public_ip: Option<&str>) -> Node {
        Node {
            id: id.to_string(),
            wallet_address: "0xabc".into(),
            public_ip: public_ip.map(str::to_string),
            agent_port: 5100,
            nat_type,
            cgnat_info: None,
            relay_info: None,
            hardware: Hardware { cpu_cores: 4, mem_bytes: 8 << 30, disk_bytes: 100 << 30, benchmark_score: 2000 },
            pricing: None,
            system_vm_obligations: vec![],
            last_heartbeat_at: chrono::Utc::now(),
            status: NodeStatus::Online,
            allocated_vcpus: 0,
            allocated_mem_bytes: 0,
            allocated_disk_bytes: 0,
        }
    }

    fn reconciler(store: Arc<DataStore>) -> ObligationReconciler {
        let commands = CommandBus::new();
        let relay = Arc::new(RelayManager::new(store.clone(), commands.clone()));
        ObligationReconciler::new(store, commands, relay)
    }

    #[test]
    fn bootstrap_creates_run_dht_and_assign_relay_for_a_cgnat_node_but_not_run_relay() {
        let dir = tempdir::TempDir::new("meshcloud-obligations-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let node = sample_node("n1", NatType::Cgnat, None);

        let reconciler = reconciler(store.clone());
        reconciler.bootstrap_for_node(&node).unwrap();

        assert!(store.get_obligation("n1-NodeRunDht").is_some());
        assert!(store.get_obligation("n1-NodeAssignRelay").is_some());
        assert!(store.get_obligation("n1-NodeRunRelay").is_none());
    }

    #[test]
    fn bootstrap_creates_only_run_dht_for_a_directly_reachable_node() {
        let dir = tempdir::TempDir::new("meshcloud-obligations-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let node = sample_node("n2", NatType::None, Some("1.2.3.4"));

        let reconciler = reconciler(store.clone());
        reconciler.bootstrap_for_node(&node).unwrap();

        assert!(store.get_obligation("n2-NodeRunDht").is_some());
        assert!(store.get_obligation("n2-NodeAssignRelay").is_none());
        assert!(store.get_obligation("n2-NodeRunRelay").is_none());
    }

    #[test]
    fn run_relay_obligation_is_created_only_for_eligible_nodes_and_is_idempotent() {
        let dir = tempdir::TempDir::new("meshcloud-obligations-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let reconciler = reconciler(store.clone());

        let cgnat_node = sample_node("n3", NatType::Cgnat, None);
        reconciler.create_run_relay_obligation_if_eligible(&cgnat_node).unwrap();
        assert!(store.get_obligation("n3-NodeRunRelay").is_none());

        let relay_capable = sample_node("n4", NatType::FullCone, Some("9.9.9.9"));
        reconciler.create_run_relay_obligation_if_eligible(&relay_capable).unwrap();
        let first = store.get_obligation("n4-NodeRunRelay").unwrap();

        reconciler.create_run_relay_obligation_if_eligible(&relay_capable).unwrap();
        let second = store.get_obligation("n4-NodeRunRelay").unwrap();
        assert_eq!(first.attempts, second.attempts, "re-running must not replace the existing obligation");
    }
}
