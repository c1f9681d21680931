//! Command bus (design §4.E): push/pull hybrid delivery of orchestrator
//! commands to node agents. Grounded on the teacher's
//! `p2p::tracker::request` correlation pattern (a pending-request map keyed
//! by id, resolved by an incoming callback) and `rpc::mod` for the HTTP
//! surface the pull path rides on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshcloud_common::api::command::{AcknowledgeRequest, Command, CommandState, CommandType};
use meshcloud_common::api::domain::Node;
use tokio::sync::{broadcast, Mutex};

use crate::config::COMMAND_PUSH_TIMEOUT_SECS;
use crate::error::CommandBusError;

/// Outcome delivered to whoever enqueued a command and is awaiting its ack.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command_id: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub data: Option<meshcloud_common::api::command::AckPayload>,
}

/// Per-node FIFO queue plus a broadcast channel for ack correlation — the
/// same shape as the teacher's pending-request table, but one queue per
/// node instead of one global map, since delivery order must be
/// per-node-FIFO (design §4.E invariant).
struct NodeQueue {
    pending: VecDeque<Command>,
    in_flight: std::collections::HashMap<String, Command>,
}

impl NodeQueue {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: std::collections::HashMap::new(),
        }
    }
}

pub struct CommandBus {
    queues: DashMap<String, Mutex<NodeQueue>>,
    outcomes: broadcast::Sender<CommandOutcome>,
    http: reqwest::Client,
}

impl CommandBus {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            queues: DashMap::new(),
            outcomes: tx,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(COMMAND_PUSH_TIMEOUT_SECS))
                .build()
                .expect("command bus http client"),
        })
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<CommandOutcome> {
        self.outcomes.subscribe()
    }

    /// Enqueues a command for a node and attempts an immediate push. If the
    /// push fails (agent unreachable, e.g. CGNAT with no open port), the
    /// command stays queued for the agent's next long-poll pull.
    pub async fn enqueue(&self, node: &Node, payload: CommandType) -> Command {
        let command = Command {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node.id.clone(),
            payload,
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(10),
            state: CommandState::Queued,
        };

        {
            let entry = self.queues.entry(node.id.clone()).or_insert_with(|| Mutex::new(NodeQueue::new()));
            let mut queue = entry.lock().await;
            queue.pending.push_back(command.clone());
        }

        self.try_push(node).await;
        command
    }

    /// Best-effort push to a node with a directly reachable agent port.
    /// Failures are swallowed here; the pull path is the fallback of
    /// record, not an error condition.
    async fn try_push(&self, node: &Node) {
        let Some(public_ip) = node.public_ip.as_ref() else {
            return;
        };

        let next = {
            let Some(entry) = self.queues.get(&node.id) else {
                return;
            };
            let mut queue = entry.lock().await;
            queue.pending.front().cloned()
        };

        let Some(command) = next else {
            return;
        };

        let url = format!("http://{}:{}/commands/receive", public_ip, node.agent_port);
        match self.http.post(&url).json(&command).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.move_to_in_flight(&node.id, &command.id, CommandState::PushAttempted).await;
            }
            _ => {
                log::debug!("push to node {} failed, leaving command {} for pull", node.id, command.id);
            }
        }
    }

    async fn move_to_in_flight(&self, node_id: &str, command_id: &str, state: CommandState) {
        let Some(entry) = self.queues.get(node_id) else {
            return;
        };
        let mut queue = entry.lock().await;
        if let Some(pos) = queue.pending.iter().position(|c| c.id == command_id) {
            let mut command = queue.pending.remove(pos).unwrap();
            command.state = state;
            queue.in_flight.insert(command.id.clone(), command);
        }
    }

    /// Long-poll pull path: returns the node's queued-and-not-yet-delivered
    /// commands, moving them to in-flight so a second concurrent poll
    /// doesn't double-deliver.
    pub async fn pull_pending(&self, node_id: &str) -> Vec<Command> {
        let Some(entry) = self.queues.get(node_id) else {
            return vec![];
        };
        let mut queue = entry.lock().await;
        let drained: Vec<Command> = queue.pending.drain(..).collect();
        for mut command in drained.clone() {
            command.state = CommandState::Delivered;
            queue.in_flight.insert(command.id.clone(), command);
        }
        drained
    }

    /// Handles an agent's acknowledgment of a command, removing it from
    /// in-flight tracking and broadcasting the outcome to whoever enqueued
    /// it (the lifecycle manager, the relay manager, ...).
    pub async fn acknowledge(
        &self,
        node_id: &str,
        command_id: &str,
        ack: AcknowledgeRequest,
    ) -> Result<Command, CommandBusError> {
        let Some(entry) = self.queues.get(node_id) else {
            return Err(CommandBusError::Unreachable(node_id.to_string()));
        };
        let removed = {
            let mut queue = entry.lock().await;
            queue.in_flight.remove(command_id)
        };

        let Some(removed) = removed else {
            return Err(CommandBusError::AlreadyAcked(command_id.to_string()));
        };

        let outcome = CommandOutcome {
            command_id: command_id.to_string(),
            success: ack.success,
            error_message: ack.error_message,
            data: ack.data,
        };
        let _ = self.outcomes.send(outcome);
        Ok(removed)
    }

    /// Commands whose `expires_at` has passed without an ack — callers
    /// mark these failed and decide whether to retry.
    pub async fn expire_stale(&self, node_id: &str, now: chrono::DateTime<chrono::Utc>) -> Vec<Command> {
        let Some(entry) = self.queues.get(node_id) else {
            return vec![];
        };
        let mut queue = entry.lock().await;
        let expired: Vec<String> = queue
            .in_flight
            .iter()
            .filter(|(_, c)| c.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| queue.in_flight.remove(&id))
            .collect()
    }

    /// Sweeps every node's in-flight set for stale commands, so a node that
    /// goes quiet mid-delivery doesn't pin its commands in-flight forever.
    async fn expire_all_stale(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<Command> {
        let node_ids: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        let mut expired = Vec::new();
        for node_id in node_ids {
            expired.extend(self.expire_stale(&node_id, now).await);
        }
        expired
    }
}

/// Periodically purges commands that were delivered but never acked before
/// `expires_at` (design §4.E) — without this, a node that drops offline
/// mid-delivery leaves its commands in-flight indefinitely.
pub fn spawn(bus: Arc<CommandBus>, interval_secs: u64) {
    meshcloud_common::task::spawn_task("command-bus-expiry", async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            for command in bus.expire_all_stale(chrono::Utc::now()).await {
                log::warn!(
                    "command {} ({}) to node {} expired without an ack",
                    command.id,
                    command.payload.name(),
                    command.node_id,
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcloud_common::api::domain::{Hardware, NatType, NodeStatus};

    fn sample_node() -> Node {
        Node {
            id: "n1".into(),
            wallet_address: "0xabc".into(),
            public_ip: None,
            agent_port: 5100,
            nat_type: NatType::Cgnat,
            cgnat_info: None,
            relay_info: None,
            hardware: Hardware {
                cpu_cores: 4,
                mem_bytes: 8 << 30,
                disk_bytes: 100 << 30,
                benchmark_score: 2000,
            },
            pricing: None,
            system_vm_obligations: vec![],
            last_heartbeat_at: chrono::Utc::now(),
            status: NodeStatus::Online,
            allocated_vcpus: 0,
            allocated_mem_bytes: 0,
            allocated_disk_bytes: 0,
        }
    }

    #[tokio::test]
    async fn enqueued_command_is_pulled_exactly_once() {
        let bus = CommandBus::new();
        let node = sample_node();
        bus.enqueue(&node, CommandType::StartVm { vm_id: "vm1".into() }).await;

        let first_pull = bus.pull_pending(&node.id).await;
        assert_eq!(first_pull.len(), 1);

        let second_pull = bus.pull_pending(&node.id).await;
        assert!(second_pull.is_empty());
    }

    #[tokio::test]
    async fn acknowledge_removes_from_in_flight_and_broadcasts() {
        let bus = CommandBus::new();
        let node = sample_node();
        let command = bus.enqueue(&node, CommandType::StartVm { vm_id: "vm1".into() }).await;
        bus.pull_pending(&node.id).await;

        let mut outcomes = bus.subscribe_outcomes();
        bus.acknowledge(
            &node.id,
            &command.id,
            AcknowledgeRequest {
                success: true,
                error_message: None,
                data: None,
            },
        )
        .await
        .unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.command_id, command.id);
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn acknowledge_returns_the_original_command_so_the_caller_can_dispatch_on_its_type() {
        let bus = CommandBus::new();
        let node = sample_node();
        let command = bus.enqueue(&node, CommandType::DeleteVm { vm_id: "vm1".into() }).await;
        bus.pull_pending(&node.id).await;

        let acked = bus
            .acknowledge(&node.id, &command.id, AcknowledgeRequest { success: true, error_message: None, data: None })
            .await
            .unwrap();

        match acked.payload {
            CommandType::DeleteVm { vm_id } => assert_eq!(vm_id, "vm1"),
            other => panic!("expected DeleteVm, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn double_acknowledge_errors() {
        let bus = CommandBus::new();
        let node = sample_node();
        let command = bus.enqueue(&node, CommandType::StartVm { vm_id: "vm1".into() }).await;
        bus.pull_pending(&node.id).await;

        let ack = AcknowledgeRequest {
            success: true,
            error_message: None,
            data: None,
        };
        bus.acknowledge(&node.id, &command.id, ack.clone()).await.unwrap();
        let result = bus.acknowledge(&node.id, &command.id, ack).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn expire_all_stale_purges_every_node_past_its_deadline() {
        let bus = CommandBus::new();
        let node = sample_node();
        let command = bus.enqueue(&node, CommandType::StartVm { vm_id: "vm1".into() }).await;
        bus.pull_pending(&node.id).await;

        let not_yet = bus.expire_all_stale(chrono::Utc::now()).await;
        assert!(not_yet.is_empty());

        let past_deadline = chrono::Utc::now() + chrono::Duration::minutes(11);
        let expired = bus.expire_all_stale(past_deadline).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, command.id);

        let result = bus
            .acknowledge(&node.id, &command.id, AcknowledgeRequest { success: true, error_message: None, data: None })
            .await;
        assert!(result.is_err(), "expired command must already be gone from in_flight");
    }
}
