//! Browser-facing event stream (`/hub/orchestrator`, design §A3.1).

use serde::{Deserialize, Serialize};

use crate::api::domain::{NodeId, UserId, VmId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OrchestratorEvent {
    VmStarted {
        vm_id: VmId,
        owner_id: UserId,
        node_id: NodeId,
    },
    VmStopped {
        vm_id: VmId,
        owner_id: UserId,
        reason: String,
    },
    VmStatusChanged {
        vm_id: VmId,
        owner_id: UserId,
        status: String,
    },
    NodeOffline {
        node_id: NodeId,
    },
    ObligationFailed {
        obligation_id: String,
        resource_id: String,
        reason: String,
    },
    BalanceChanged {
        owner_id: UserId,
    },
}

impl OrchestratorEvent {
    /// The owner this event should be delivered to, if any — system-wide
    /// events (node health) have no single owner and are not tenant-scoped.
    pub fn owner(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::VmStarted { owner_id, .. }
            | OrchestratorEvent::VmStopped { owner_id, .. }
            | OrchestratorEvent::VmStatusChanged { owner_id, .. }
            | OrchestratorEvent::BalanceChanged { owner_id } => Some(owner_id),
            OrchestratorEvent::NodeOffline { .. } | OrchestratorEvent::ObligationFailed { .. } => {
                None
            }
        }
    }
}
