//! Command bus wire types (design §4.E, §9). Command kinds and ack result
//! payloads are tagged sum types — the design note calls out the source's
//! dynamic/dictionary-typed payloads as exactly the pattern to replace.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::api::domain::{PortProtocol, VmId, VmSpec};
use crate::time::Timestamp;

pub type CommandId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommandType {
    CreateVm {
        vm_id: VmId,
        spec: VmSpec,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ssh_key: Option<String>,
    },
    StartVm {
        vm_id: VmId,
    },
    StopVm {
        vm_id: VmId,
        reason: String,
    },
    RestartVm {
        vm_id: VmId,
    },
    DeleteVm {
        vm_id: VmId,
    },
    AllocatePort {
        vm_id: VmId,
        vm_port: u16,
        protocol: PortProtocol,
    },
    RunDht {
        vm_id: VmId,
    },
    RunRelay {
        vm_id: VmId,
    },
    ConfigureWireGuardPeer {
        vm_id: VmId,
        peer_public_key: String,
        tunnel_ip: String,
        relay_endpoint: String,
    },
}

impl CommandType {
    pub fn vm_id(&self) -> Option<&str> {
        match self {
            CommandType::CreateVm { vm_id, .. }
            | CommandType::StartVm { vm_id }
            | CommandType::StopVm { vm_id, .. }
            | CommandType::RestartVm { vm_id }
            | CommandType::DeleteVm { vm_id }
            | CommandType::AllocatePort { vm_id, .. }
            | CommandType::RunDht { vm_id }
            | CommandType::RunRelay { vm_id }
            | CommandType::ConfigureWireGuardPeer { vm_id, .. } => Some(vm_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandType::CreateVm { .. } => "create_vm",
            CommandType::StartVm { .. } => "start_vm",
            CommandType::StopVm { .. } => "stop_vm",
            CommandType::RestartVm { .. } => "restart_vm",
            CommandType::DeleteVm { .. } => "delete_vm",
            CommandType::AllocatePort { .. } => "allocate_port",
            CommandType::RunDht { .. } => "run_dht",
            CommandType::RunRelay { .. } => "run_relay",
            CommandType::ConfigureWireGuardPeer { .. } => "configure_wireguard_peer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CommandState {
    Queued,
    PushAttempted,
    Delivered,
    Acked,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub node_id: String,
    pub payload: CommandType,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub state: CommandState,
}

/// Discriminated union for the `data` field of an acknowledgment, keyed by
/// the originating command's type (design §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "commandType", rename_all = "camelCase")]
pub enum AckPayload {
    AllocatePort {
        vm_port: u16,
        public_port: u16,
        protocol: PortProtocol,
    },
    CreateVm {
        private_ip: String,
        mac_address: String,
    },
    Generic {
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRequest {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<AckPayload>,
}
