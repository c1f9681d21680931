//! Node agent ↔ orchestrator wire types (design §6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::api::domain::{Hardware, NatType, PowerState, VmId};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub node_id: String,
    pub wallet_address: String,
    pub hardware: Hardware,
    pub nat_type: NatType,
    pub agent_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeResponse {
    pub node_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationSample {
    pub valid: bool,
    pub nonce: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_used_cores: f64,
    pub mem_used_bytes: u64,
    pub disk_used_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub power_states: HashMap<VmId, PowerState>,
    pub resource_usage: ResourceUsage,
    pub attestation: HashMap<VmId, AttestationSample>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub accepted: bool,
}
