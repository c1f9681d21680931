//! Node agent ↔ orchestrator HTTP API (design §6): registration,
//! heartbeats, and the command-bus pull/ack endpoints.

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use meshcloud_common::api::command::{AckPayload, CommandType};
use meshcloud_common::api::domain::{Node, NodeStatus};
use meshcloud_common::api::node_api::{
    HeartbeatRequest, HeartbeatResponse, RegisterNodeRequest, RegisterNodeResponse,
};
use meshcloud_common::{AppError, AppResult};

use crate::rpc::auth::AuthenticatedNode;
use crate::rpc::state::AppState;

pub async fn register_node(
    state: web::Data<Arc<AppState>>,
    payload: web::Json<RegisterNodeRequest>,
) -> AppResult<HttpResponse> {
    let req = payload.into_inner();

    let node = Node {
        id: req.node_id.clone(),
        wallet_address: req.wallet_address,
        public_ip: req.public_ip,
        agent_port: req.agent_port,
        nat_type: req.nat_type,
        cgnat_info: None,
        relay_info: None,
        hardware: req.hardware,
        pricing: None,
        system_vm_obligations: vec![],
        last_heartbeat_at: chrono::Utc::now(),
        status: NodeStatus::Online,
        allocated_vcpus: 0,
        allocated_mem_bytes: 0,
        allocated_disk_bytes: 0,
    };

    state.store.put_node(node).map_err(AppError::from)?;
    let node = state.store.get_node(&req.node_id).unwrap();
    state.obligations.bootstrap_for_node(&node).map_err(AppError::from)?;
    state.obligations.create_run_relay_obligation_if_eligible(&node).map_err(AppError::from)?;

    if req.nat_type == meshcloud_common::api::domain::NatType::Cgnat {
        state.relay.assign(&node).await.map_err(AppError::from)?;
    }

    Ok(HttpResponse::Ok().json(RegisterNodeResponse { node_id: req.node_id, accepted: true }))
}

pub async fn heartbeat(
    node: AuthenticatedNode,
    state: web::Data<Arc<AppState>>,
    payload: web::Json<HeartbeatRequest>,
) -> AppResult<HttpResponse> {
    let req = payload.into_inner();
    let mut stored_node = state
        .store
        .get_node(&node.node_id)
        .ok_or_else(|| AppError::not_found("NODE_NOT_FOUND", "node not registered"))?;

    stored_node.last_heartbeat_at = chrono::Utc::now();
    stored_node.status = NodeStatus::Online;
    stored_node.allocated_vcpus = (req.resource_usage.cpu_used_cores.ceil()) as u32;
    stored_node.allocated_mem_bytes = req.resource_usage.mem_used_bytes;
    stored_node.allocated_disk_bytes = req.resource_usage.disk_used_bytes;
    let node_public_ip = stored_node.public_ip.clone().unwrap_or_default();
    state.store.put_node(stored_node).map_err(AppError::from)?;

    state.attestation.record_samples(&req.attestation, chrono::Utc::now());
    for (vm_id, power_state) in req.power_states {
        let Some(mut vm) = state.store.get_vm(&vm_id) else { continue };
        if vm.status == meshcloud_common::api::domain::VmStatus::Deleting {
            if state
                .lifecycle
                .recover_false_positive_deleting(&vm_id, power_state, &node_public_ip)
                .await
                .map_err(AppError::from)?
            {
                continue;
            }
        }
        vm.power_state = power_state;
        vm.updated_at = chrono::Utc::now();
        state.store.put_vm(vm).map_err(AppError::from)?;
    }

    Ok(HttpResponse::Ok().json(HeartbeatResponse { accepted: true }))
}

pub async fn pull_commands(node: AuthenticatedNode, state: web::Data<Arc<AppState>>) -> HttpResponse {
    let commands = state.commands.pull_pending(&node.node_id).await;
    HttpResponse::Ok().json(commands)
}

/// Forwards an acked command's result to its typed handler (design §4.E):
/// the command bus only knows delivery state, so dispatch on the
/// *original* command's type tells the lifecycle manager what to do with
/// the ack's `data` payload.
pub async fn acknowledge_command(
    node: AuthenticatedNode,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    payload: web::Json<meshcloud_common::api::command::AcknowledgeRequest>,
) -> AppResult<HttpResponse> {
    let command_id = path.into_inner();
    let ack = payload.into_inner();
    let success = ack.success;
    let data = ack.data.clone();

    let command = state
        .commands
        .acknowledge(&node.node_id, &command_id, ack)
        .await
        .map_err(AppError::from)?;

    if !success {
        log::warn!(
            "node {} reported failure for command {} ({})",
            node.node_id,
            command_id,
            command.payload.name()
        );
        return Ok(HttpResponse::Ok().finish());
    }

    let node_public_ip = state.store.get_node(&node.node_id).and_then(|n| n.public_ip).unwrap_or_default();

    match command.payload {
        CommandType::CreateVm { vm_id, .. } => {
            if let Some(AckPayload::CreateVm { private_ip, mac_address }) = data {
                state
                    .lifecycle
                    .mark_running(&vm_id, private_ip, mac_address, &node_public_ip)
                    .await
                    .map_err(AppError::from)?;
                if let Some(vm) = state.store.get_vm(&vm_id) {
                    state.publish(meshcloud_common::api::events::OrchestratorEvent::VmStarted {
                        vm_id: vm.id,
                        owner_id: vm.owner_id,
                        node_id: node.node_id.clone(),
                    });
                }
            }
        }
        CommandType::StartVm { vm_id } | CommandType::RestartVm { vm_id } => {
            state.lifecycle.mark_started(&vm_id).await.map_err(AppError::from)?;
        }
        CommandType::StopVm { vm_id, reason } => {
            if let Some(mut vm) = state.store.get_vm(&vm_id) {
                vm.power_state = meshcloud_common::api::domain::PowerState::Stopped;
                vm.updated_at = chrono::Utc::now();
                state.store.put_vm(vm.clone()).map_err(AppError::from)?;
                state.publish(meshcloud_common::api::events::OrchestratorEvent::VmStopped {
                    vm_id: vm.id,
                    owner_id: vm.owner_id,
                    reason,
                });
            }
        }
        CommandType::DeleteVm { vm_id } => {
            state.lifecycle.mark_deleted(&vm_id).await.map_err(AppError::from)?;
            state.attestation.forget(&vm_id);
        }
        CommandType::AllocatePort { vm_id, .. } => {
            if let Some(AckPayload::AllocatePort { vm_port, public_port, protocol }) = data {
                state
                    .lifecycle
                    .record_port_mapping(&vm_id, vm_port, public_port, protocol)
                    .await
                    .map_err(AppError::from)?;
            }
        }
        CommandType::RunDht { .. }
        | CommandType::RunRelay { .. }
        | CommandType::ConfigureWireGuardPeer { .. } => {
            // Obligation completion for these is driven by the reconciler's
            // own dispatch-time resolution (design §A4 open question 6),
            // not by this ack.
        }
    }

    Ok(HttpResponse::Ok().finish())
}
