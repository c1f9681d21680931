//! Tenant-facing HTTP API (design §6): VM CRUD, balance inquiry, promo
//! redemption. Every handler pulls its owner id from the authenticated
//! request extension set by `auth::RequireApiKey` (see `rpc::auth`).

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use meshcloud_common::api::domain::{
    CreditGrant, CreditGrantType, NetworkConfig, VirtualMachine, VmBilling, VmStatus,
};
use meshcloud_common::api::tenant_api::{
    BalanceResponse, CreateVmRequest, CreateVmResponse, RedeemPromoRequest, RedeemPromoResponse,
};
use meshcloud_common::naming;
use meshcloud_common::{AppError, AppResult};

use crate::balance::{compute_balance, to_response};
use crate::rpc::auth::AuthenticatedUser;
use crate::rpc::state::AppState;
use crate::scheduler;

pub async fn create_vm(
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    payload: web::Json<CreateVmRequest>,
) -> AppResult<HttpResponse> {
    let req = payload.into_inner();

    let spec = meshcloud_common::api::domain::VmSpec {
        vm_type: meshcloud_common::api::domain::VmType::General,
        vcpus: tier_vcpus(req.spec_tier),
        mem_bytes: tier_mem_bytes(req.spec_tier),
        disk_bytes: tier_disk_bytes(req.spec_tier),
        quality_tier: req.spec_tier,
        image_id: req.image,
        region: req.region,
        max_price_per_hour: None,
    };

    let nodes = state.store.all_nodes();
    let selected = scheduler::select_node(
        &nodes,
        &spec,
        &state.config.scheduling_weights,
        &state.config.tier_minimums,
    )
    .map_err(AppError::from)?;
    let node = selected.node.clone();

    let mut billing = VmBilling::default();
    if let Some(pricing) = &node.pricing {
        billing.hourly_rate_crypto = crate::billing::hourly_rate(&spec, pricing);
    }

    let vm = VirtualMachine {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: user.user_id.clone(),
        node_id: None,
        name: naming::sanitize(&req.name),
        spec,
        status: VmStatus::Placing,
        power_state: meshcloud_common::api::domain::PowerState::Unknown,
        network_config: NetworkConfig::default(),
        billing,
        started_at: None,
        updated_at: chrono::Utc::now(),
        status_message: None,
        placement_attempts: 1,
    };

    let vm = state
        .lifecycle
        .start_provisioning(vm, &node, req.ssh_key)
        .await
        .map_err(AppError::from)?;

    Ok(HttpResponse::Accepted().json(CreateVmResponse { vm_id: vm.id, status: vm.status }))
}

fn tier_vcpus(tier: meshcloud_common::api::domain::QualityTier) -> u32 {
    use meshcloud_common::api::domain::QualityTier::*;
    match tier {
        Burstable => 1,
        Balanced => 2,
        Standard => 4,
        Guaranteed => 8,
    }
}

fn tier_mem_bytes(tier: meshcloud_common::api::domain::QualityTier) -> u64 {
    use meshcloud_common::api::domain::QualityTier::*;
    match tier {
        Burstable => 1 << 30,
        Balanced => 4 << 30,
        Standard => 8 << 30,
        Guaranteed => 16 << 30,
    }
}

fn tier_disk_bytes(tier: meshcloud_common::api::domain::QualityTier) -> u64 {
    use meshcloud_common::api::domain::QualityTier::*;
    match tier {
        Burstable => 20 << 30,
        Balanced => 50 << 30,
        Standard => 100 << 30,
        Guaranteed => 250 << 30,
    }
}

pub async fn list_vms(user: AuthenticatedUser, state: web::Data<Arc<AppState>>) -> HttpResponse {
    let vms = state.store.vms_by_owner(&user.user_id);
    HttpResponse::Ok().json(vms)
}

pub async fn get_vm(
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let vm_id = path.into_inner();
    let vm = state
        .store
        .get_vm(&vm_id)
        .filter(|vm| vm.owner_id == user.user_id)
        .ok_or_else(|| AppError::not_found("VM_NOT_FOUND", "vm not found"))?;
    Ok(HttpResponse::Ok().json(vm))
}

pub async fn delete_vm(
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let vm_id = path.into_inner();
    let vm = state
        .store
        .get_vm(&vm_id)
        .filter(|vm| vm.owner_id == user.user_id)
        .ok_or_else(|| AppError::not_found("VM_NOT_FOUND", "vm not found"))?;

    let node_id = vm.node_id.ok_or_else(|| AppError::conflict("VM_NOT_PLACED", "vm has no assigned node"))?;
    let node = state
        .store
        .get_node(&node_id)
        .ok_or_else(|| AppError::internal("owning node missing from store"))?;

    state.lifecycle.request_delete(&vm_id, &node).await.map_err(AppError::from)?;
    Ok(HttpResponse::Accepted().finish())
}

fn owned_placed_vm(
    state: &AppState,
    user_id: &str,
    vm_id: &str,
) -> AppResult<(VirtualMachine, meshcloud_common::api::domain::Node)> {
    let vm = state
        .store
        .get_vm(vm_id)
        .filter(|vm| vm.owner_id == user_id)
        .ok_or_else(|| AppError::not_found("VM_NOT_FOUND", "vm not found"))?;
    let node_id = vm.node_id.clone().ok_or_else(|| AppError::conflict("VM_NOT_PLACED", "vm has no assigned node"))?;
    let node = state
        .store
        .get_node(&node_id)
        .ok_or_else(|| AppError::internal("owning node missing from store"))?;
    Ok((vm, node))
}

pub async fn start_vm(
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let vm_id = path.into_inner();
    let (vm, node) = owned_placed_vm(&state, &user.user_id, &vm_id)?;
    state.lifecycle.request_start(&vm.id, &node).await.map_err(AppError::from)?;
    Ok(HttpResponse::Accepted().finish())
}

pub async fn stop_vm(
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let vm_id = path.into_inner();
    let (vm, node) = owned_placed_vm(&state, &user.user_id, &vm_id)?;
    state
        .lifecycle
        .request_stop(&vm.id, &node, "user_requested".to_string())
        .await
        .map_err(AppError::from)?;
    Ok(HttpResponse::Accepted().finish())
}

pub async fn restart_vm(
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let vm_id = path.into_inner();
    let (vm, node) = owned_placed_vm(&state, &user.user_id, &vm_id)?;
    state.lifecycle.request_restart(&vm.id, &node).await.map_err(AppError::from)?;
    Ok(HttpResponse::Accepted().finish())
}

pub async fn get_balance(user: AuthenticatedUser, state: web::Data<Arc<AppState>>) -> AppResult<HttpResponse> {
    let wallet = user.wallet_address.clone();
    let snapshot = compute_balance(
        &state.store,
        state.escrow.as_ref(),
        &user.user_id,
        &wallet,
        state.config.args.required_confirmations,
    )
    .await
    .map_err(AppError::from)?;

    let deposits = state.store.deposits_by_wallet(&wallet);
    let response: BalanceResponse = to_response(snapshot, &deposits, state.config.args.required_confirmations);
    Ok(HttpResponse::Ok().json(response))
}

pub async fn redeem_promo(
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    payload: web::Json<RedeemPromoRequest>,
) -> AppResult<HttpResponse> {
    let code = payload.into_inner().code;
    let mut grants = state.store.credits_for_user(&user.user_id);

    if grants.iter().any(|g| g.id == code) {
        return Ok(HttpResponse::Ok().json(RedeemPromoResponse { credited: meshcloud_common::amount::Amount::ZERO, already_redeemed: true }));
    }

    let credited = meshcloud_common::amount::Amount::from_micros(5_000_000);
    grants.push(CreditGrant {
        id: code,
        user_id: user.user_id.clone(),
        kind: CreditGrantType::Promo,
        original_amount: credited,
        remaining_amount: credited,
        expires_at: Some(chrono::Utc::now() + chrono::Duration::days(90)),
    });

    state.store.put_credits_for_user(&user.user_id, grants).map_err(AppError::from)?;
    Ok(HttpResponse::Ok().json(RedeemPromoResponse { credited, already_redeemed: false }))
}
