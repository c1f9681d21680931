//! Tenant HTTP API wire types (design §6).

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::api::domain::{PendingDeposit, QualityTier, VmId, VmStatus};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmRequest {
    pub name: String,
    pub spec_tier: QualityTier,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmResponse {
    pub vm_id: VmId,
    pub status: VmStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDepositView {
    pub tx_hash: String,
    pub amount: Amount,
    pub confirmations: u64,
    pub required: u64,
}

impl PendingDepositView {
    pub fn from_deposit(d: &PendingDeposit, required: u64) -> Self {
        Self {
            tx_hash: d.tx_hash.clone(),
            amount: d.amount,
            confirmations: d.confirmations,
            required,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub confirmed: Amount,
    pub pending_deposits: Amount,
    pub unpaid_usage: Amount,
    pub available_balance: Amount,
    pub total_balance: Amount,
    pub pending_deposits_list: Vec<PendingDepositView>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemPromoRequest {
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemPromoResponse {
    pub credited: Amount,
    pub already_redeemed: bool,
}
