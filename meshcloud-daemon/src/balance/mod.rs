//! Balance engine (design §4.C): a pure, stateless computation over three
//! sources the store already tracks. No aggregate of its own — this module
//! exists so "what can this user spend right now" is computed the same way
//! everywhere (tenant API, billing ticker, settlement ticker) instead of
//! being recomputed ad hoc at each call site.

use meshcloud_common::amount::Amount;
use meshcloud_common::api::domain::{sort_credits_for_consumption, CreditGrant};
use meshcloud_common::api::tenant_api::{BalanceResponse, PendingDepositView};
use meshcloud_common::time::Timestamp;

use crate::chain::EscrowClient;
use crate::error::BalanceError;
use crate::store::DataStore;

#[derive(Debug, Clone, Copy)]
pub struct BalanceSnapshot {
    pub confirmed: Amount,
    pub pending_deposits: Amount,
    pub unpaid_usage: Amount,
    pub credits: Amount,
    pub available: Amount,
    pub total: Amount,
}

impl BalanceSnapshot {
    pub fn has_sufficient(&self, required: Amount) -> Result<(), BalanceError> {
        if self.available >= required {
            Ok(())
        } else {
            Err(BalanceError::Insufficient {
                available: self.available.micros(),
                required: required.micros(),
            })
        }
    }
}

/// `available = confirmed + credits - unpaid` (design §4.C; pending
/// deposits are excluded — they aren't spendable until confirmed) and
/// `total = confirmed + pending + credits - unpaid`, both saturating at
/// zero rather than going negative.
pub async fn compute_balance(
    store: &DataStore,
    escrow: &dyn EscrowClient,
    user_id: &str,
    wallet_address: &str,
    required_confirmations: u64,
) -> Result<BalanceSnapshot, crate::error::EscrowError> {
    let confirmed = escrow.confirmed_balance(wallet_address).await?;

    let deposits = store.deposits_by_wallet(wallet_address);
    let pending_deposits = deposits
        .iter()
        .filter(|d| d.confirmations < required_confirmations)
        .fold(Amount::ZERO, |acc, d| acc + d.amount);

    let unpaid_usage = store
        .unpaid_usage_for_user(user_id)
        .iter()
        .fold(Amount::ZERO, |acc, u| acc + u.total_cost);

    let credits = store
        .credits_for_user(user_id)
        .iter()
        .fold(Amount::ZERO, |acc, c| acc + c.remaining_amount);

    let available = (confirmed + credits).saturating_sub(unpaid_usage);
    let total = (confirmed + pending_deposits + credits).saturating_sub(unpaid_usage);

    Ok(BalanceSnapshot {
        confirmed,
        pending_deposits,
        unpaid_usage,
        credits,
        available,
        total,
    })
}

pub fn to_response(
    snapshot: BalanceSnapshot,
    deposits: &[meshcloud_common::api::domain::PendingDeposit],
    required_confirmations: u64,
) -> BalanceResponse {
    BalanceResponse {
        confirmed: snapshot.confirmed,
        pending_deposits: snapshot.pending_deposits,
        unpaid_usage: snapshot.unpaid_usage,
        available_balance: snapshot.available,
        total_balance: snapshot.total,
        pending_deposits_list: deposits
            .iter()
            .map(|d| PendingDepositView::from_deposit(d, required_confirmations))
            .collect(),
    }
}

/// Consume `amount` from a user's credit grants in FIFO-by-expiry order
/// (design §3), returning how much was covered by credits — the remainder
/// is billed against escrow balance by the caller.
pub fn consume_credits(grants: &mut Vec<CreditGrant>, amount: Amount) -> Amount {
    sort_credits_for_consumption(grants);
    let mut remaining = amount;
    let mut covered = Amount::ZERO;
    for grant in grants.iter_mut() {
        if remaining.is_zero() {
            break;
        }
        let take = grant.remaining_amount.min(remaining);
        grant.remaining_amount = grant.remaining_amount.saturating_sub(take);
        remaining = remaining.saturating_sub(take);
        covered = covered + take;
    }
    grants.retain(|g| !g.remaining_amount.is_zero());
    covered
}

/// Drops expired grants before consumption runs against them.
pub fn prune_expired_credits(grants: &mut Vec<CreditGrant>, now: Timestamp) {
    grants.retain(|g| g.expires_at.map(|exp| exp > now).unwrap_or(true));
}
