//! Data store (design §4.A): per-aggregate single-writer, in-memory
//! projection loaded at startup and kept current with write-through (not
//! write-behind) persistence to sled. Modeled on the teacher's
//! `a2a::registry` — a `DashMap`-backed projection guarded implicitly by
//! per-key entry locking rather than one global `RwLock`, since the
//! aggregates here are independent and contention across them would be
//! wasted serialization.

use std::sync::Arc;

use dashmap::DashMap;
use meshcloud_common::api::domain::{
    CreditGrant, Node, Obligation, ObligationState, PendingDeposit, Route, UsageRecord,
    VirtualMachine, VmStatus,
};
use meshcloud_common::time::Timestamp;

use crate::error::StoreError;

const TREE_NODES: &str = "nodes";
const TREE_VMS: &str = "vms";
const TREE_OBLIGATIONS: &str = "obligations";
const TREE_DEPOSITS: &str = "deposits";
const TREE_USAGE: &str = "usage";
const TREE_ROUTES: &str = "routes";
const TREE_CREDITS: &str = "credits";

/// Write-through persistence plus in-memory projection for every aggregate
/// root in the system. One `DataStore` is shared (via `Arc`) across every
/// reconciler and the RPC layer; no aggregate is ever mutated outside of
/// this type's methods, which is what makes "single writer per aggregate"
/// hold without a global lock.
pub struct DataStore {
    db: sled::Db,
    nodes: DashMap<String, Node>,
    vms: DashMap<String, VirtualMachine>,
    obligations: DashMap<String, Obligation>,
    deposits: DashMap<String, PendingDeposit>,
    usage: DashMap<String, UsageRecord>,
    routes: DashMap<String, Route>,
    credits: DashMap<String, Vec<CreditGrant>>,
}

impl DataStore {
    /// Opens (or creates) the sled database at `path` and hydrates every
    /// in-memory projection from it. Called once at startup.
    pub fn open(path: &str) -> Result<Arc<Self>, StoreError> {
        let db = sled::open(path)?;
        let store = Self {
            nodes: load_tree(&db, TREE_NODES)?,
            vms: load_tree(&db, TREE_VMS)?,
            obligations: load_tree(&db, TREE_OBLIGATIONS)?,
            deposits: load_tree(&db, TREE_DEPOSITS)?,
            usage: load_tree(&db, TREE_USAGE)?,
            routes: load_tree(&db, TREE_ROUTES)?,
            credits: load_tree(&db, TREE_CREDITS)?,
            db,
        };
        Ok(Arc::new(store))
    }

    fn persist<T: serde::Serialize>(&self, tree_name: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let tree = self.db.open_tree(tree_name)?;
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove_persisted(&self, tree_name: &str, key: &str) -> Result<(), StoreError> {
        let tree = self.db.open_tree(tree_name)?;
        tree.remove(key.as_bytes())?;
        Ok(())
    }

    // --------------------------------------------------------------- Node -

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn put_node(&self, node: Node) -> Result<(), StoreError> {
        self.persist(TREE_NODES, &node.id, &node)?;
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn nodes_with_stale_heartbeat(&self, now: Timestamp, deadline_secs: i64) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|e| meshcloud_common::time::is_stale(e.value().last_heartbeat_at, now, deadline_secs))
            .map(|e| e.value().clone())
            .collect()
    }

    // ----------------------------------------------------------------- VM -

    pub fn get_vm(&self, id: &str) -> Option<VirtualMachine> {
        self.vms.get(id).map(|v| v.clone())
    }

    pub fn put_vm(&self, vm: VirtualMachine) -> Result<(), StoreError> {
        self.persist(TREE_VMS, &vm.id, &vm)?;
        self.vms.insert(vm.id.clone(), vm);
        Ok(())
    }

    pub fn vms_by_owner(&self, owner_id: &str) -> Vec<VirtualMachine> {
        self.vms
            .iter()
            .filter(|e| e.value().owner_id == owner_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn vms_by_node_and_status(&self, node_id: &str, status: VmStatus) -> Vec<VirtualMachine> {
        self.vms
            .iter()
            .filter(|e| e.value().node_id.as_deref() == Some(node_id) && e.value().status == status)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn vms_by_node(&self, node_id: &str) -> Vec<VirtualMachine> {
        self.vms
            .iter()
            .filter(|e| e.value().node_id.as_deref() == Some(node_id))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn vms_by_status(&self, status: VmStatus) -> Vec<VirtualMachine> {
        self.vms
            .iter()
            .filter(|e| e.value().status == status)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_vms(&self) -> Vec<VirtualMachine> {
        self.vms.iter().map(|e| e.value().clone()).collect()
    }

    // -------------------------------------------------------- Obligation --

    pub fn get_obligation(&self, id: &str) -> Option<Obligation> {
        self.obligations.get(id).map(|o| o.clone())
    }

    pub fn put_obligation(&self, obligation: Obligation) -> Result<(), StoreError> {
        self.persist(TREE_OBLIGATIONS, &obligation.id, &obligation)?;
        self.obligations.insert(obligation.id.clone(), obligation);
        Ok(())
    }

    /// Obligations due for a reconciler pass: `Pending` or `RetryScheduled`
    /// with `nextAttemptAt <= now` (design §4.I).
    pub fn due_obligations(&self, now: Timestamp) -> Vec<Obligation> {
        self.obligations
            .iter()
            .filter(|e| {
                let o = e.value();
                matches!(o.state, ObligationState::Pending | ObligationState::RetryScheduled)
                    && o.next_attempt_at <= now
            })
            .map(|e| e.value().clone())
            .collect()
    }

    // ---------------------------------------------------------- Deposits --

    pub fn upsert_deposit(&self, deposit: PendingDeposit) -> Result<(), StoreError> {
        self.persist(TREE_DEPOSITS, &deposit.tx_hash, &deposit)?;
        self.deposits.insert(deposit.tx_hash.clone(), deposit);
        Ok(())
    }

    pub fn remove_deposit(&self, tx_hash: &str) -> Result<(), StoreError> {
        self.remove_persisted(TREE_DEPOSITS, tx_hash)?;
        self.deposits.remove(tx_hash);
        Ok(())
    }

    pub fn deposits_by_wallet(&self, wallet_address: &str) -> Vec<PendingDeposit> {
        self.deposits
            .iter()
            .filter(|e| e.value().wallet_address == wallet_address)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_deposits(&self) -> Vec<PendingDeposit> {
        self.deposits.iter().map(|e| e.value().clone()).collect()
    }

    // --------------------------------------------------------- UsageRecord -

    pub fn put_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.persist(TREE_USAGE, &record.id, &record)?;
        self.usage.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn unpaid_usage_for_user(&self, user_id: &str) -> Vec<UsageRecord> {
        self.usage
            .iter()
            .filter(|e| e.value().user_id == user_id && !e.value().settled_on_chain)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn unpaid_usage_for_user_node(&self, user_id: &str, node_id: &str) -> Vec<UsageRecord> {
        self.usage
            .iter()
            .filter(|e| {
                e.value().user_id == user_id && e.value().node_id == node_id && !e.value().settled_on_chain
            })
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_unsettled_usage(&self) -> Vec<UsageRecord> {
        self.usage
            .iter()
            .filter(|e| !e.value().settled_on_chain)
            .map(|e| e.value().clone())
            .collect()
    }

    // ---------------------------------------------------------------- Route -

    pub fn put_route(&self, route: Route) -> Result<(), StoreError> {
        self.persist(TREE_ROUTES, &route.subdomain, &route)?;
        self.routes.insert(route.subdomain.clone(), route);
        Ok(())
    }

    pub fn get_route(&self, subdomain: &str) -> Option<Route> {
        self.routes.get(subdomain).map(|r| r.clone())
    }

    pub fn remove_route(&self, subdomain: &str) -> Result<(), StoreError> {
        self.remove_persisted(TREE_ROUTES, subdomain)?;
        self.routes.remove(subdomain);
        Ok(())
    }

    // -------------------------------------------------------------- Credits -

    pub fn credits_for_user(&self, user_id: &str) -> Vec<CreditGrant> {
        self.credits.get(user_id).map(|g| g.clone()).unwrap_or_default()
    }

    pub fn put_credits_for_user(&self, user_id: &str, grants: Vec<CreditGrant>) -> Result<(), StoreError> {
        self.persist(TREE_CREDITS, user_id, &grants)?;
        self.credits.insert(user_id.to_string(), grants);
        Ok(())
    }
}

fn load_tree<T>(db: &sled::Db, tree_name: &str) -> Result<DashMap<String, T>, StoreError>
where
    T: serde::de::DeserializeOwned,
{
    let tree = db.open_tree(tree_name)?;
    let map = DashMap::new();
    for entry in tree.iter() {
        let (key, value) = entry?;
        let key = String::from_utf8_lossy(&key).into_owned();
        let value: T = serde_json::from_slice(&value)?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcloud_common::amount::Amount;

    fn sample_deposit(tx_hash: &str, wallet: &str) -> PendingDeposit {
        PendingDeposit {
            tx_hash: tx_hash.to_string(),
            wallet_address: wallet.to_string(),
            amount: Amount::from_micros(5_000_000),
            block_number: 100,
            confirmations: 2,
            chain_id: 1,
        }
    }

    #[test]
    fn round_trips_deposits_through_sled_and_projection() {
        let dir = tempdir::TempDir::new("meshcloud-store-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        store.upsert_deposit(sample_deposit("0xdead", "0xwallet")).unwrap();

        let found = store.deposits_by_wallet("0xwallet");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tx_hash, "0xdead");

        store.remove_deposit("0xdead").unwrap();
        assert!(store.deposits_by_wallet("0xwallet").is_empty());
    }

    #[test]
    fn reopening_the_store_rehydrates_the_projection() {
        let dir = tempdir::TempDir::new("meshcloud-store-test").unwrap();
        {
            let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
            store.upsert_deposit(sample_deposit("0xabc", "0xwallet2")).unwrap();
        }
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(store.deposits_by_wallet("0xwallet2").len(), 1);
    }
}
