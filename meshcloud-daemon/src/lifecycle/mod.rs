//! Lifecycle manager (design §4.H): drives each VM through its state
//! machine, issuing the commands that push it from one state to the next
//! and reconciling the two failure modes the design calls out — a node
//! that goes quiet mid-`Deleting` (false positive) and a VM the agent
//! reports as gone but the store still calls live (a ghost).

use std::sync::Arc;

use meshcloud_common::api::command::CommandType;
use meshcloud_common::api::domain::{
    Node, ObligationState, ObligationType, PortProtocol, PowerState, PublicPortMapping, Route, RouteStatus,
    VirtualMachine, VmStatus, VmType,
};
use meshcloud_common::naming;
use meshcloud_common::task::spawn_task;
use meshcloud_common::time::Timestamp;

use crate::commands::CommandBus;
use crate::config::DELETING_TIMEOUT_SECS;
use crate::error::StoreError;
use crate::store::DataStore;

pub struct LifecycleManager {
    store: Arc<DataStore>,
    commands: Arc<CommandBus>,
}

impl LifecycleManager {
    pub fn new(store: Arc<DataStore>, commands: Arc<CommandBus>) -> Self {
        Self { store, commands }
    }

    /// Canonicalizes a requested name for `owner_id` (design §4.H/§6):
    /// system VMs (`owner_id == "system"`) use the name as-is; everything
    /// else is sanitized and given a random 4-hex suffix, retried up to 3
    /// times with a fresh suffix if it collides with an existing VM of the
    /// same owner.
    fn canonical_name(&self, owner_id: &str, requested_name: &str) -> String {
        if owner_id == "system" {
            return requested_name.to_string();
        }

        let base = naming::sanitize(requested_name);
        let existing = self.store.vms_by_owner(owner_id);

        for _ in 0..3 {
            let candidate = naming::with_suffix(&base, naming::random_suffix());
            if !existing.iter().any(|v| v.name == candidate) {
                return candidate;
            }
        }

        naming::with_suffix(&base, naming::random_suffix())
    }

    /// Moves a freshly scheduled VM from `Placing` to `Provisioning`,
    /// assigning it its canonical name and sending the `CreateVm` command.
    pub async fn start_provisioning(
        &self,
        mut vm: VirtualMachine,
        node: &Node,
        ssh_key: Option<String>,
    ) -> Result<VirtualMachine, StoreError> {
        vm.name = self.canonical_name(&vm.owner_id, &vm.name);
        vm.node_id = Some(node.id.clone());
        vm.status = VmStatus::Provisioning;
        vm.updated_at = chrono::Utc::now();

        self.commands
            .enqueue(
                node,
                CommandType::CreateVm {
                    vm_id: vm.id.clone(),
                    spec: vm.spec.clone(),
                    name: vm.name.clone(),
                    ssh_key,
                },
            )
            .await;

        self.store.put_vm(vm.clone())?;
        Ok(vm)
    }

    /// Called when the agent acks `CreateVm` successfully: moves the VM to
    /// `Running`, stamps its network config, and registers its proxy route.
    pub async fn mark_running(
        &self,
        vm_id: &str,
        private_ip: String,
        mac_address: String,
        node_public_ip: &str,
    ) -> Result<(), StoreError> {
        let Some(mut vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };

        vm.network_config.private_ip = Some(private_ip.clone());
        vm.network_config.mac_address = Some(mac_address);
        vm.status = VmStatus::Running;
        vm.started_at = Some(chrono::Utc::now());
        vm.updated_at = chrono::Utc::now();
        self.store.put_vm(vm.clone())?;

        let route = Route {
            subdomain: vm.name.clone(),
            vm_id: vm.id.clone(),
            node_public_ip: node_public_ip.to_string(),
            vm_private_ip: private_ip,
            target_port: 80,
            status: RouteStatus::Active,
        };
        self.store.put_route(route)?;
        Ok(())
    }

    /// Requests the agent start a `Stopping`/`Stopped` VM back up (design
    /// §6 `/api/vms/{id}/start`). The VM stays in its current status until
    /// the agent acks `StartVm`, at which point `mark_started` moves it to
    /// `Running`.
    pub async fn request_start(&self, vm_id: &str, node: &Node) -> Result<(), StoreError> {
        let Some(_vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };
        self.commands.enqueue(node, CommandType::StartVm { vm_id: vm_id.to_string() }).await;
        Ok(())
    }

    /// Requests the agent restart a running VM (design §6
    /// `/api/vms/{id}/restart`) — the VM's status is left untouched until
    /// the agent acks, same as `request_start`.
    pub async fn request_restart(&self, vm_id: &str, node: &Node) -> Result<(), StoreError> {
        let Some(_vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };
        self.commands.enqueue(node, CommandType::RestartVm { vm_id: vm_id.to_string() }).await;
        Ok(())
    }

    /// Called when the agent acks `StartVm`/`RestartVm` successfully.
    pub async fn mark_started(&self, vm_id: &str) -> Result<(), StoreError> {
        let Some(mut vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };
        vm.status = VmStatus::Running;
        vm.power_state = PowerState::Running;
        vm.updated_at = chrono::Utc::now();
        self.store.put_vm(vm)
    }

    /// Records a port forward the agent opened in response to
    /// `AllocatePort` (design §4.E ack payload, §9 `NetworkConfig`).
    pub async fn record_port_mapping(
        &self,
        vm_id: &str,
        vm_port: u16,
        public_port: u16,
        protocol: PortProtocol,
    ) -> Result<(), StoreError> {
        let Some(mut vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };
        vm.network_config
            .public_port_mappings
            .retain(|m| !(m.vm_port == vm_port && m.protocol == protocol));
        vm.network_config.public_port_mappings.push(PublicPortMapping { vm_port, public_port, protocol });
        vm.updated_at = chrono::Utc::now();
        self.store.put_vm(vm)
    }

    pub async fn request_stop(&self, vm_id: &str, node: &Node, reason: String) -> Result<(), StoreError> {
        let Some(mut vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };
        vm.status = VmStatus::Stopping;
        vm.updated_at = chrono::Utc::now();
        self.store.put_vm(vm.clone())?;
        self.commands
            .enqueue(node, CommandType::StopVm { vm_id: vm_id.to_string(), reason })
            .await;
        Ok(())
    }

    pub async fn request_delete(&self, vm_id: &str, node: &Node) -> Result<(), StoreError> {
        let Some(mut vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };
        vm.status = VmStatus::Deleting;
        vm.updated_at = chrono::Utc::now();
        self.store.put_vm(vm.clone())?;
        self.commands.enqueue(node, CommandType::DeleteVm { vm_id: vm_id.to_string() }).await;
        Ok(())
    }

    pub async fn mark_deleted(&self, vm_id: &str) -> Result<(), StoreError> {
        let Some(mut vm) = self.store.get_vm(vm_id) else {
            return Err(StoreError::NotFound(vm_id.to_string()));
        };
        vm.status = VmStatus::Deleted;
        vm.updated_at = chrono::Utc::now();
        self.store.put_vm(vm.clone())?;
        self.store.remove_route(&vm.name)?;
        Ok(())
    }

    /// Sweeps VMs stuck in `Deleting` past `DELETING_TIMEOUT_SECS` without
    /// an ack — the false-positive recovery rule from design §4.H: if the
    /// agent is still reachable, resend the delete; otherwise force the VM
    /// to `Deleted` so a dead node can't wedge an aggregate forever.
    pub async fn reconcile_stuck_deletes(&self, now: Timestamp) -> Result<(), StoreError> {
        for vm in self.store.vms_by_status(VmStatus::Deleting) {
            if !meshcloud_common::time::is_stale(vm.updated_at, now, DELETING_TIMEOUT_SECS) {
                continue;
            }

            match vm.node_id.as_ref().and_then(|id| self.store.get_node(id)) {
                Some(node) if node.status == meshcloud_common::api::domain::NodeStatus::Online => {
                    self.commands
                        .enqueue(&node, CommandType::DeleteVm { vm_id: vm.id.clone() })
                        .await;
                }
                _ => {
                    self.mark_deleted(&vm.id).await?;
                }
            }
        }
        Ok(())
    }

    /// Ghost-VM recovery (design §4.H): a VM the store still marks
    /// `Running`/`Stopping` but whose owning node reports no such power
    /// state in its heartbeat is forced to `Deleted` rather than left to
    /// bill forever against a resource that no longer exists.
    pub async fn reconcile_ghost_vm(&self, vm_id: &str) -> Result<(), StoreError> {
        let Some(vm) = self.store.get_vm(vm_id) else {
            return Ok(());
        };
        if matches!(vm.status, VmStatus::Running | VmStatus::Stopping) {
            self.mark_deleted(vm_id).await?;
        }
        Ok(())
    }

    /// False-positive `Deleting` recovery (design §4.H, §8 scenario 3): a VM
    /// a prior faulty check pushed into `Deleting` is still genuinely alive
    /// if the agent's latest heartbeat reports `powerState = Running` for
    /// it. Since this is only called from a heartbeat handler, the sample is
    /// by construction fresh, so no separate staleness check is needed. On
    /// recovery: the VM is restored to `Running` with an explanatory
    /// `statusMessage`, its route is re-registered, and any *other* VM on
    /// the same node with the same `vmType` (a ghost duplicate the scheduler
    /// may have placed while this one looked dead) is forced to `Deleted`.
    /// Returns `true` if a recovery happened.
    pub async fn recover_false_positive_deleting(
        &self,
        vm_id: &str,
        reported_power_state: PowerState,
        node_public_ip: &str,
    ) -> Result<bool, StoreError> {
        let Some(mut vm) = self.store.get_vm(vm_id) else {
            return Ok(false);
        };
        if vm.status != VmStatus::Deleting || reported_power_state != PowerState::Running {
            return Ok(false);
        }

        vm.status = VmStatus::Running;
        vm.power_state = PowerState::Running;
        vm.status_message = Some("Recovered from false-positive Deleting".to_string());
        vm.updated_at = chrono::Utc::now();
        self.store.put_vm(vm.clone())?;

        if let Some(private_ip) = vm.network_config.private_ip.clone() {
            self.store.put_route(Route {
                subdomain: vm.name.clone(),
                vm_id: vm.id.clone(),
                node_public_ip: node_public_ip.to_string(),
                vm_private_ip: private_ip,
                target_port: 80,
                status: RouteStatus::Active,
            })?;
        }

        if let Some(node_id) = vm.node_id.clone() {
            for ghost in self.store.vms_by_node(&node_id) {
                if ghost.id != vm.id && ghost.spec.vm_type == vm.spec.vm_type && ghost.status != VmStatus::Deleted {
                    self.mark_deleted(&ghost.id).await?;
                }
            }

            let obligation_kind = match vm.spec.vm_type {
                VmType::Dht => Some(ObligationType::NodeRunDht),
                VmType::Relay => Some(ObligationType::NodeRunRelay),
                VmType::General => None,
            };
            if let Some(kind) = obligation_kind {
                let obligation_id = format!("{}-{:?}", node_id, kind);
                if let Some(mut obligation) = self.store.get_obligation(&obligation_id) {
                    obligation.state = ObligationState::Completed;
                    obligation.last_error = None;
                    self.store.put_obligation(obligation)?;
                }
            }
        }

        Ok(true)
    }
}

/// Periodically sweeps VMs stuck in `Deleting` past the timeout (design
/// §4.H: "10m no heartbeat OR ack"). The false-positive recovery path runs
/// inline on the heartbeat handler instead, since it needs a fresh sample.
pub fn spawn(manager: Arc<LifecycleManager>, interval_secs: u64) {
    spawn_task("lifecycle-reconciler", async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(err) = manager.reconcile_stuck_deletes(chrono::Utc::now()).await {
                log::warn!("lifecycle reconciler tick failed: {err:#}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcloud_common::api::domain::{NetworkConfig, Obligation, QualityTier, VmBilling, VmSpec, VmType};

    fn sample_vm(id: &str, status: VmStatus) -> VirtualMachine {
        VirtualMachine {
            id: id.to_string(),
            owner_id: "user1".to_string(),
            node_id: None,
            name: "my vm".into(),
            spec: VmSpec {
                vm_type: VmType::General,
                vcpus: 2,
                mem_bytes: 4 << 30,
                disk_bytes: 50 << 30,
                quality_tier: QualityTier::Standard,
                image_id: "ubuntu-22.04".into(),
                region: None,
                max_price_per_hour: None,
            },
            status,
            power_state: meshcloud_common::api::domain::PowerState::Unknown,
            network_config: NetworkConfig::default(),
            billing: VmBilling::default(),
            started_at: None,
            updated_at: chrono::Utc::now(),
            status_message: None,
            placement_attempts: 0,
        }
    }

    #[tokio::test]
    async fn mark_deleted_removes_the_route() {
        let dir = tempdir::TempDir::new("meshcloud-lifecycle-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let commands = CommandBus::new();
        let manager = LifecycleManager::new(store.clone(), commands);

        let vm = sample_vm("vm1", VmStatus::Running);
        store.put_vm(vm.clone()).unwrap();
        store
            .put_route(Route {
                subdomain: vm.name.clone(),
                vm_id: vm.id.clone(),
                node_public_ip: "1.2.3.4".into(),
                vm_private_ip: "10.0.0.2".into(),
                target_port: 80,
                status: RouteStatus::Active,
            })
            .unwrap();

        manager.mark_deleted("vm1").await.unwrap();

        assert_eq!(store.get_vm("vm1").unwrap().status, VmStatus::Deleted);
        assert!(store.get_route(&vm.name).is_none());
    }

    #[tokio::test]
    async fn ghost_running_vm_is_forced_deleted() {
        let dir = tempdir::TempDir::new("meshcloud-lifecycle-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let commands = CommandBus::new();
        let manager = LifecycleManager::new(store.clone(), commands);

        store.put_vm(sample_vm("vm2", VmStatus::Running)).unwrap();
        manager.reconcile_ghost_vm("vm2").await.unwrap();

        assert_eq!(store.get_vm("vm2").unwrap().status, VmStatus::Deleted);
    }

    fn sample_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            wallet_address: "0xnode".into(),
            public_ip: Some("1.2.3.4".into()),
            agent_port: 5100,
            nat_type: meshcloud_common::api::domain::NatType::None,
            cgnat_info: None,
            relay_info: None,
            hardware: meshcloud_common::api::domain::Hardware {
                cpu_cores: 8,
                mem_bytes: 32 << 30,
                disk_bytes: 500 << 30,
                benchmark_score: 5000,
            },
            pricing: None,
            system_vm_obligations: vec![],
            last_heartbeat_at: chrono::Utc::now(),
            status: meshcloud_common::api::domain::NodeStatus::Online,
            allocated_vcpus: 0,
            allocated_mem_bytes: 0,
            allocated_disk_bytes: 0,
        }
    }

    #[tokio::test]
    async fn heartbeat_running_recovers_a_false_positive_deleting_vm() {
        let dir = tempdir::TempDir::new("meshcloud-lifecycle-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let commands = CommandBus::new();
        let manager = LifecycleManager::new(store.clone(), commands);

        store.put_node(sample_node("n1")).unwrap();

        let mut vm = sample_vm("v2", VmStatus::Deleting);
        vm.spec.vm_type = VmType::Dht;
        vm.node_id = Some("n1".into());
        vm.network_config.private_ip = Some("10.0.0.5".into());
        store.put_vm(vm).unwrap();

        store
            .put_obligation(Obligation {
                id: "n1-NodeRunDht".into(),
                kind: ObligationType::NodeRunDht,
                resource_id: "n1".into(),
                state: ObligationState::InFlight,
                next_attempt_at: chrono::Utc::now(),
                attempts: 1,
                last_error: None,
            })
            .unwrap();

        let recovered = manager
            .recover_false_positive_deleting("v2", PowerState::Running, "1.2.3.4")
            .await
            .unwrap();
        assert!(recovered);

        let vm = store.get_vm("v2").unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.status_message.as_deref(), Some("Recovered from false-positive Deleting"));
        assert!(store.get_route("my vm").is_some());
        assert_eq!(store.get_obligation("n1-NodeRunDht").unwrap().state, ObligationState::Completed);
    }

    #[tokio::test]
    async fn recovery_force_deletes_a_ghost_duplicate_on_the_same_node() {
        let dir = tempdir::TempDir::new("meshcloud-lifecycle-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let commands = CommandBus::new();
        let manager = LifecycleManager::new(store.clone(), commands);

        store.put_node(sample_node("n1")).unwrap();

        let mut recovering = sample_vm("v3", VmStatus::Deleting);
        recovering.spec.vm_type = VmType::Dht;
        recovering.node_id = Some("n1".into());
        store.put_vm(recovering).unwrap();

        let mut ghost = sample_vm("v3-ghost", VmStatus::Running);
        ghost.spec.vm_type = VmType::Dht;
        ghost.node_id = Some("n1".into());
        ghost.name = "ghost vm".into();
        store.put_vm(ghost).unwrap();

        manager
            .recover_false_positive_deleting("v3", PowerState::Running, "1.2.3.4")
            .await
            .unwrap();

        assert_eq!(store.get_vm("v3").unwrap().status, VmStatus::Running);
        assert_eq!(store.get_vm("v3-ghost").unwrap().status, VmStatus::Deleted);
    }

    #[tokio::test]
    async fn mark_started_moves_a_stopped_vm_back_to_running() {
        let dir = tempdir::TempDir::new("meshcloud-lifecycle-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let commands = CommandBus::new();
        let manager = LifecycleManager::new(store.clone(), commands);

        let mut vm = sample_vm("v5", VmStatus::Stopping);
        vm.power_state = PowerState::Stopped;
        store.put_vm(vm).unwrap();

        manager.mark_started("v5").await.unwrap();

        let vm = store.get_vm("v5").unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.power_state, PowerState::Running);
    }

    #[tokio::test]
    async fn record_port_mapping_replaces_a_stale_mapping_for_the_same_vm_port_and_protocol() {
        use meshcloud_common::api::domain::PortProtocol;

        let dir = tempdir::TempDir::new("meshcloud-lifecycle-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let commands = CommandBus::new();
        let manager = LifecycleManager::new(store.clone(), commands);

        store.put_vm(sample_vm("v6", VmStatus::Running)).unwrap();
        manager.record_port_mapping("v6", 22, 30022, PortProtocol::Tcp).await.unwrap();
        manager.record_port_mapping("v6", 22, 31022, PortProtocol::Tcp).await.unwrap();

        let vm = store.get_vm("v6").unwrap();
        assert_eq!(vm.network_config.public_port_mappings.len(), 1);
        assert_eq!(vm.network_config.public_port_mappings[0].public_port, 31022);
    }

    #[tokio::test]
    async fn recovery_is_a_no_op_when_power_state_is_not_running() {
        let dir = tempdir::TempDir::new("meshcloud-lifecycle-test").unwrap();
        let store = DataStore::open(dir.path().to_str().unwrap()).unwrap();
        let commands = CommandBus::new();
        let manager = LifecycleManager::new(store.clone(), commands);

        store.put_vm(sample_vm("v4", VmStatus::Deleting)).unwrap();

        let recovered = manager
            .recover_false_positive_deleting("v4", PowerState::Stopped, "1.2.3.4")
            .await
            .unwrap();

        assert!(!recovered);
        assert_eq!(store.get_vm("v4").unwrap().status, VmStatus::Deleting);
    }
}
