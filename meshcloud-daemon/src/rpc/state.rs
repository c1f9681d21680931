//! Shared application state handed to every RPC handler via `web::Data`.

use std::sync::Arc;

use meshcloud_common::api::events::OrchestratorEvent;
use tokio::sync::broadcast;

use crate::attestation::AttestationTracker;
use crate::chain::EscrowClient;
use crate::commands::CommandBus;
use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::obligations::ObligationReconciler;
use crate::proxy::ProxyRouter;
use crate::relay::RelayManager;
use crate::store::DataStore;

pub struct AppState {
    pub store: Arc<DataStore>,
    pub escrow: Arc<dyn EscrowClient>,
    pub commands: Arc<CommandBus>,
    pub lifecycle: Arc<LifecycleManager>,
    pub obligations: Arc<ObligationReconciler>,
    pub relay: Arc<RelayManager>,
    pub attestation: Arc<AttestationTracker>,
    pub proxy: Arc<ProxyRouter>,
    pub events: broadcast::Sender<OrchestratorEvent>,
    pub config: Config,
}

impl AppState {
    pub fn publish(&self, event: OrchestratorEvent) {
        // No subscribers is the common case between orchestrator dashboard
        // sessions; a send error here just means nobody's listening.
        let _ = self.events.send(event);
    }
}
