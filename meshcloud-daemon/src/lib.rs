pub mod attestation;
pub mod balance;
pub mod billing;
pub mod chain;
pub mod commands;
pub mod config;
pub mod deposits;
pub mod error;
pub mod lifecycle;
pub mod obligations;
pub mod proxy;
pub mod relay;
pub mod rpc;
pub mod scheduler;
pub mod settlement;
pub mod store;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::attestation::AttestationTracker;
use crate::chain::{EscrowClient, HttpEscrowClient};
use crate::commands::CommandBus;
use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::obligations::ObligationReconciler;
use crate::proxy::ProxyRouter;
use crate::relay::RelayManager;
use crate::rpc::state::AppState;
use crate::rpc::RpcServer;
use crate::store::DataStore;

/// Assembles every component and starts the background tickers/reconcilers
/// plus the RPC server. Returns once the RPC server is listening; the
/// returned `CancellationToken` is the caller's lever for graceful
/// shutdown.
pub async fn run(config: Config) -> anyhow::Result<(Arc<RpcServer>, CancellationToken)> {
    let store = DataStore::open(&config.args.data_dir)?;

    let escrow: Arc<dyn EscrowClient> = Arc::new(HttpEscrowClient::new(
        config.args.escrow_rpc_url.clone(),
        crate::config::ESCROW_RPC_TIMEOUT_SECS,
    ));

    let commands = CommandBus::new();
    commands::spawn(commands.clone(), crate::config::COMMAND_EXPIRY_SWEEP_INTERVAL_SECS);
    let relay = Arc::new(RelayManager::new(store.clone(), commands.clone()));
    let attestation = Arc::new(AttestationTracker::new(crate::config::HEARTBEAT_SAMPLE_INTERVAL_SECS));
    let lifecycle = Arc::new(LifecycleManager::new(store.clone(), commands.clone()));
    lifecycle::spawn(lifecycle.clone(), crate::config::LIFECYCLE_RECONCILE_INTERVAL_SECS);
    let obligations = Arc::new(ObligationReconciler::new(store.clone(), commands.clone(), relay.clone()));
    let proxy = Arc::new(ProxyRouter::new(store.clone()));

    let (events_tx, _rx) = broadcast::channel(1024);

    let state = Arc::new(AppState {
        store: store.clone(),
        escrow: escrow.clone(),
        commands: commands.clone(),
        lifecycle,
        obligations: obligations.clone(),
        relay,
        attestation: attestation.clone(),
        proxy,
        events: events_tx,
        config: config.clone(),
    });

    let billing_ticker = Arc::new(billing::BillingTicker::new(
        store.clone(),
        escrow.clone(),
        commands.clone(),
        attestation,
        config.args.platform_fee_bps,
        config.args.required_confirmations,
        config.args.out_of_funds_grace_cycles,
    ));
    billing::spawn(billing_ticker, crate::config::BILLING_CYCLE_SECS);

    let settlement_ticker = Arc::new(settlement::SettlementTicker::new(
        store.clone(),
        escrow.clone(),
        meshcloud_common::amount::Amount::from_micros(config.args.min_settlement_amount_micros),
        config.args.settlement_batching_enabled,
    ));
    settlement::spawn(settlement_ticker, config.args.settlement_interval_hours * 3600);

    let deposit_monitor = Arc::new(deposits::DepositMonitor::new(
        store.clone(),
        escrow,
        config.args.required_confirmations,
    ));
    deposits::spawn(deposit_monitor, crate::config::DEPOSIT_SCAN_INTERVAL_SECS);

    obligations::spawn(obligations, crate::config::OBLIGATION_SCAN_INTERVAL_SECS);

    let rpc_server = RpcServer::start(state, &config).await?;

    let shutdown = CancellationToken::new();
    Ok((rpc_server, shutdown))
}
