//! HTTP/WebSocket RPC surface (design §6): tenant API, node agent API, the
//! orchestrator event hub, terminal/SFTP proxy routes, and the Prometheus
//! metrics endpoint, wired the way the teacher's `rpc::mod` assembles its
//! `actix_web::App` — one `HttpServer::new` closure, a stored `ServerHandle`
//! for graceful shutdown, and an optional Prometheus route gated on config.

pub mod auth;
pub mod hub;
pub mod node;
pub mod state;
pub mod tenant;

use std::sync::Arc;

use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::Mutex;

use crate::config::Config;
use state::AppState;

pub struct RpcServer {
    handle: Mutex<Option<actix_web::dev::ServerHandle>>,
}

impl RpcServer {
    pub async fn start(state: Arc<AppState>, config: &Config) -> anyhow::Result<Arc<Self>> {
        let bind_address = config.args.rpc_bind_address.clone();

        if bind_address.starts_with("0.0.0.0") {
            log::warn!("rpc server bound to 0.0.0.0 — tenant and node agent traffic will be reachable from any interface");
        }

        let prometheus = if config.args.prometheus_enable {
            let (recorder, _) = PrometheusBuilder::new()
                .build()
                .context("failed to build prometheus recorder")?;
            let handle = recorder.handle();
            metrics::set_global_recorder(Box::new(recorder))
                .context("failed to install global metrics recorder")?;
            Some((config.args.prometheus_route.clone(), handle))
        } else {
            None
        };

        let server = Arc::new(Self { handle: Mutex::new(None) });

        let http_client = reqwest::Client::new();
        let proxy_router = state.proxy.clone();

        let http_server = {
            let state = state.clone();
            let prometheus = prometheus.clone();
            HttpServer::new(move || {
                let mut app = App::new()
                    .app_data(web::Data::new(state.clone()))
                    .app_data(web::Data::new(http_client.clone()))
                    .app_data(web::Data::new(proxy_router.clone()))
                    .service(health)
                    .route("/api/vms", web::post().to(tenant::create_vm))
                    .route("/api/vms", web::get().to(tenant::list_vms))
                    .route("/api/vms/{id}", web::get().to(tenant::get_vm))
                    .route("/api/vms/{id}", web::delete().to(tenant::delete_vm))
                    .route("/api/vms/{id}/start", web::post().to(tenant::start_vm))
                    .route("/api/vms/{id}/stop", web::post().to(tenant::stop_vm))
                    .route("/api/vms/{id}/restart", web::post().to(tenant::restart_vm))
                    .route("/api/terminal-proxy/{vm_id}", web::get().to(crate::proxy::terminal_proxy))
                    .route("/api/sftp-proxy/{vm_id}", web::get().to(crate::proxy::sftp_proxy))
                    .route("/api/balance", web::get().to(tenant::get_balance))
                    .route("/api/promo/redeem", web::post().to(tenant::redeem_promo))
                    .route("/api/nodes/register", web::post().to(node::register_node))
                    .route("/api/nodes/heartbeat", web::post().to(node::heartbeat))
                    .route("/api/nodes/commands/pending", web::get().to(node::pull_commands))
                    .route(
                        "/api/nodes/commands/{id}/acknowledge",
                        web::post().to(node::acknowledge_command),
                    )
                    .route("/hub/orchestrator", web::get().to(hub::orchestrator_hub))
                    .route("/api/proxy/{subdomain}", web::route().to(crate::proxy::route_http));

                if let Some((route, _)) = &prometheus {
                    app = app.route(route, web::get().to(prometheus_metrics));
                }
                app.app_data(web::Data::new(prometheus.as_ref().map(|(_, h)| h.clone())))
            })
            .disable_signals()
            .bind(&bind_address)
            .with_context(|| format!("failed to bind rpc server to {bind_address}"))?
            .run()
        };

        {
            let handle = http_server.handle();
            let mut lock = server.handle.lock().await;
            *lock = Some(handle);
        }

        meshcloud_common::task::spawn_task("rpc-server", async move {
            if let Err(err) = http_server.await {
                log::error!("rpc server exited with error: {err:#}");
            }
        });

        log::info!("rpc server listening on {bind_address}");
        Ok(server)
    }

    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(handle) = handle.take() {
            handle.stop(true).await;
        }
    }
}

#[get("/healthz")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn prometheus_metrics(handle: web::Data<Option<PrometheusHandle>>) -> HttpResponse {
    match handle.as_ref() {
        Some(handle) => HttpResponse::Ok().content_type("text/plain").body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}
