//! Proxy layer (design §4.M): HTTP subdomain routing and terminal/SFTP
//! WebSocket splicing to the backing VM, with CGNAT awareness — a node
//! behind CGNAT is dialed at its assigned relay's tunnel IP rather than
//! its (nonexistent) public IP.

use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

use meshcloud_common::api::domain::{Node, Route, VmStatus};
use meshcloud_common::{AppError, AppResult};

use crate::error::ProxyError;
use crate::rpc::auth::AuthenticatedUser;
use crate::rpc::state::AppState;
use crate::store::DataStore;

pub struct ProxyRouter {
    store: Arc<DataStore>,
}

impl ProxyRouter {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    /// Resolves a route's dial target: CGNAT nodes are addressed at their
    /// relay's tunnel IP, non-CGNAT nodes at the route's recorded public
    /// IP directly (design §4.M CGNAT override rule). The base URL points
    /// at the agent's internal proxy endpoint for the VM, not the VM's own
    /// port — the agent multiplexes subdomain traffic onto its own port.
    pub fn resolve_dial_target(&self, route: &Route) -> Result<String, ProxyError> {
        let vm = self
            .store
            .get_vm(&route.vm_id)
            .ok_or_else(|| ProxyError::NoRoute(route.subdomain.clone()))?;
        let node_id = vm.node_id.ok_or_else(|| ProxyError::NoRoute(route.subdomain.clone()))?;
        let node = self.store.get_node(&node_id).ok_or_else(|| ProxyError::NoRoute(route.subdomain.clone()))?;

        let host = match &node.cgnat_info {
            Some(cgnat) => cgnat.tunnel_ip.clone(),
            None => route.node_public_ip.clone(),
        };

        Ok(format!("http://{host}:{}/internal/proxy/{}", node.agent_port, route.vm_id))
    }

    pub fn route_for_subdomain(&self, subdomain: &str) -> Option<Route> {
        let route = self.store.get_route(subdomain)?;
        (route.status == meshcloud_common::api::domain::RouteStatus::Active).then_some(route)
    }
}

/// HTTP entrypoint: resolves the `X-DeCloud-Subdomain` routing header (set
/// by the edge load balancer, never trusted if supplied directly by a
/// client) to a route and reverse-proxies the request body/headers to the
/// backing VM.
pub async fn route_http(
    req: HttpRequest,
    body: web::Bytes,
    router: web::Data<Arc<ProxyRouter>>,
    http: web::Data<reqwest::Client>,
) -> HttpResponse {
    let Some(subdomain) = req
        .headers()
        .get("x-decloud-subdomain")
        .and_then(|v| v.to_str().ok())
    else {
        return HttpResponse::NotFound().finish();
    };

    let Some(route) = router.route_for_subdomain(subdomain) else {
        return HttpResponse::NotFound().finish();
    };

    let base = match router.resolve_dial_target(&route) {
        Ok(target) => target,
        Err(_) => return HttpResponse::BadGateway().finish(),
    };

    let url = format!("{base}{}", req.uri());
    let peer_ip = req.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default();
    let mut forwarded = http.request(req.method().clone(), &url);
    for (name, value) in req.headers() {
        if is_hop_by_hop_header(name.as_str()) || name.as_str().to_lowercase().starts_with("x-decloud-") {
            continue;
        }
        forwarded = forwarded.header(name, value);
    }
    forwarded = forwarded
        .header("X-Forwarded-For", peer_ip)
        .header("X-Forwarded-Proto", req.connection_info().scheme().to_string())
        .header("X-Forwarded-Host", req.connection_info().host().to_string());

    match forwarded.body(body.to_vec()).send().await {
        Ok(upstream) => {
            let status = actix_web::http::StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
            let bytes = upstream.bytes().await.unwrap_or_default();
            HttpResponse::build(status).body(bytes.to_vec())
        }
        Err(_) => HttpResponse::ServiceUnavailable().finish(),
    }
}

/// Headers meaningful only to the immediate client-proxy hop (RFC 7230
/// §6.1), stripped before forwarding to the backing VM.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Splices a terminal/SFTP WebSocket session (design §4.M, §8 scenario 4):
/// the orchestrator dials the node agent's own `/api/vms/{vmId}/{terminal|
/// sftp}` WebSocket over the CGNAT-aware nodeHost rule, then forwards
/// frames verbatim in both directions until either side closes.
pub async fn splice_terminal_session(
    mut client_ws: actix_ws::Session,
    mut client_stream: actix_ws::MessageStream,
    upstream_url: String,
) -> anyhow::Result<()> {
    let (upstream_ws, _response) = tokio_tungstenite::connect_async(&upstream_url).await?;
    let (mut upstream_sink, mut upstream_stream) = upstream_ws.split();

    loop {
        tokio::select! {
            client_msg = client_stream.next() => {
                match client_msg {
                    Some(Ok(actix_ws::Message::Binary(bytes))) => {
                        if upstream_sink.send(UpstreamMessage::Binary(bytes.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(actix_ws::Message::Text(text))) => {
                        if upstream_sink.send(UpstreamMessage::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(actix_ws::Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            upstream_msg = upstream_stream.next() => {
                match upstream_msg {
                    Some(Ok(UpstreamMessage::Binary(bytes))) => {
                        if client_ws.binary(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        if client_ws.text(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = upstream_sink.close().await;
    let _ = client_ws.close(None).await;
    Ok(())
}

/// Resolves the WebSocket URL of a running VM's terminal/SFTP endpoint on
/// its owning node agent, honoring the same CGNAT tunnel-IP override as
/// HTTP subdomain routing (design §8 scenario 4).
fn upstream_terminal_url(node: &Node, vm_id: &str, private_ip: &str, kind: &str) -> String {
    let host = dial_host_for_node(node, node.public_ip.as_deref().unwrap_or_default());
    format!("ws://{host}:{}/api/vms/{vm_id}/{kind}?ip={private_ip}", node.agent_port)
}

async fn proxy_vm_session(
    req: HttpRequest,
    body: web::Payload,
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    vm_id: String,
    kind: &'static str,
) -> AppResult<HttpResponse> {
    let vm = state
        .store
        .get_vm(&vm_id)
        .filter(|vm| vm.owner_id == user.user_id)
        .ok_or_else(|| AppError::not_found("VM_NOT_FOUND", "vm not found"))?;

    if vm.status != VmStatus::Running {
        return Err(AppError::conflict("VM_NOT_RUNNING", "vm must be running to open a terminal/sftp session"));
    }

    let node_id = vm.node_id.clone().ok_or_else(|| AppError::conflict("VM_NOT_PLACED", "vm has no assigned node"))?;
    let node = state.store.get_node(&node_id).ok_or_else(|| AppError::internal("owning node missing from store"))?;
    let private_ip = vm
        .network_config
        .private_ip
        .clone()
        .ok_or_else(|| AppError::conflict("VM_NOT_NETWORKED", "vm has no private ip yet"))?;

    let upstream_url = upstream_terminal_url(&node, &vm.id, &private_ip, kind);

    let (response, client_session, client_stream) = actix_ws::handle(&req, body)?;
    meshcloud_common::task::spawn_task("proxy-vm-session", async move {
        if let Err(err) = splice_terminal_session(client_session, client_stream, upstream_url).await {
            log::warn!("{kind} proxy session for vm {vm_id} ended with error: {err:#}");
        }
    });

    Ok(response)
}

pub async fn terminal_proxy(
    req: HttpRequest,
    body: web::Payload,
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    proxy_vm_session(req, body, user, state, path.into_inner(), "terminal").await
}

pub async fn sftp_proxy(
    req: HttpRequest,
    body: web::Payload,
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    proxy_vm_session(req, body, user, state, path.into_inner(), "sftp").await
}

/// Picks the VM-facing side of a route. Node selection for the purpose of
/// dial-target resolution is the same rule `resolve_dial_target` uses, but
/// exposed standalone for callers that already hold the node (e.g. the
/// relay manager revalidating a tunnel after reassignment).
pub fn dial_host_for_node(node: &Node, fallback_public_ip: &str) -> String {
    node.cgnat_info
        .as_ref()
        .map(|c| c.tunnel_ip.clone())
        .unwrap_or_else(|| fallback_public_ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcloud_common::api::domain::{CgnatInfo, Hardware, NatType, NodeStatus};

    #[test]
    fn dial_host_prefers_tunnel_ip_when_cgnat() {
        let node = Node {
            id: "n1".into(),
            wallet_address: "0xabc".into(),
            public_ip: None,
            agent_port: 5100,
            nat_type: NatType::Cgnat,
            cgnat_info: Some(CgnatInfo { assigned_relay_node_id: "relay1".into(), tunnel_ip: "10.100.0.5".into() }),
            relay_info: None,
            hardware: Hardware { cpu_cores: 2, mem_bytes: 4 << 30, disk_bytes: 50 << 30, benchmark_score: 1500 },
            pricing: None,
            system_vm_obligations: vec![],
            last_heartbeat_at: chrono::Utc::now(),
            status: NodeStatus::Online,
            allocated_vcpus: 0,
            allocated_mem_bytes: 0,
            allocated_disk_bytes: 0,
        };
        assert_eq!(dial_host_for_node(&node, "1.2.3.4"), "10.100.0.5");
    }

    #[test]
    fn dial_host_falls_back_to_public_ip() {
        let node = Node {
            id: "n2".into(),
            wallet_address: "0xabc".into(),
            public_ip: Some("1.2.3.4".into()),
            agent_port: 5100,
            nat_type: NatType::None,
            cgnat_info: None,
            relay_info: None,
            hardware: Hardware { cpu_cores: 2, mem_bytes: 4 << 30, disk_bytes: 50 << 30, benchmark_score: 1500 },
            pricing: None,
            system_vm_obligations: vec![],
            last_heartbeat_at: chrono::Utc::now(),
            status: NodeStatus::Online,
            allocated_vcpus: 0,
            allocated_mem_bytes: 0,
            allocated_disk_bytes: 0,
        };
        assert_eq!(dial_host_for_node(&node, "1.2.3.4"), "1.2.3.4");
    }
}
