//! `/hub/orchestrator` event stream (design §A3.1): a WebSocket that fans
//! out `OrchestratorEvent`s to subscribed dashboard/CLI clients, scoped to
//! the authenticated tenant's own events plus system-wide ones.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};

use crate::rpc::auth::AuthenticatedUser;
use crate::rpc::state::AppState;

pub async fn orchestrator_hub(
    req: HttpRequest,
    body: web::Payload,
    user: AuthenticatedUser,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, mut session, _msg_stream) = actix_ws::handle(&req, body)?;
    let mut events = state.events.subscribe();
    let user_id = user.user_id;

    meshcloud_common::task::spawn_task("orchestrator-hub-client", async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let scoped = event.owner().map(|owner| owner == user_id).unwrap_or(true);
                    if !scoped {
                        continue;
                    }
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if session.text(json).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = session.close(None).await;
    });

    Ok(response)
}
