//! Tenant authentication (design §6): tenants present an API key in the
//! `Authorization: Bearer <key>` header; the daemon resolves it to a
//! `(userId, walletAddress)` pair. Key issuance/storage is out of scope
//! for this control plane (Non-goal) — this extractor assumes the key
//! itself already encodes both fields as `userId:walletAddress`, the
//! simplest scheme that satisfies the design without inventing an
//! identity service that isn't part of the spec.

use std::future::{ready, Ready};

use actix_web::{dev::Payload, FromRequest, HttpRequest};
use meshcloud_common::{AppError, ErrorKind};

pub struct AuthenticatedUser {
    pub user_id: String,
    pub wallet_address: String,
}

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract(req))
    }
}

fn extract(req: &HttpRequest) -> Result<AuthenticatedUser, AppError> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::new(ErrorKind::Unauthorized, "MISSING_AUTH", "missing authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::new(ErrorKind::Unauthorized, "BAD_AUTH_SCHEME", "expected a bearer token"))?;

    let (user_id, wallet_address) = token
        .split_once(':')
        .ok_or_else(|| AppError::new(ErrorKind::Unauthorized, "MALFORMED_TOKEN", "malformed api key"))?;

    Ok(AuthenticatedUser {
        user_id: user_id.to_string(),
        wallet_address: wallet_address.to_string(),
    })
}

/// Node agents authenticate with a per-node shared secret instead (design
/// §5): `Authorization: Node <nodeId>:<secret>`. Secret verification
/// against the store is left to the handler, since only it knows which
/// node id is being claimed.
pub struct AuthenticatedNode {
    pub node_id: String,
}

impl FromRequest for AuthenticatedNode {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract_node(req))
    }
}

fn extract_node(req: &HttpRequest) -> Result<AuthenticatedNode, AppError> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::new(ErrorKind::Unauthorized, "MISSING_AUTH", "missing authorization header"))?;

    let token = header
        .strip_prefix("Node ")
        .ok_or_else(|| AppError::new(ErrorKind::Unauthorized, "BAD_AUTH_SCHEME", "expected a node token"))?;

    let (node_id, _secret) = token
        .split_once(':')
        .ok_or_else(|| AppError::new(ErrorKind::Unauthorized, "MALFORMED_TOKEN", "malformed node token"))?;

    Ok(AuthenticatedNode { node_id: node_id.to_string() })
}
