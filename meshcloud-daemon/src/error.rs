//! Component-level error enums. Each reconciler/ticker raises its own leaf
//! error type and converts into `meshcloud_common::AppError` at the RPC or
//! ticker boundary, mirroring the teacher's `BalanceError`/`StorageError`
//! funneling into `InternalRpcError`.

use meshcloud_common::{AppError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("sled error: {0}")]
    Backend(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(ref key) => {
                AppError::not_found("STORE_NOT_FOUND", format!("not found: {key}"))
            }
            other => AppError::from(anyhow::Error::new(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("escrow rpc call failed: {0}")]
    Rpc(String),
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("nonce collision, retry")]
    NonceCollision,
}

impl EscrowError {
    /// Whether the obligation/settlement reconciler should retry this error
    /// with backoff, versus mark it permanently failed (design §4.B).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EscrowError::Rpc(_) | EscrowError::NonceCollision)
    }
}

impl From<EscrowError> for AppError {
    fn from(err: EscrowError) -> Self {
        AppError::upstream("ESCROW_ERROR", err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("insufficient balance: available {available}, required {required}")]
    Insufficient { available: u64, required: u64 },
}

impl From<BalanceError> for AppError {
    fn from(err: BalanceError) -> Self {
        AppError::new(ErrorKind::ResourceExhausted, "INSUFFICIENT_BALANCE", err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no node satisfies the requested spec")]
    NoCapacity,
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        AppError::resource_exhausted("NO_CAPACITY", err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CommandBusError {
    #[error("node {0} has no reachable delivery path")]
    Unreachable(String),
    #[error("command {0} already acknowledged")]
    AlreadyAcked(String),
}

impl From<CommandBusError> for AppError {
    fn from(err: CommandBusError) -> Self {
        match err {
            CommandBusError::AlreadyAcked(_) => AppError::conflict("ALREADY_ACKED", err.to_string()),
            CommandBusError::Unreachable(_) => AppError::upstream("NODE_UNREACHABLE", err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no relay available with spare capacity")]
    NoCapacityAvailable,
    #[error("tunnel ip pool exhausted for relay {0}")]
    TunnelPoolExhausted(String),
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        AppError::resource_exhausted("RELAY_UNAVAILABLE", err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no active route for subdomain {0}")]
    NoRoute(String),
    #[error("upstream dial failed: {0}")]
    DialFailed(String),
}

impl From<ProxyError> for AppError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::NoRoute(_) => AppError::not_found("NO_ROUTE", err.to_string()),
            ProxyError::DialFailed(_) => AppError::upstream("BAD_GATEWAY", err.to_string()),
        }
    }
}
