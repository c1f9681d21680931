use std::fmt::{self, Display, Formatter};

#[cfg(feature = "rpc-server")]
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// The error taxonomy from the design's error-handling section. Every
/// component-level error is tagged with one of these before it reaches a
/// boundary (HTTP handler, ticker loop) that needs to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ResourceExhausted,
    Upstream,
    AttestationFailing,
    Internal,
}

impl ErrorKind {
    #[cfg(feature = "rpc-server")]
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::AttestationFailing => StatusCode::OK,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Top-level application error. Leaf components raise their own `thiserror`
/// enums (see `meshcloud-daemon`'s per-module errors) and convert into this
/// at the boundary with `.map_err(AppError::from)` / `?`, the same way the
/// teacher funnels `BlockchainError` into `InternalRpcError` at the RPC
/// boundary.
#[derive(Debug, Error)]
pub struct AppError {
    kind: ErrorKind,
    code: &'static str,
    #[source]
    source: Option<anyhow::Error>,
    message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            source: None,
            message: message.into(),
        }
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn invalid_input(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, code, message)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn resource_exhausted(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, code, message)
    }

    pub fn upstream(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "INTERNAL", message)
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Internal errors must not leak details to callers (see design's
        // error-handling section); the anyhow chain is kept as `source` for
        // logging but never rendered into the public message.
        Self::new(ErrorKind::Internal, "INTERNAL", "internal error").with_source(err)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

#[cfg(feature = "rpc-server")]
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        if self.kind == ErrorKind::Internal {
            log::error!("internal error [{}]: {:?}", self.code, self.source);
        }
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code,
            message: &self.message,
        })
    }
}

pub type AppResult<T> = Result<T, AppError>;
