//! Error types for minilease

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Lease Errors ===
    #[error("Lock service unreachable: {0}")]
    Connection(String),

    #[error("Lease already held by {0}")]
    AcquisitionConflict(String),

    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    #[error("Stale epoch: presented {presented}, current {current:?}")]
    StaleEpoch { presented: u64, current: Option<u64> },

    // === Leadership Errors ===
    #[error("Not primary: current primary is {}", .0.as_deref().unwrap_or("unknown"))]
    NotPrimary(Option<String>),

    #[error("Node is not a candidate for primary")]
    NotCandidate,

    // === Handoff Errors ===
    #[error("Handoff failed, peer unreachable: {0}")]
    HandoffUnreachable(String),

    #[error("Handoff rejected: {0}")]
    HandoffRejected(String),

    #[error("Timed out after {0:?} waiting for promotion")]
    PromotionTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::AcquisitionConflict(_)
                | Error::HandoffUnreachable(_)
                | Error::PromotionTimeout(_)
        )
    }

    /// Did the handoff exchange itself fail (as opposed to the wait after it)?
    pub fn is_handoff(&self) -> bool {
        matches!(self, Error::HandoffUnreachable(_) | Error::HandoffRejected(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotPrimary(_) | Error::AcquisitionConflict(_) | Error::StaleEpoch { .. } => {
                StatusCode::CONFLICT
            }
            Error::NotCandidate | Error::HandoffRejected(_) => StatusCode::FORBIDDEN,
            Error::InvalidConfig(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::HandoffUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::PromotionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Connection(_) | Error::LeaseExpired(_) | Error::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
