//! Error taxonomy shared across the Hub
//!
//! `Kind` mirrors the classification the agent uses so that failures can be
//! routed (retry, surface to the operator, abort) without string matching.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    InvalidInput,
    Transient,
    PermissionDenied,
    NotFound,
    Fatal,
    Policy,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("policy violation: {0}")]
    Policy(String),
}

impl HubError {
    pub fn kind(&self) -> Kind {
        match self {
            HubError::InvalidInput(_) => Kind::InvalidInput,
            HubError::Transient(_) => Kind::Transient,
            HubError::PermissionDenied(_) => Kind::PermissionDenied,
            HubError::NotFound(_) => Kind::NotFound,
            HubError::Fatal(_) => Kind::Fatal,
            HubError::Policy(_) => Kind::Policy,
        }
    }
}
