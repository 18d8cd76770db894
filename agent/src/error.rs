//! Error taxonomy shared across the agent
//!
//! `Kind` mirrors the classification the Hub uses so that failures can be
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
pub enum AgentError {
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

impl AgentError {
    pub fn kind(&self) -> Kind {
        match self {
            AgentError::InvalidInput(_) => Kind::InvalidInput,
            AgentError::Transient(_) => Kind::Transient,
            AgentError::PermissionDenied(_) => Kind::PermissionDenied,
            AgentError::NotFound(_) => Kind::NotFound,
            AgentError::Fatal(_) => Kind::Fatal,
            AgentError::Policy(_) => Kind::Policy,
        }
    }
}
