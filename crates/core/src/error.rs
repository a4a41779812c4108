//! Error taxonomy for the guardrail subsystem.
//!
//! Validation failures are rejected before any append; `RaceConflict` is
//! retried internally once before surfacing; `Transport` never rolls back
//! the state mutation it trailed.

use thiserror::Error;

use crate::chain::ChainStatus;

#[derive(Debug, Clone, Error)]
pub enum GuardrailError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("concurrent mutation conflict: {0}")]
    RaceConflict(String),

    #[error("export blocked: evidence chain is {status} ({reason})", status = .status.as_str())]
    ChainIntegrity { status: ChainStatus, reason: String },

    #[error("realtime transport failure: {0}")]
    Transport(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl GuardrailError {
    pub fn validation(msg: &str) -> Self {
        Self::Validation(vec![msg.to_string()])
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Permission(_) => "permission_denied",
            Self::RaceConflict(_) => "race_conflict",
            Self::ChainIntegrity { .. } => "chain_integrity",
            Self::Transport(_) => "transport_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_integrity_message_names_the_status() {
        let err = GuardrailError::ChainIntegrity {
            status: ChainStatus::Broken,
            reason: "hash mismatch at sequence 3".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("broken"));
        assert!(msg.contains("sequence 3"));
    }
}
