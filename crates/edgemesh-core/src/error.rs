//! The error taxonomy surfaced to callers (spec section 6/7).
//!
//! These variants are named to match the stable error codes external
//! transports are expected to report verbatim; do not rename a variant
//! without also updating anything that serializes its `code()`.

/// Convenience alias used throughout the crate's public APIs.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node revoked: {0}")]
    NodeRevoked(String),

    #[error("node bootstrap denied")]
    NodeBootstrapDenied,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already terminal: {0}")]
    TaskAlreadyTerminal(String),

    #[error("dlq entry not found: {0}")]
    DlqEntryNotFound(String),

    #[error("token node mismatch")]
    TokenNodeMismatch,

    #[error("unauthorized")]
    Unauthorized,

    #[error("store transient failure: {0}")]
    StoreUnavailable(String),
}

impl CoreError {
    /// The stable error code named in spec.md section 6, suitable for
    /// serializing over a transport boundary.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::UnknownNode(_) => "unknown_node",
            CoreError::NodeRevoked(_) => "node_revoked",
            CoreError::NodeBootstrapDenied => "node_bootstrap_denied",
            CoreError::TaskNotFound(_) => "task_not_found",
            CoreError::TaskAlreadyTerminal(_) => "task_already_terminal",
            CoreError::DlqEntryNotFound(_) => "dlq_entry_not_found",
            CoreError::TokenNodeMismatch => "token_node_mismatch",
            CoreError::Unauthorized => "unauthorized",
            CoreError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}
