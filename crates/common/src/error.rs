//! Error types for the workflow engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Workflow definition errors (cyclic DAG, no start nodes, unknown agent)
    #[error("Definition error: {0}")]
    Definition(String),

    /// A referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique-constraint violation, notably `(workflow_instance_id, node_id)`
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage errors
    #[error("Store error: {0}")]
    Store(String),

    /// Event bus errors
    #[error("Bus error: {0}")]
    Bus(String),

    /// WASM sandbox errors
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Task-group execution errors
    #[error("Execution error: {0}")]
    Execution(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient infrastructure errors: the broker re-delivers after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Bus(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Definition errors are terminal: the workflow fails with no retry
    pub fn is_definition(&self) -> bool {
        matches!(self, Error::Definition(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Store("connection reset".into()).is_retryable());
        assert!(Error::Timeout("group".into()).is_retryable());
        assert!(!Error::Definition("cyclic".into()).is_retryable());
        assert!(!Error::Conflict("dup node".into()).is_retryable());
    }
}
