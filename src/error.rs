//! Error types crossing module boundaries.
//!
//! Every `WorkerError` ends up as `stderr` text in a response; `Display` is
//! therefore the exact message the host sees.

use thiserror::Error;

use crate::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("`{0}` is a reserved key and cannot be used as a context variable")]
    ReservedKey(String),
    #[error("request must be a JSON object")]
    NotAnObject,
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The runtime could not be loaded; not retried by the context.
    #[error("Runtime provisioning failed: {0}")]
    Provisioning(String),
    /// Aborts the request; the code is never executed.
    #[error("Package installation failed ({}): {detail}", packages.join(", "))]
    Installation { packages: Vec<String>, detail: String },
    /// The submitted code raised.
    #[error("{0}")]
    Execution(String),
    #[error("Invalid request: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("execution context has shut down")]
    Closed,
}

impl WorkerError {
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }
}

impl From<RuntimeError> for WorkerError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(reason) => Self::Provisioning(reason),
            RuntimeError::Install { packages, detail } => Self::Installation { packages, detail },
            RuntimeError::Raised(traceback) => Self::Execution(traceback),
            other => Self::Execution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_map_onto_the_failure_taxonomy() {
        let err = WorkerError::from(RuntimeError::Unavailable("no python".into()));
        assert_eq!(err.to_string(), "Runtime provisioning failed: no python");

        let err = WorkerError::from(RuntimeError::Install {
            packages: vec!["a".into(), "b".into()],
            detail: "No matching distribution found for b".into(),
        });
        assert_eq!(
            err.to_string(),
            "Package installation failed (a, b): No matching distribution found for b"
        );

        let err = WorkerError::from(RuntimeError::Raised("ZeroDivisionError: division by zero".into()));
        assert!(err.is_execution());
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");

        let err = WorkerError::from(RuntimeError::Protocol("interpreter exited".into()));
        assert!(err.is_execution());
    }
}
