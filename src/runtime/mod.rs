//! Embedded runtime contract.
//!
//! A [`RuntimeProvider`] provisions a [`Runtime`]; the execution context owns
//! the runtime exclusively and drives it one request at a time. The runtime
//! keeps its global namespace and module registry between calls.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::execution::{ContextVars, OutputCapture};

pub mod python;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Unavailable(String),
    #[error("failed to install {}: {detail}", packages.join(", "))]
    Install { packages: Vec<String>, detail: String },
    /// Textual description (traceback) of an error raised by executed code.
    #[error("{0}")]
    Raised(String),
    #[error("runtime protocol error: {0}")]
    Protocol(String),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Runtime: Send {
    fn name(&self) -> &str;

    /// Install `packages` in order so later imports resolve.
    async fn install(&mut self, packages: &[String]) -> Result<(), RuntimeError>;

    /// Bind every entry of `vars` into the global namespace, overwriting.
    async fn bind(&mut self, vars: &ContextVars) -> Result<(), RuntimeError>;

    /// Remove `names` from the global namespace; missing names are ignored.
    async fn unbind(&mut self, names: &[String]) -> Result<(), RuntimeError>;

    /// Run `code`, pushing each emitted line into `output`. Returns the value of
    /// the final expression, if any.
    async fn execute(
        &mut self,
        code: &str,
        output: &mut OutputCapture,
    ) -> Result<Option<Value>, RuntimeError>;

    /// Directory whose new files are reported back after each execution.
    fn data_dir(&self) -> Option<&Path> {
        None
    }

    /// False once the runtime can no longer serve requests.
    fn is_alive(&mut self) -> bool {
        true
    }

    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn provision(&self) -> Result<Box<dyn Runtime>, RuntimeError>;
}
