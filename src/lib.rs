//! Sandboxed code-execution worker.
//!
//! A [`worker::ExecutionContext`] owns one isolated interpreter runtime and
//! serves [`ExecutionRequest`]s against it one at a time; a
//! [`bridge::HostBridge`] sits in front of it, generating ids and matching
//! each [`ExecutionResult`] to its caller.

pub mod bridge;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod process;
pub mod runtime;
pub mod worker;

pub use bridge::{BridgeConfig, BridgeError, HostBridge};
pub use error::{ProtocolError, WorkerError};
pub use execution::{ContextVars, ExecutionRequest, ExecutionResult, OutputFile, RequestId};
pub use worker::{RuntimeState, WorkerConfig, WorkerHandle};
