//! Stdio transport: NDJSON requests on stdin, NDJSON responses on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sandbox_worker::config::Config;
use sandbox_worker::error::WorkerError;
use sandbox_worker::runtime::python::{PythonConfig, PythonProvider};
use sandbox_worker::runtime::RuntimeProvider;
use sandbox_worker::worker::{self, ExecutionContext, WorkerConfig};
use sandbox_worker::{ExecutionRequest, ExecutionResult, RequestId};

pub async fn run(cfg: &Config, eager: bool, packages: Vec<String>) -> Result<()> {
    let mut worker_cfg = WorkerConfig::from_config(cfg);
    worker_cfg.eager_init |= eager;
    worker_cfg.baseline_packages.extend(packages);

    let provider = Arc::new(PythonProvider::new(PythonConfig::from_config(cfg)));
    info!("serving requests on stdin");
    serve_lines(provider, worker_cfg, BufReader::new(io::stdin()), io::stdout()).await?;
    info!("input closed, exiting");
    Ok(())
}

/// Feed NDJSON requests from `input` to a fresh worker and write one response
/// line per request to `output` until `input` ends. Hands `output` back once
/// every queued request has been answered.
pub async fn serve_lines<R, W>(
    provider: Arc<dyn RuntimeProvider>,
    worker_cfg: WorkerConfig,
    input: R,
    output: W,
) -> Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (replies, results) = mpsc::unbounded_channel();
    let (worker, worker_task) = worker::spawn(ExecutionContext::new(provider, worker_cfg), replies.clone());
    let writer = tokio::spawn(write_responses(results, output));

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("reading requests")? {
        if line.trim().is_empty() {
            continue;
        }
        match ExecutionRequest::from_json(&line) {
            Ok(request) => {
                if worker.submit(request).await.is_err() {
                    warn!("worker stopped, no longer accepting requests");
                    break;
                }
            }
            Err(err) => match recover_id(&line) {
                Some(id) => {
                    debug!(%id, error = %err, "rejecting malformed request");
                    let _ = replies.send(ExecutionResult::failed(id, WorkerError::from(err).to_string()));
                }
                None => warn!(error = %err, "skipping input line without a usable id"),
            },
        }
    }

    // EOF: let queued requests finish, then flush their responses.
    drop(worker);
    drop(replies);
    worker_task.await.context("worker task panicked")?;
    writer.await.context("response writer panicked")?
}

async fn write_responses<W>(mut results: mpsc::UnboundedReceiver<ExecutionResult>, mut output: W) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(result) = results.recv().await {
        let mut line = result.to_json();
        line.push('\n');
        output.write_all(line.as_bytes()).await.context("writing response")?;
        output.flush().await?;
    }
    Ok(output)
}

/// The `id` of a line that parsed as JSON but not as a request.
fn recover_id(line: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(line).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}
