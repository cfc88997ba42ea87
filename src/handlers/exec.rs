//! One-shot execution of a source file through a fresh worker.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use is_terminal::IsTerminal;
use serde_json::Value;
use tracing::info;

use sandbox_worker::bridge::{BridgeConfig, HostBridge};
use sandbox_worker::config::Config;
use sandbox_worker::runtime::python::{PythonConfig, PythonProvider};
use sandbox_worker::worker::WorkerConfig;
use sandbox_worker::{ExecutionRequest, ExecutionResult};

use crate::printer::{JsonPrinter, ResultPrinter};

pub struct ExecOptions {
    pub path: PathBuf,
    pub packages: Vec<String>,
    pub vars: Vec<(String, Value)>,
    pub json: bool,
    pub timeout: Option<u64>,
    pub out_dir: Option<PathBuf>,
}

/// Returns whether the execution succeeded (no `stderr`).
pub async fn run(cfg: &Config, opts: ExecOptions) -> Result<bool> {
    let code = read_source(&opts.path)?;

    let mut bridge_cfg = BridgeConfig::from_config(cfg);
    if let Some(secs) = opts.timeout {
        bridge_cfg.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    let provider = Arc::new(PythonProvider::new(PythonConfig::from_config(cfg)));
    let bridge = HostBridge::spawn(provider, WorkerConfig::from_config(cfg), bridge_cfg);

    let mut request = ExecutionRequest::new(bridge.next_id(), code).with_packages(opts.packages);
    for (name, value) in opts.vars {
        request = request
            .with_var(name.as_str(), value)
            .with_context(|| format!("invalid --var `{}`", name))?;
    }

    let result = bridge.dispatch(request).await?;
    if opts.json {
        JsonPrinter.print(&result);
    } else {
        ResultPrinter { color: io::stdout().is_terminal() }.print(&result);
    }
    if let Some(dir) = &opts.out_dir {
        save_files(&result, dir)?;
    }

    bridge.shutdown().await;
    Ok(result.is_success())
}

fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).context("reading code from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn save_files(result: &ExecutionResult, dir: &Path) -> Result<()> {
    let files = result.files.as_deref().unwrap_or_default();
    if files.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for file in files {
        let bytes = file.decode().with_context(|| format!("decoding {}", file.name))?;
        // Names come from a flat directory listing; keep only the final component anyway.
        let name = Path::new(&file.name)
            .file_name()
            .with_context(|| format!("unusable file name `{}`", file.name))?;
        let target = dir.join(name);
        std::fs::write(&target, bytes).with_context(|| format!("writing {}", target.display()))?;
        info!(path = %target.display(), "saved output file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_worker::{OutputFile, RequestId};

    #[test]
    fn collected_files_are_written_out() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExecutionResult {
            id: RequestId::from("r"),
            result: None,
            stdout: None,
            stderr: None,
            files: Some(vec![OutputFile::from_bytes("report.txt", b"ok")]),
        };
        save_files(&result, &dir.path().join("out")).unwrap();
        assert_eq!(std::fs::read(dir.path().join("out/report.txt")).unwrap(), b"ok");
    }
}
