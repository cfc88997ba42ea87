//! CPython runtime: a child interpreter driven over the NDJSON protocol.
//!
//! Each provisioned runtime gets a private scratch directory holding the
//! package target (`site-packages`) and the data directory the executed code
//! runs in, unless both are pinned by configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Runtime, RuntimeError, RuntimeProvider};
use crate::config::Config;
use crate::execution::python::{decode, encode, ChildCommand, ChildEvent};
use crate::execution::{ContextVars, OutputCapture, Stream};
use crate::process::pip::PipInstaller;
use crate::process::python::{resolve_interpreter, start_python, PythonLaunch};
use crate::process::ProcessHandle;

pub const BOOTSTRAP: &str = include_str!("bootstrap.py");

#[derive(Debug, Clone)]
pub struct PythonConfig {
    /// Interpreter to launch; `None` searches PATH.
    pub python_bin: Option<PathBuf>,
    /// Shared package directory; `None` uses a per-runtime scratch dir.
    pub package_dir: Option<PathBuf>,
    /// Working/data directory; `None` uses a per-runtime scratch dir.
    pub data_dir: Option<PathBuf>,
    pub index_url: Option<String>,
    pub no_index: bool,
    pub startup_timeout: Duration,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            python_bin: None,
            package_dir: None,
            data_dir: None,
            index_url: None,
            no_index: false,
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl PythonConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let defaults = Self::default();
        Self {
            python_bin: cfg.get_path("PYTHON_BIN"),
            package_dir: cfg.get_path("PACKAGE_DIR"),
            data_dir: cfg.get_path("DATA_DIR"),
            index_url: cfg.get_opt("PIP_INDEX_URL"),
            no_index: cfg.get_bool("PIP_NO_INDEX"),
            startup_timeout: cfg
                .get_u64("STARTUP_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PythonProvider {
    config: PythonConfig,
}

impl PythonProvider {
    pub fn new(config: PythonConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuntimeProvider for PythonProvider {
    fn name(&self) -> &str {
        "python"
    }

    async fn provision(&self) -> Result<Box<dyn Runtime>, RuntimeError> {
        let interpreter = resolve_interpreter(self.config.python_bin.as_deref()).ok_or_else(|| {
            RuntimeError::Unavailable(match &self.config.python_bin {
                Some(p) => format!("Python interpreter not found: {}", p.display()),
                None => "no Python interpreter (python3 or python) found on PATH".to_string(),
            })
        })?;

        let scratch = tempfile::Builder::new()
            .prefix("sandbox-worker-")
            .tempdir()
            .map_err(|e| RuntimeError::Unavailable(format!("cannot create scratch dir: {}", e)))?;
        let site_dir = self
            .config
            .package_dir
            .clone()
            .unwrap_or_else(|| scratch.path().join("site-packages"));
        let data_dir = self
            .config
            .data_dir
            .clone()
            .unwrap_or_else(|| scratch.path().join("data"));
        for dir in [&site_dir, &data_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                RuntimeError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let launch = PythonLaunch {
            interpreter: &interpreter,
            bootstrap: BOOTSTRAP,
            site_dir: &site_dir,
            work_dir: &data_dir,
        };
        let mut handle = start_python(&launch).await.map_err(|e| {
            RuntimeError::Unavailable(format!("failed to start {}: {}", interpreter.display(), e))
        })?;

        let version = match timeout(self.config.startup_timeout, handle.stdout.next_line()).await {
            Ok(Ok(Some(line))) => match decode(&line) {
                Ok(ChildEvent::Ready { version }) => version,
                _ => {
                    return Err(RuntimeError::Unavailable(format!(
                        "unexpected interpreter greeting: {}",
                        line
                    )))
                }
            },
            Ok(Ok(None)) => {
                let detail = handle.drain_stderr().join("\n");
                return Err(RuntimeError::Unavailable(format!(
                    "interpreter exited during startup{}",
                    if detail.is_empty() { String::new() } else { format!(": {}", detail) }
                )));
            }
            Ok(Err(e)) => return Err(RuntimeError::Unavailable(format!("interpreter I/O: {}", e))),
            Err(_) => {
                return Err(RuntimeError::Unavailable(format!(
                    "interpreter did not start within {}s",
                    self.config.startup_timeout.as_secs()
                )))
            }
        };

        info!(
            interpreter = %interpreter.display(),
            %version,
            site_dir = %site_dir.display(),
            data_dir = %data_dir.display(),
            "python runtime ready"
        );

        let installer = PipInstaller::new(
            interpreter,
            site_dir,
            self.config.index_url.clone(),
            self.config.no_index,
        );
        Ok(Box::new(PythonRuntime {
            handle,
            installer,
            data_dir,
            _scratch: scratch,
        }))
    }
}

pub struct PythonRuntime {
    handle: ProcessHandle,
    installer: PipInstaller,
    data_dir: PathBuf,
    // Removed when the runtime is dropped.
    _scratch: TempDir,
}

/// Terminal event of one command exchange.
enum Settled {
    Ack,
    Done {
        result: Option<Value>,
        error: Option<String>,
    },
}

impl PythonRuntime {
    async fn send(&mut self, command: &ChildCommand<'_>) -> Result<(), RuntimeError> {
        let line = encode(command).map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        self.handle.send_line(&line).await?;
        Ok(())
    }

    /// Read events until the command settles, forwarding output lines.
    async fn settle(
        &mut self,
        mut output: Option<&mut OutputCapture>,
    ) -> Result<Settled, RuntimeError> {
        let mut raw_open = true;
        loop {
            tokio::select! {
                biased;
                line = self.handle.stdout.next_line() => {
                    let Some(line) = line? else {
                        let detail = self.handle.drain_stderr().join("\n");
                        return Err(RuntimeError::Protocol(if detail.is_empty() {
                            "interpreter exited unexpectedly".to_string()
                        } else {
                            format!("interpreter exited unexpectedly: {}", detail)
                        }));
                    };
                    let event = decode(&line).map_err(|e| {
                        RuntimeError::Protocol(format!("undecodable event {:?}: {}", line, e))
                    })?;
                    match event {
                        ChildEvent::Stdout { text } => {
                            if let Some(out) = output.as_deref_mut() {
                                out.push(Stream::Stdout, &text);
                            }
                        }
                        ChildEvent::Stderr { text } => {
                            if let Some(out) = output.as_deref_mut() {
                                out.push(Stream::Stderr, &text);
                            }
                        }
                        ChildEvent::Ack => return Ok(Settled::Ack),
                        ChildEvent::Done { result, error } => {
                            return Ok(Settled::Done { result, error })
                        }
                        ChildEvent::Fault { message } => {
                            return Err(RuntimeError::Protocol(message))
                        }
                        ChildEvent::Ready { .. } => {
                            return Err(RuntimeError::Protocol("unexpected ready event".into()))
                        }
                    }
                }
                raw = self.handle.stderr.recv(), if raw_open => {
                    match raw {
                        Some(text) => match output.as_deref_mut() {
                            Some(out) => out.push(Stream::Stderr, &text),
                            None => debug!(%text, "interpreter stderr"),
                        },
                        None => raw_open = false,
                    }
                }
            }
        }
    }

    async fn expect_ack(&mut self, command: &ChildCommand<'_>) -> Result<(), RuntimeError> {
        self.send(command).await?;
        match self.settle(None).await? {
            Settled::Ack => Ok(()),
            Settled::Done { .. } => Err(RuntimeError::Protocol("expected ack, got done".into())),
        }
    }
}

#[async_trait]
impl Runtime for PythonRuntime {
    fn name(&self) -> &str {
        "python"
    }

    async fn install(&mut self, packages: &[String]) -> Result<(), RuntimeError> {
        self.installer.install(packages).await
    }

    async fn bind(&mut self, vars: &ContextVars) -> Result<(), RuntimeError> {
        self.expect_ack(&ChildCommand::Bind { vars: vars.as_map() }).await
    }

    async fn unbind(&mut self, names: &[String]) -> Result<(), RuntimeError> {
        self.expect_ack(&ChildCommand::Unbind { names }).await
    }

    async fn execute(
        &mut self,
        code: &str,
        output: &mut OutputCapture,
    ) -> Result<Option<Value>, RuntimeError> {
        for text in self.handle.drain_stderr() {
            debug!(%text, "stale interpreter stderr");
        }
        self.send(&ChildCommand::Exec { code }).await?;
        match self.settle(Some(output)).await? {
            Settled::Done { error: Some(traceback), .. } => Err(RuntimeError::Raised(traceback)),
            Settled::Done { result, error: None } => Ok(result),
            Settled::Ack => Err(RuntimeError::Protocol("expected done, got ack".into())),
        }
    }

    fn data_dir(&self) -> Option<&Path> {
        Some(&self.data_dir)
    }

    fn is_alive(&mut self) -> bool {
        self.handle.is_alive()
    }

    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if !self.handle.is_alive() {
            return Ok(());
        }
        if let Err(err) = self.expect_ack(&ChildCommand::Shutdown).await {
            warn!(error = %err, "interpreter did not acknowledge shutdown");
        }
        match timeout(Duration::from_secs(5), self.handle.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(%status, "interpreter exited");
            }
            Err(_) => {
                warn!("interpreter still running after shutdown, killing it");
                self.handle.child.kill().await?;
            }
        }
        Ok(())
    }
}
