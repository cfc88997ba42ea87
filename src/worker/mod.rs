//! Execution context: owns one runtime, serializes requests to it, and
//! implements the request/response protocol.
//!
//! [`ExecutionContext`] holds the lifecycle state and the runtime handle.
//! [`spawn`] moves it onto a single tokio task fed by a bounded mailbox, so
//! requests are served one at a time in submission order; replies leave on an
//! unbounded channel so the worker never waits on the host.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::execution::{
    ContextVars, ExecutionRequest, ExecutionResult, OutputCapture, OutputFile,
};
use crate::runtime::{Runtime, RuntimeProvider};

pub mod files;

use files::{FileSnapshot, DEFAULT_MAX_FILE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Initializing,
    Ready,
    /// Provisioning failed; not retried for the life of the context.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    /// Provision as soon as the worker task starts instead of on first use.
    pub eager_init: bool,
    /// Installed right after provisioning, before the runtime counts as ready.
    pub baseline_packages: Vec<String>,
    pub collect_files: bool,
    pub max_file_size: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            eager_init: false,
            baseline_packages: Vec::new(),
            collect_files: true,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl WorkerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: cfg
                .get_usize("QUEUE_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.queue_capacity),
            eager_init: cfg.get_bool("EAGER_INIT"),
            baseline_packages: cfg.get_list("BASELINE_PACKAGES"),
            collect_files: cfg.get_bool("COLLECT_FILES"),
            max_file_size: cfg.get_u64("MAX_FILE_SIZE").unwrap_or(defaults.max_file_size),
        }
    }
}

pub struct ExecutionContext {
    provider: Arc<dyn RuntimeProvider>,
    config: WorkerConfig,
    runtime: Option<Box<dyn Runtime>>,
    state: watch::Sender<RuntimeState>,
}

impl ExecutionContext {
    pub fn new(provider: Arc<dyn RuntimeProvider>, config: WorkerConfig) -> Self {
        let (state, _) = watch::channel(RuntimeState::Uninitialized);
        Self {
            provider,
            config,
            runtime: None,
            state,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Provision the runtime (if needed) and install `packages` into it.
    pub async fn initialize(&mut self, packages: &[String]) -> Result<(), WorkerError> {
        let runtime = self.ensure_ready().await?;
        if !packages.is_empty() {
            runtime.install(packages).await?;
        }
        Ok(())
    }

    /// Serve one request. Always yields a result carrying the request's id.
    pub async fn handle(&mut self, request: ExecutionRequest) -> ExecutionResult {
        let (id, code, packages, context) = request.into_parts();
        let started = Instant::now();
        debug!(%id, packages = packages.len(), vars = context.len(), "handling request");

        let mut output = OutputCapture::new();
        let mut files = None;
        let result = match self.run(&code, &packages, &context, &mut output, &mut files).await {
            Ok(value) => value,
            Err(err) => {
                if err.is_execution() {
                    debug!(%id, "code raised");
                } else {
                    warn!(%id, error = %err, "request failed");
                }
                output.fail(&err);
                None
            }
        };
        self.reap_dead_runtime();

        let (stdout, stderr) = output.finish();
        debug!(%id, elapsed_ms = started.elapsed().as_millis() as u64, ok = stderr.is_none(), "request done");
        ExecutionResult {
            id,
            result,
            stdout,
            stderr,
            files,
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut runtime) = self.runtime.take() {
            if let Err(err) = runtime.shutdown().await {
                warn!(error = %err, "runtime shutdown failed");
            }
        }
        self.state.send_replace(RuntimeState::Uninitialized);
    }

    async fn run(
        &mut self,
        code: &str,
        packages: &[String],
        context: &ContextVars,
        output: &mut OutputCapture,
        files: &mut Option<Vec<OutputFile>>,
    ) -> Result<Option<Value>, WorkerError> {
        let collect = self.config.collect_files;
        let max_file_size = self.config.max_file_size;
        let runtime = self.ensure_ready().await?;

        if !packages.is_empty() {
            runtime.install(packages).await?;
        }

        let snapshot = match runtime.data_dir() {
            Some(dir) if collect => Some(FileSnapshot::capture(dir)),
            _ => None,
        };

        if !context.is_empty() {
            runtime.bind(context).await?;
        }
        let executed = runtime.execute(code, output).await;
        if !context.is_empty() {
            // Injected names live for exactly one execution.
            let names: Vec<String> = context.names().map(str::to_owned).collect();
            if let Err(err) = runtime.unbind(&names).await {
                warn!(error = %err, ?names, "failed to unbind context variables");
            }
        }

        if let Some(snapshot) = snapshot {
            let collected = snapshot.collect_new(max_file_size);
            if !collected.is_empty() {
                *files = Some(collected);
            }
        }

        Ok(executed?)
    }

    async fn ensure_ready(&mut self) -> Result<&mut Box<dyn Runtime>, WorkerError> {
        if let RuntimeState::Failed(reason) = self.state() {
            return Err(WorkerError::Provisioning(reason));
        }
        if self.runtime.is_none() {
            let runtime = self.provision().await?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_mut()
            .ok_or_else(|| WorkerError::Provisioning("runtime missing after provisioning".into()))
    }

    async fn provision(&mut self) -> Result<Box<dyn Runtime>, WorkerError> {
        self.state.send_replace(RuntimeState::Initializing);
        let started = Instant::now();
        info!(provider = self.provider.name(), "provisioning runtime");

        let provisioned = match self.provider.provision().await {
            Ok(mut runtime) => {
                let baseline = &self.config.baseline_packages;
                if baseline.is_empty() {
                    Ok(runtime)
                } else {
                    runtime.install(baseline).await.map(|_| runtime)
                }
            }
            Err(err) => Err(err),
        };

        match provisioned {
            Ok(runtime) => {
                self.state.send_replace(RuntimeState::Ready);
                info!(
                    runtime = runtime.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "runtime ready"
                );
                Ok(runtime)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(error = %reason, "runtime provisioning failed");
                self.state.send_replace(RuntimeState::Failed(reason.clone()));
                Err(WorkerError::Provisioning(reason))
            }
        }
    }

    /// A runtime whose process died is dropped; the next request provisions anew.
    fn reap_dead_runtime(&mut self) {
        let dead = self.runtime.as_mut().is_some_and(|rt| !rt.is_alive());
        if dead {
            warn!("runtime is no longer alive, discarding it");
            self.runtime = None;
            self.state.send_replace(RuntimeState::Uninitialized);
        }
    }
}

enum Command {
    Execute(ExecutionRequest),
    Initialize {
        packages: Vec<String>,
        done: oneshot::Sender<Result<(), WorkerError>>,
    },
}

/// Host-side handle to a running execution context. Cheap to clone; the
/// worker task stops once every handle is dropped and the mailbox drains.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RuntimeState>,
}

impl WorkerHandle {
    /// Queue a request; its result arrives on the reply channel given to [`spawn`].
    pub async fn submit(&self, request: ExecutionRequest) -> Result<(), WorkerError> {
        self.commands
            .send(Command::Execute(request))
            .await
            .map_err(|_| WorkerError::Closed)
    }

    /// Provision the runtime and install `packages`; resolves once done.
    pub async fn initialize(&self, packages: Vec<String>) -> Result<(), WorkerError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Initialize { packages, done })
            .await
            .map_err(|_| WorkerError::Closed)?;
        rx.await.map_err(|_| WorkerError::Closed)?
    }

    pub fn state(&self) -> RuntimeState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state.clone()
    }
}

/// Move `context` onto its own task.
pub fn spawn(
    context: ExecutionContext,
    replies: mpsc::UnboundedSender<ExecutionResult>,
) -> (WorkerHandle, JoinHandle<()>) {
    let (commands, mailbox) = mpsc::channel(context.config.queue_capacity.max(1));
    let handle = WorkerHandle {
        commands,
        state: context.subscribe(),
    };
    let task = tokio::spawn(serve(context, mailbox, replies));
    (handle, task)
}

async fn serve(
    mut context: ExecutionContext,
    mut mailbox: mpsc::Receiver<Command>,
    replies: mpsc::UnboundedSender<ExecutionResult>,
) {
    if context.config.eager_init {
        if let Err(err) = context.initialize(&[]).await {
            warn!(error = %err, "eager initialization failed");
        }
    }

    while let Some(command) = mailbox.recv().await {
        match command {
            Command::Execute(request) => {
                let result = context.handle(request).await;
                if replies.send(result).is_err() {
                    debug!("reply channel closed, result dropped");
                }
            }
            Command::Initialize { packages, done } => {
                let outcome = context.initialize(&packages).await;
                let _ = done.send(outcome);
            }
        }
    }

    context.shutdown().await;
    info!("execution context stopped");
}
