//! Host side of the worker: id generation, dispatch and reply correlation.
//!
//! Results come back from the worker on one channel in completion order. A
//! router task matches each one to the waiter registered under its id.
//!
//! An id stays reserved until the worker's reply for it reaches the router,
//! even when the caller gave up waiting. Reusing it earlier is a
//! [`BridgeError::DuplicateId`], so a late reply can never be handed to a
//! newer request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::execution::{ExecutionRequest, ExecutionResult, RequestId};
use crate::runtime::RuntimeProvider;
use crate::worker::{self, ExecutionContext, RuntimeState, WorkerConfig, WorkerHandle};

/// `stderr` of the result produced when the host stops waiting.
pub const TIMEOUT_MESSAGE: &str = "Execution timed out.";

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// How long a caller waits for its reply; `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl BridgeConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            request_timeout: cfg
                .get_u64("REQUEST_TIMEOUT")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("request id `{0}` is already in flight")]
    DuplicateId(RequestId),
    #[error("worker stopped before replying")]
    Closed,
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug)]
struct Slot {
    /// Distinguishes successive dispatches that reuse one id.
    ticket: u64,
    /// `None` once the caller abandoned the request.
    waiter: Option<oneshot::Sender<ExecutionResult>>,
}

#[derive(Debug, Default)]
struct Registry {
    next_ticket: u64,
    slots: HashMap<RequestId, Slot>,
}

type Waiters = Arc<Mutex<Registry>>;

fn lock(waiters: &Waiters) -> MutexGuard<'_, Registry> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HostBridge {
    worker: WorkerHandle,
    waiters: Waiters,
    config: BridgeConfig,
    router: JoinHandle<()>,
    worker_task: Option<JoinHandle<()>>,
}

impl HostBridge {
    /// Attach to a worker whose replies arrive on `replies`.
    pub fn new(
        worker: WorkerHandle,
        replies: mpsc::UnboundedReceiver<ExecutionResult>,
        config: BridgeConfig,
    ) -> Self {
        let waiters: Waiters = Arc::default();
        let router = tokio::spawn(route(replies, Arc::clone(&waiters)));
        Self {
            worker,
            waiters,
            config,
            router,
            worker_task: None,
        }
    }

    /// Start a fresh execution context and attach to it.
    pub fn spawn(
        provider: Arc<dyn RuntimeProvider>,
        worker_config: WorkerConfig,
        config: BridgeConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ExecutionContext::new(provider, worker_config);
        let (worker, task) = worker::spawn(context, tx);
        let mut bridge = Self::new(worker, rx, config);
        bridge.worker_task = Some(task);
        bridge
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::generate()
    }

    /// Register `request` and hand it to the worker without waiting for the reply.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Pending, BridgeError> {
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        let ticket = {
            let mut registry = lock(&self.waiters);
            if registry.slots.contains_key(&id) {
                return Err(BridgeError::DuplicateId(id));
            }
            let ticket = registry.next_ticket;
            registry.next_ticket += 1;
            registry.slots.insert(
                id.clone(),
                Slot {
                    ticket,
                    waiter: Some(tx),
                },
            );
            ticket
        };
        let pending = Pending {
            id,
            ticket,
            reply: rx,
            waiters: Arc::clone(&self.waiters),
            timeout: self.config.request_timeout,
        };
        if let Err(err) = self.worker.submit(request).await {
            // Never reached the worker, so no reply will free the id.
            pending.release();
            return Err(err.into());
        }
        debug!(id = %pending.id, "request dispatched");
        Ok(pending)
    }

    /// Submit and wait for the matching reply.
    pub async fn dispatch(&self, request: ExecutionRequest) -> Result<ExecutionResult, BridgeError> {
        self.submit(request).await?.wait().await
    }

    /// Run `code` under a generated id with no packages or context.
    pub async fn execute(&self, code: impl Into<String>) -> Result<ExecutionResult, BridgeError> {
        self.dispatch(ExecutionRequest::new(self.next_id(), code)).await
    }

    pub async fn initialize(&self, packages: Vec<String>) -> Result<(), BridgeError> {
        Ok(self.worker.initialize(packages).await?)
    }

    /// Ids the worker has not answered yet, abandoned ones included.
    pub fn in_flight(&self) -> usize {
        lock(&self.waiters).slots.len()
    }

    pub fn state(&self) -> RuntimeState {
        self.worker.state()
    }

    /// Close the mailbox and wait for the worker to finish queued requests.
    pub async fn shutdown(self) {
        let Self {
            worker,
            router,
            worker_task,
            ..
        } = self;
        drop(worker);
        if let Some(task) = worker_task {
            if let Err(err) = task.await {
                warn!(error = %err, "worker task ended abnormally");
            }
            if let Err(err) = router.await {
                warn!(error = %err, "reply router ended abnormally");
            }
        }
    }
}

/// A dispatched request awaiting its reply. Dropping it abandons the request:
/// the execution still runs, and its reply is discarded when it arrives.
#[derive(Debug)]
pub struct Pending {
    id: RequestId,
    ticket: u64,
    reply: oneshot::Receiver<ExecutionResult>,
    waiters: Waiters,
    timeout: Option<Duration>,
}

impl Pending {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub async fn wait(mut self) -> Result<ExecutionResult, BridgeError> {
        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.reply).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(id = %self.id, timeout_secs = limit.as_secs_f64(), "request timed out");
                    return Ok(ExecutionResult::failed(self.id.clone(), TIMEOUT_MESSAGE));
                }
            },
            None => (&mut self.reply).await,
        };
        received.map_err(|_| BridgeError::Closed)
    }

    fn release(&self) {
        let mut registry = lock(&self.waiters);
        if registry.slots.get(&self.id).is_some_and(|slot| slot.ticket == self.ticket) {
            registry.slots.remove(&self.id);
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        let mut registry = lock(&self.waiters);
        if let Some(slot) = registry.slots.get_mut(&self.id) {
            if slot.ticket == self.ticket {
                slot.waiter = None;
            }
        }
    }
}

async fn route(mut replies: mpsc::UnboundedReceiver<ExecutionResult>, waiters: Waiters) {
    while let Some(result) = replies.recv().await {
        let slot = lock(&waiters).slots.remove(&result.id);
        match slot {
            Some(Slot {
                waiter: Some(tx), ..
            }) => {
                if tx.send(result).is_err() {
                    debug!("waiter went away before its reply arrived");
                }
            }
            Some(Slot { waiter: None, .. }) => {
                info!(id = %result.id, "late reply for abandoned request dropped");
            }
            None => warn!(id = %result.id, "dropping reply with no pending request"),
        }
    }
    // Worker is gone; wake everyone still waiting.
    lock(&waiters).slots.clear();
}
