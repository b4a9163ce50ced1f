//! Post-commit signal dispatcher.
//!
//! Four named signals exist: `new_entry`, `edit_entry`, `new_logbook`,
//! `edit_logbook`. Handlers come from configuration, keyed by signal
//! name, and receive a serialised snapshot of the subject: plain data in
//! the JSON API shape, never a live entity, so they cannot reach back
//! into the store.
//!
//! Dispatch is fire-and-forget and strictly post-commit: nothing fires on
//! failure paths, there is no ordering between handlers, no retry, no
//! persistence. Handlers run on a bounded worker pool behind a bounded
//! queue; when the queue is full the job is dropped with a warning
//! instead of stalling the request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{Semaphore, mpsc};

/// The named signals fired after successful create/edit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    NewEntry,
    EditEntry,
    NewLogbook,
    EditLogbook,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Self::NewEntry => "new_entry",
            Self::EditEntry => "edit_entry",
            Self::NewLogbook => "new_logbook",
            Self::EditLogbook => "edit_logbook",
        }
    }
}

/// A configured action. Errors are logged and isolated; they never reach
/// the request that fired the signal.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, payload: Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Runs a configured command line with the JSON snapshot on stdin.
pub struct CommandHandler {
    command: String,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ActionHandler for CommandHandler {
    async fn run(&self, payload: Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.to_string().as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(format!("action command exited with {status}").into());
        }
        Ok(())
    }
}

struct Job {
    signal: Signal,
    payload: Value,
}

/// Owns the handler table and the worker pool. Cheap to clone; all clones
/// feed the same queue.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<HashMap<Signal, Arc<dyn ActionHandler>>>,
    queue: Option<mpsc::Sender<Job>>,
}

impl Dispatcher {
    /// Starts the dispatcher with a bounded queue and at most `workers`
    /// concurrently running handlers.
    pub fn new(
        handlers: HashMap<Signal, Arc<dyn ActionHandler>>,
        queue_size: usize,
        workers: usize,
    ) -> Self {
        let handlers = Arc::new(handlers);
        if handlers.is_empty() {
            return Self {
                handlers,
                queue: None,
            };
        }

        let (tx, mut rx) = mpsc::channel::<Job>(queue_size.max(1));
        let pool = Arc::new(Semaphore::new(workers.max(1)));
        let table = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(handler) = table.get(&job.signal).map(Arc::clone) else {
                    continue;
                };
                // Queue drains only as fast as the pool allows; the
                // channel bound provides the backpressure limit.
                let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
                    break;
                };
                let signal = job.signal;
                tokio::spawn(async move {
                    if let Err(err) = handler.run(job.payload).await {
                        tracing::error!(signal = signal.name(), %err, "action handler failed");
                    }
                    drop(permit);
                });
            }
        });

        Self {
            handlers,
            queue: Some(tx),
        }
    }

    /// A dispatcher with no configured actions; every dispatch is a no-op.
    pub fn disabled() -> Self {
        Self::new(HashMap::new(), 1, 1)
    }

    /// Fire a signal. Must only be called after the originating
    /// transaction has committed.
    pub fn dispatch(&self, signal: Signal, payload: Value) {
        if !self.handlers.contains_key(&signal) {
            return;
        }
        let Some(queue) = &self.queue else {
            return;
        };
        match queue.try_send(Job { signal, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(signal = signal.name(), "action queue full, dropping job");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(signal = signal.name(), "action worker gone, dropping job");
            }
        }
    }
}
