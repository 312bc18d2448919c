//! Workers
//!
//! A worker owns exactly one native engine instance and runs the calls sent
//! to it strictly one after another. Two transports sit behind
//! [`WorkerTransport`]:
//!
//! - [`ThreadTransport`]: a dedicated OS thread in this process
//! - [`ProcessTransport`]: a `pdf-dispatch worker` child process
//!
//! Both end in a [`Session`], which executes requests against the engine.

mod adapter;
mod process;
mod serve;
mod session;
mod thread;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::EngineFactory;
use crate::error::Result;
use crate::protocol::{Request, Response};

pub use process::{ProcessTransport, WorkerCommand};
pub use serve::serve;
pub use session::Session;
pub use thread::ThreadTransport;

/// Pool-unique worker id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Channel to one engine instance
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Short transport name for logs
    fn kind(&self) -> &'static str;

    /// Whether the worker can still accept calls
    fn is_alive(&self) -> bool;

    /// Run one request; calls are executed in submission order
    async fn call(&self, request: Request) -> Result<Response>;

    /// Stop the worker after the calls already queued
    async fn shutdown(&self);
}

/// How new workers are started
#[derive(Clone)]
pub enum Launcher {
    /// Engine thread in this process, engines built by the factory
    Thread(Arc<dyn EngineFactory>),
    /// Child process speaking the wire protocol
    Process(WorkerCommand),
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(_) => f.write_str("Thread"),
            Self::Process(command) => f.debug_tuple("Process").field(command).finish(),
        }
    }
}

/// Handle to one worker
pub struct Worker {
    id: WorkerId,
    transport: Box<dyn WorkerTransport>,
}

impl Worker {
    /// Start a worker and wait until its engine is ready
    pub async fn spawn(id: WorkerId, launcher: &Launcher) -> Result<Self> {
        let transport: Box<dyn WorkerTransport> = match launcher {
            Launcher::Thread(factory) => {
                Box::new(ThreadTransport::spawn(id, Arc::clone(factory)).await?)
            }
            Launcher::Process(command) => Box::new(ProcessTransport::spawn(id, command).await?),
        };
        tracing::info!(worker = %id, transport = transport.kind(), "worker started");
        Ok(Self::with_transport(id, transport))
    }

    pub fn with_transport(id: WorkerId, transport: Box<dyn WorkerTransport>) -> Self {
        Self { id, transport }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn call(&self, request: Request) -> Result<Response> {
        let operation = request.operation();
        tracing::debug!(worker = %self.id, operation = %operation, "dispatching call");
        let result = self.transport.call(request).await;
        if let Err(err) = &result {
            tracing::debug!(worker = %self.id, operation = %operation, error = %err, "call failed");
        }
        result
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
        tracing::info!(worker = %self.id, "worker retired");
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("transport", &self.transport.kind())
            .field("alive", &self.is_alive())
            .finish()
    }
}
