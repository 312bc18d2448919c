//! Dispatcher
//!
//! Single entry point for callers. Routes each request to the worker that
//! owns the document named by its references, opens documents through the
//! instance pool, and bounds every call with a deadline.
//!
//! ```text
//!   send(request, deadline)
//!     ├─ Route::Open        ─▶ pool lease ─▶ worker ─▶ commit(document)
//!     └─ Route::Scope(doc)  ─▶ owner worker ─▶ response
//!                                  └─ CloseDocument: release ownership
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::config::{Isolation, PoolConfig};
use crate::engine::{self, EngineFactory};
use crate::error::{DispatchError, Result};
use crate::pool::{InstanceManager, PoolStats};
use crate::protocol::{requests, Call, Request, Response, Route};
use crate::references::DocumentRef;
use crate::worker::{Launcher, WorkerCommand};

pub struct Dispatcher {
    pool: InstanceManager,
    call_timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher over the compiled-in engine, honouring `config.isolation`
    pub fn new(config: PoolConfig) -> Result<Self> {
        let launcher = match config.isolation {
            Isolation::Thread => Launcher::Thread(engine::default_factory()),
            Isolation::Process => {
                let command = match &config.worker_command {
                    Some(command) => command.clone(),
                    None => WorkerCommand::current_exe()?,
                };
                Launcher::Process(command)
            }
        };
        Self::with_launcher(config, launcher)
    }

    /// In-process workers built by `factory`
    pub fn with_factory(config: PoolConfig, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        Self::with_launcher(config, Launcher::Thread(factory))
    }

    pub fn with_launcher(config: PoolConfig, launcher: Launcher) -> Result<Self> {
        let call_timeout = config.call_timeout;
        Ok(Self {
            pool: InstanceManager::new(config, launcher)?,
            call_timeout,
        })
    }

    /// Send one request with the default deadline
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.send_with_deadline(request, self.call_timeout).await
    }

    /// Send one request; `Timeout` once `deadline` has passed
    ///
    /// The worker finishes a call that timed out and drops its result.
    pub async fn send_with_deadline(&self, request: Request, deadline: Duration) -> Result<Response> {
        let operation = request.operation();
        match tokio::time::timeout(deadline, self.route(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation = %operation, ?deadline, "call timed out");
                Err(DispatchError::Timeout(deadline))
            }
        }
    }

    /// Typed form of [`Dispatcher::send`]
    pub async fn call<C: Call>(&self, request: C) -> Result<C::Output> {
        self.call_with_deadline(request, self.call_timeout).await
    }

    /// Typed form of [`Dispatcher::send_with_deadline`]
    pub async fn call_with_deadline<C: Call>(&self, request: C, deadline: Duration) -> Result<C::Output> {
        let response = self.send_with_deadline(request.into(), deadline).await?;
        C::from_response(response)
    }

    /// Open a document, run `body` against it and close it again
    ///
    /// The document is closed whether or not `body` succeeds; the body's
    /// error wins over a close error.
    pub async fn with_document<T, E, F>(
        &self,
        open: requests::OpenDocument,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'a> FnOnce(&'a Dispatcher, DocumentRef) -> BoxFuture<'a, std::result::Result<T, E>>,
        E: From<DispatchError>,
    {
        let document = self.call(open).await?.document;
        let result = body(self, document).await;
        let closed = self.call(requests::CloseDocument { document }).await;
        let value = result?;
        closed?;
        Ok(value)
    }

    async fn route(&self, request: Request) -> Result<Response> {
        let operation = request.operation();
        match request.route()? {
            Route::Open => self.open(request).await,
            Route::Scope(scope) => {
                let worker = match self.pool.worker_for(scope) {
                    Ok(worker) => worker,
                    Err(err) => {
                        // a dead owner still gives its capacity back on close
                        if matches!(request, Request::CloseDocument(_))
                            && matches!(err, DispatchError::WorkerUnavailable(_))
                        {
                            self.pool.release_document(scope).await;
                        }
                        return Err(err);
                    }
                };

                let response = if matches!(request, Request::CloseDocument(_)) {
                    // runs to completion even if the caller's deadline drops us
                    let pool = self.pool.clone();
                    let closing = Arc::clone(&worker);
                    let close = tokio::spawn(async move {
                        let result = closing.call(request).await;
                        pool.release_document(scope).await;
                        result
                    });
                    close.await.map_err(|err| {
                        DispatchError::WorkerUnavailable(format!("close of {scope} aborted: {err}"))
                    })??
                } else {
                    worker.call(request).await?
                };
                if response.operation() != operation {
                    return Err(DispatchError::WorkerUnavailable(format!(
                        "{} answered {operation} with {}",
                        worker.id(),
                        response.operation()
                    )));
                }
                Ok(response)
            }
        }
    }

    async fn open(&self, request: Request) -> Result<Response> {
        let operation = request.operation();
        let lease = self.pool.acquire_for_open().await?;
        let response = lease.worker().call(request).await?;

        let document = match &response {
            Response::OpenDocument(opened) => opened.document,
            Response::CreateDocument(created) => created.document,
            other => {
                return Err(DispatchError::WorkerUnavailable(format!(
                    "{} answered {operation} with {}",
                    lease.worker().id(),
                    other.operation()
                )))
            }
        };
        lease.commit(document)?;
        Ok(response)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn pool(&self) -> &InstanceManager {
        &self.pool
    }

    /// Stop all workers; open documents are closed by their workers
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
