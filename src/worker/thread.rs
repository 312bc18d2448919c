//! In-process worker thread
//!
//! The engine is created on the worker thread itself and never leaves it.
//! Commands arrive over an unbounded FIFO channel and are answered through
//! one-shot channels.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{Session, WorkerId, WorkerTransport};
use crate::engine::EngineFactory;
use crate::error::{DispatchError, Result};
use crate::protocol::{Request, Response};

enum Command {
    Call {
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
    },
    Shutdown,
}

pub struct ThreadTransport {
    id: WorkerId,
    commands: mpsc::UnboundedSender<Command>,
    alive: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ThreadTransport {
    /// Spawn the thread and wait for its engine
    pub async fn spawn(id: WorkerId, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));

        let thread_alive = Arc::clone(&alive);
        let thread = std::thread::Builder::new()
            .name(format!("pdf-{id}"))
            .spawn(move || {
                let engine = match catch_unwind(AssertUnwindSafe(|| factory.create())) {
                    Ok(Ok(engine)) => engine,
                    Ok(Err(failure)) => {
                        let _ = init_tx.send(Err(failure.to_string()));
                        thread_alive.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(panic) => {
                        let _ = init_tx.send(Err(panic_message(panic.as_ref())));
                        thread_alive.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));
                run(id, Session::new(engine), receiver, &thread_alive);
                thread_alive.store(false, Ordering::SeqCst);
            })
            .map_err(|e| DispatchError::WorkerUnavailable(format!("cannot spawn {id}: {e}")))?;

        match init_rx.await {
            Ok(Ok(())) => Ok(Self {
                id,
                commands,
                alive,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(reason)) => Err(DispatchError::WorkerUnavailable(format!(
                "engine creation failed on {id}: {reason}"
            ))),
            Err(_) => Err(DispatchError::WorkerUnavailable(format!(
                "{id} exited during startup"
            ))),
        }
    }
}

fn run(
    id: WorkerId,
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    alive: &AtomicBool,
) {
    while let Some(command) = commands.blocking_recv() {
        let (request, reply) = match command {
            Command::Call { request, reply } => (request, reply),
            Command::Shutdown => break,
        };

        let result = match catch_unwind(AssertUnwindSafe(|| session.execute(request))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = format!("engine panicked: {}", panic_message(panic.as_ref()));
                session.mark_fatal(reason.clone());
                Err(DispatchError::WorkerUnavailable(reason))
            }
        };
        if session.fatal().is_some() {
            alive.store(false, Ordering::SeqCst);
        }

        if let Err(Ok(response)) = reply.send(result) {
            tracing::warn!(worker = %id, operation = %response.operation(), "caller gone, discarding reply");
            session.discard(&response);
        }
    }
    tracing::debug!(worker = %id, documents = session.document_count(), "worker thread exiting");
}

#[async_trait]
impl WorkerTransport for ThreadTransport {
    fn kind(&self) -> &'static str {
        "thread"
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let unavailable = || DispatchError::WorkerUnavailable(format!("{} has exited", self.id));
        if !self.is_alive() {
            return Err(unavailable());
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Call { request, reply })
            .map_err(|_| unavailable())?;
        response.await.map_err(|_| unavailable())?
    }

    async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let id = self.id;
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            tracing::warn!(worker = %id, "worker thread did not exit cleanly");
        }
    }
}

impl Drop for ThreadTransport {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::testing::{FakeControl, Fixture};
    use crate::engine::{NativeEngine, NativeFailure, NativeResult};
    use crate::error::ErrorKind;
    use crate::protocol::{requests, Call};

    async fn open(worker: &ThreadTransport, fixture: &Fixture) -> crate::references::DocumentRef {
        let response = worker
            .call(
                requests::OpenDocument {
                    source: fixture.source(),
                    password: None,
                }
                .into(),
            )
            .await
            .unwrap();
        requests::OpenDocument::from_response(response)
            .unwrap()
            .document
    }

    #[tokio::test]
    async fn test_calls_run_on_worker_thread() {
        let control = FakeControl::new();
        let worker = ThreadTransport::spawn(WorkerId(1), control.factory())
            .await
            .unwrap();
        let document = open(&worker, &Fixture::with_pages(2)).await;

        let response = worker
            .call(requests::GetPageCount { document }.into())
            .await
            .unwrap();
        assert_eq!(
            requests::GetPageCount::from_response(response)
                .unwrap()
                .page_count,
            2
        );
        assert_eq!(control.engines_created(), 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_factory_failure_fails_spawn() {
        let factory: Arc<dyn EngineFactory> =
            Arc::new(|| -> NativeResult<Box<dyn NativeEngine>> {
                Err(NativeFailure::Fatal("no engine".into()))
            });
        let err = ThreadTransport::spawn(WorkerId(2), factory)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);
    }

    #[tokio::test]
    async fn test_panic_marks_worker_dead() {
        let control = FakeControl::new();
        let worker = ThreadTransport::spawn(WorkerId(3), control.factory())
            .await
            .unwrap();
        let document = open(&worker, &Fixture::with_pages(1)).await;

        control.panic_next();
        let err = worker
            .call(requests::GetPageCount { document }.into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);
        assert!(!worker.is_alive());

        let err = worker
            .call(requests::GetPageCount { document }.into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);
    }

    #[tokio::test]
    async fn test_abandoned_open_is_closed() {
        let control = FakeControl::new();
        control.set_delay(Duration::from_millis(100));
        let worker = ThreadTransport::spawn(WorkerId(4), control.factory())
            .await
            .unwrap();
        let open = || -> Request {
            requests::OpenDocument {
                source: Fixture::with_pages(1).source(),
                password: None,
            }
            .into()
        };

        assert!(
            tokio::time::timeout(Duration::from_millis(10), worker.call(open()))
                .await
                .is_err()
        );

        // queued behind the abandoned open and its cleanup
        worker.call(open()).await.unwrap();
        assert_eq!(control.spans_of("close_document").len(), 1);
    }
}
