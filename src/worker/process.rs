//! Child process worker
//!
//! The child is `pdf-dispatch worker`, serving the wire protocol on its
//! stdin and stdout. Calls are tagged with a sequence id; a reader task
//! routes each reply to the caller waiting on that id. Replies nobody waits
//! for any more are dropped, and a document opened by such a reply is
//! closed again in the child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use super::{WorkerId, WorkerTransport};
use crate::error::{DispatchError, Result};
use crate::protocol::wire::{self, Outcome, WireBody, WireReply, WireRequest};
use crate::protocol::{requests, Request, Response};

/// Command line that starts a worker child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// This executable's `worker` subcommand
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["worker".to_string()],
        })
    }

    /// Whitespace separated program and arguments
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = PathBuf::from(parts.next()?);
        Some(Self {
            program,
            args: parts.map(str::to_string).collect(),
        })
    }
}

/// Calls waiting for a reply
struct Pending {
    open: bool,
    calls: HashMap<u64, oneshot::Sender<Outcome>>,
}

struct Shared {
    id: WorkerId,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    lines: mpsc::UnboundedSender<String>,
}

impl Shared {
    fn unavailable(&self) -> DispatchError {
        DispatchError::WorkerUnavailable(format!("{} has exited", self.id))
    }

    /// Queue one message and return the receiver for its reply
    fn submit(&self, body: WireBody) -> Result<oneshot::Receiver<Outcome>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = wire::encode_line(&WireRequest { id, body })?;
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock();
        if !pending.open {
            return Err(self.unavailable());
        }
        pending.calls.insert(id, tx);
        if self.lines.send(line).is_err() {
            pending.calls.remove(&id);
            return Err(self.unavailable());
        }
        Ok(rx)
    }

    /// Stop accepting calls and fail the ones in flight
    fn close(&self) {
        let calls = {
            let mut pending = self.pending.lock();
            pending.open = false;
            std::mem::take(&mut pending.calls)
        };
        if !calls.is_empty() {
            tracing::warn!(worker = %self.id, in_flight = calls.len(), "worker exited with calls in flight");
        }
        // dropping the senders wakes every waiting caller
        drop(calls);
    }

    fn deliver(&self, reply: WireReply) {
        let Some(sender) = self.pending.lock().calls.remove(&reply.id) else {
            tracing::warn!(worker = %self.id, id = reply.id, "reply for unknown call");
            return;
        };
        let Err(outcome) = sender.send(reply.outcome) else {
            return;
        };

        let document = match outcome {
            Outcome::Ok(Response::OpenDocument(opened)) => opened.document,
            Outcome::Ok(Response::CreateDocument(created)) => created.document,
            _ => {
                tracing::warn!(worker = %self.id, id = reply.id, "caller gone, discarding reply");
                return;
            }
        };
        tracing::warn!(worker = %self.id, document = %document, "closing document of an undelivered reply");
        let close = WireBody::Call(requests::CloseDocument { document }.into());
        // the receiver is dropped; the close reply is discarded on arrival
        let _ = self.submit(close);
    }
}

pub struct ProcessTransport {
    shared: Arc<Shared>,
    child: Mutex<Option<Child>>,
}

impl ProcessTransport {
    /// Start a child and wait for it to answer a ping
    pub async fn spawn(id: WorkerId, command: &WorkerCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DispatchError::WorkerUnavailable(format!(
                    "cannot start {}: {e}",
                    command.program.display()
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(DispatchError::WorkerUnavailable(format!(
                "{id} has no stdio pipes"
            )));
        };
        let transport = Self::from_streams(id, stdout, stdin, Some(child));
        transport.ping().await?;
        Ok(transport)
    }

    /// Transport over an arbitrary reader and writer
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_streams<R, W>(id: WorkerId, reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (lines, outgoing) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id,
            pending: Mutex::new(Pending {
                open: true,
                calls: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            lines,
        });

        tokio::spawn(write_lines(id, Arc::downgrade(&shared), writer, outgoing));
        tokio::spawn(read_replies(Arc::clone(&shared), reader));

        Self {
            shared,
            child: Mutex::new(child),
        }
    }

    /// Round trip a ping through the child
    pub async fn ping(&self) -> Result<()> {
        let reply = self.shared.submit(WireBody::Ping)?;
        match reply.await {
            Ok(Outcome::Pong) => Ok(()),
            Ok(other) => Err(DispatchError::WorkerUnavailable(format!(
                "{} answered ping with {other:?}",
                self.shared.id
            ))),
            Err(_) => Err(self.shared.unavailable()),
        }
    }
}

/// Ends once the transport and the reader are gone, or on a write error
async fn write_lines<W>(
    id: WorkerId,
    shared: Weak<Shared>,
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(worker = %id, error = %e, "worker stdin closed");
            if let Some(shared) = shared.upgrade() {
                shared.close();
            }
            return;
        }
    }
}

async fn read_replies<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match wire::decode_line::<WireReply>(&line) {
                Ok(reply) => shared.deliver(reply),
                Err(e) => {
                    tracing::error!(worker = %shared.id, error = %e, "malformed reply from worker");
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(worker = %shared.id, error = %e, "worker stdout failed");
                break;
            }
        }
    }
    shared.close();
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn is_alive(&self) -> bool {
        self.shared.pending.lock().open
    }

    async fn call(&self, request: Request) -> Result<Response> {
        if request.has_pause_predicate() {
            return Err(DispatchError::UnsupportedOperation(format!(
                "{} with a pause predicate cannot cross a process boundary",
                request.operation()
            )));
        }
        let reply = self.shared.submit(WireBody::Call(request))?;
        match reply.await.map_err(|_| self.shared.unavailable())? {
            Outcome::Ok(response) => Ok(response),
            Outcome::Err(err) => Err(err),
            Outcome::Pong => Err(DispatchError::WorkerUnavailable(format!(
                "{} answered a call with a pong",
                self.shared.id
            ))),
        }
    }

    async fn shutdown(&self) {
        self.shared.close();
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::warn!(worker = %self.shared.id, error = %e, "failed to stop worker process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream, Lines};

    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::types::PageSelector;
    use crate::protocol::{Call, PausePredicate};
    use crate::references::{DocumentRef, Reference, ReferenceKind};

    /// Transport wired to an in-test peer playing the child
    fn pair() -> (ProcessTransport, Lines<BufReader<DuplexStream>>, DuplexStream) {
        let (parent_out, child_in) = duplex(4096);
        let (child_out, parent_in) = duplex(4096);
        let transport = ProcessTransport::from_streams(WorkerId(9), parent_in, parent_out, None);
        (transport, BufReader::new(child_in).lines(), child_out)
    }

    fn document() -> DocumentRef {
        DocumentRef::from_reference(Reference::generate(ReferenceKind::Document, None)).unwrap()
    }

    #[tokio::test]
    async fn test_null_annotations_decode_empty() {
        let (transport, mut requests_in, mut replies_out) = pair();

        let request = requests::GetAnnotations {
            page: PageSelector::by_index(document(), 0),
        };
        let call = tokio::spawn(async move { transport.call(request.into()).await });

        let line = requests_in.next_line().await.unwrap().unwrap();
        let sent: WireRequest = wire::decode_line(&line).unwrap();
        assert!(matches!(sent.body, WireBody::Call(Request::GetAnnotations(_))));

        let reply = format!(
            "{{\"id\":{},\"outcome\":{{\"Ok\":{{\"GetAnnotations\":{{\"annotations\":null}}}}}}}}\n",
            sent.id
        );
        replies_out.write_all(reply.as_bytes()).await.unwrap();

        let response = call.await.unwrap().unwrap();
        let annotations = requests::GetAnnotations::from_response(response)
            .unwrap()
            .annotations;
        assert!(annotations.is_empty());
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (transport, mut requests_in, mut replies_out) = pair();
        let peer = tokio::spawn(async move {
            let line = requests_in.next_line().await.unwrap().unwrap();
            let ping: WireRequest = wire::decode_line(&line).unwrap();
            assert!(matches!(ping.body, WireBody::Ping));
            let pong = wire::encode_line(&WireReply {
                id: ping.id,
                outcome: Outcome::Pong,
            })
            .unwrap();
            replies_out.write_all(pong.as_bytes()).await.unwrap();
            replies_out
        });

        transport.ping().await.unwrap();
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_child_exit_fails_calls() {
        let (transport, requests_in, replies_out) = pair();
        let call = transport.call(requests::GetPageCount { document: document() }.into());
        drop(replies_out);
        drop(requests_in);

        let err = call.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_pause_predicate_rejected() {
        let (transport, _requests_in, _replies_out) = pair();
        let request = requests::ContinueRender {
            page: PageSelector::by_index(document(), 0),
            pause: Some(PausePredicate::never()),
        };
        let err = transport.call(request.into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[test]
    fn test_worker_command_parse() {
        let command = WorkerCommand::parse("/usr/bin/pdf-dispatch worker --quiet").unwrap();
        assert_eq!(command.program, PathBuf::from("/usr/bin/pdf-dispatch"));
        assert_eq!(command.args, ["worker", "--quiet"]);
        assert!(WorkerCommand::parse("   ").is_none());
    }
}
