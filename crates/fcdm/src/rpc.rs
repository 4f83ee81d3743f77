//! Bidirectional capability RPC over one socket.
//!
//! Both ends of a session can call and serve. Outbound calls get a
//! per-session id and park a oneshot in the pending map until the matching
//! `Return` arrives; inbound calls are handed to the local [`Dispatch`]
//! together with a [`Responder`] that may be completed later, from any
//! thread.
//!
//! The reader and writer run as `spawn_local` tasks, so a session only makes
//! progress while its `LocalSet` is driven.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fcdm_protocol::{Call, CapId, ErrorCode, Frame, RemoteError, Reply};
use log::{debug, warn};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::LocalSet;

use crate::transport::{self, FrameReader, FrameWriter, Received, TransportError};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection closed")]
    Disconnected,

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// A completed call: the peer's reply plus any descriptors it attached.
#[derive(Debug)]
pub struct Returned {
    pub reply: Reply,
    pub fds: Vec<OwnedFd>,
}

/// Serves the calls a peer makes into this side's export table.
pub trait Dispatch {
    fn dispatch(&self, session: &RpcSession, target: CapId, call: Call, responder: Responder);
}

/// Export table with nothing in it.
pub struct NoExports;

impl Dispatch for NoExports {
    fn dispatch(&self, _session: &RpcSession, target: CapId, _call: Call, responder: Responder) {
        responder.fail(ErrorCode::UnknownCapability, format!("{target} is not exported"));
    }
}

enum WriterCommand {
    Send { frame: Frame, fds: Vec<OwnedFd> },
    Shutdown,
}

/// Completes one inbound call. Dropping it unanswered replies with an
/// internal error so the peer never waits forever.
pub struct Responder {
    id: u64,
    writer_tx: Option<mpsc::UnboundedSender<WriterCommand>>,
}

impl Responder {
    pub fn reply(self, reply: Reply) {
        self.reply_with_fds(reply, Vec::new());
    }

    pub fn reply_with_fds(mut self, reply: Reply, fds: Vec<OwnedFd>) {
        if let Some(tx) = self.writer_tx.take() {
            send_reply(&tx, self.id, reply, fds);
        }
    }

    pub fn fail(self, code: ErrorCode, message: impl Into<String>) {
        self.reply(Reply::Error(RemoteError::new(code, message)));
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.writer_tx.take() {
            warn!("call {} dropped without a reply", self.id);
            let error = RemoteError::new(ErrorCode::Internal, "call was dropped without a reply");
            send_reply(&tx, self.id, Reply::Error(error), Vec::new());
        }
    }
}

fn send_reply(
    tx: &mpsc::UnboundedSender<WriterCommand>,
    id: u64,
    reply: Reply,
    fds: Vec<OwnedFd>,
) {
    let frame = Frame::Return {
        id,
        fds: fds.len() as u8,
        reply,
    };
    if tx.send(WriterCommand::Send { frame, fds }).is_err() {
        debug!("reply to call {id} discarded: connection closed");
    }
}

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, oneshot::Sender<Returned>>,
    closed: bool,
}

struct Shared {
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

/// Handle to a running session. Cheap to clone and `Send`, so worker fibers
/// can issue calls from their own threads.
#[derive(Clone)]
pub struct RpcSession {
    shared: Arc<Shared>,
}

impl RpcSession {
    /// Starts serving `stream`. Must be called inside a `LocalSet`.
    pub fn spawn(stream: UnixStream, dispatcher: Rc<dyn Dispatch>) -> Self {
        let (reader, writer) = transport::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let session = Self {
            shared: Arc::new(Shared {
                writer_tx,
                pending: Mutex::new(Pending::default()),
                next_id: AtomicU64::new(1),
                closed,
            }),
        };

        tokio::task::spawn_local(writer_loop(writer, writer_rx));
        tokio::task::spawn_local(reader_loop(reader, session.clone(), dispatcher));
        session
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls `target` in the peer's export table.
    ///
    /// The request is queued before this returns, so calls issued in order
    /// are sent in order. A `Reply::Error` resolves to `RpcError::Remote`.
    pub fn call(
        &self,
        target: CapId,
        call: Call,
    ) -> impl Future<Output = Result<Returned, RpcError>> + Send + 'static {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let queued = {
            let mut pending = self.pending();
            if pending.closed {
                Err(RpcError::Disconnected)
            } else {
                pending.calls.insert(id, tx);
                let frame = Frame::Call { id, target, call };
                self.shared
                    .writer_tx
                    .send(WriterCommand::Send {
                        frame,
                        fds: Vec::new(),
                    })
                    .map_err(|_| RpcError::Disconnected)
            }
        };

        async move {
            queued?;
            let returned = rx.await.map_err(|_| RpcError::Disconnected)?;
            match returned.reply {
                Reply::Error(e) => Err(RpcError::Remote(e)),
                _ => Ok(returned),
            }
        }
    }

    /// Asks the writer to shut the socket down. The session is closed once
    /// the reader has seen the resulting EOF.
    pub fn close(&self) {
        let _ = self.shared.writer_tx.send(WriterCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the transport is gone and every pending call has failed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn complete(&self, id: u64, returned: Returned) {
        let sender = self.pending().calls.remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(returned);
            }
            None => warn!("reply for unknown call {id}"),
        }
    }

    fn shut_down(&self) {
        let calls = {
            let mut pending = self.pending();
            pending.closed = true;
            std::mem::take(&mut pending.calls)
        };
        if !calls.is_empty() {
            warn!("connection closed with {} calls in flight", calls.len());
        }
        // Dropping the senders fails every waiter with Disconnected.
        drop(calls);
        self.close();
        self.shared.closed.send_replace(true);
    }
}

async fn writer_loop(writer: FrameWriter, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send { frame, fds } => {
                if let Err(e) = writer.send(&frame, &fds).await {
                    warn!("failed to send frame: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    writer.shutdown();
}

async fn reader_loop(mut reader: FrameReader, session: RpcSession, dispatcher: Rc<dyn Dispatch>) {
    loop {
        match reader.next().await {
            Ok(Some(Received { frame, fds })) => match frame {
                Frame::Call { id, target, call } => {
                    let responder = Responder {
                        id,
                        writer_tx: Some(session.shared.writer_tx.clone()),
                    };
                    dispatcher.dispatch(&session, target, call, responder);
                }
                Frame::Return { id, reply, .. } => session.complete(id, Returned { reply, fds }),
            },
            Ok(None) => {
                debug!("peer closed the connection");
                break;
            }
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!("connection reset by peer");
                break;
            }
            Err(e) => {
                warn!("transport failed: {e}");
                break;
            }
        }
    }
    session.shut_down();
}

/// Single-threaded runtime plus local task set, driven only inside
/// [`EventLoop::block_on`].
pub struct EventLoop {
    runtime: Runtime,
    local: LocalSet,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            local: LocalSet::new(),
        })
    }

    /// Runs the loop until `future` completes. Panics when called from inside
    /// another runtime, which includes re-entry from a callback.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.runtime, future)
    }
}
