//! Cooperative fibers for vendor calls.
//!
//! Each fiber is a dedicated OS thread with its own stack. A single-permit
//! semaphore (the baton) ensures only one fiber runs vendor code at a time.
//! A fiber gives the baton up only while it waits on a future through
//! [`Suspender::wait`], which is how a vendor call blocked on a host callback
//! lets other calls and the event loop make progress.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};

use crate::error::fatal;

#[derive(Clone)]
pub struct FiberScheduler {
    handle: Handle,
    baton: Arc<Semaphore>,
    stack_size: usize,
}

impl FiberScheduler {
    /// `handle` must belong to a runtime whose owner thread keeps driving it
    /// while fibers wait.
    pub fn new(handle: Handle, stack_size: usize) -> Self {
        Self {
            handle,
            baton: Arc::new(Semaphore::new(1)),
            stack_size,
        }
    }

    /// Starts `body` on a new fiber. The receiver resolves with its result.
    pub fn spawn<F, T>(&self, name: &str, body: F) -> io::Result<oneshot::Receiver<T>>
    where
        F: FnOnce(Arc<Suspender>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = self.handle.clone();
        let baton = Arc::clone(&self.baton);

        thread::Builder::new()
            .name(format!("fiber-{name}"))
            .stack_size(self.stack_size)
            .spawn(move || {
                let suspender = Arc::new(Suspender {
                    thread: thread::current().id(),
                    handle,
                    baton,
                    permit: Mutex::new(None),
                });
                suspender.resume();
                let output = body(Arc::clone(&suspender));
                suspender.release();
                let _ = tx.send(output);
            })?;
        Ok(rx)
    }
}

/// Suspend handle of one fiber.
pub struct Suspender {
    thread: ThreadId,
    handle: Handle,
    baton: Arc<Semaphore>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Suspender {
    /// Identity of the fiber this handle belongs to.
    pub fn id(&self) -> ThreadId {
        self.thread
    }

    /// Releases the baton, blocks this fiber until `future` completes, then
    /// takes the baton back.
    pub fn wait<F: Future>(&self, future: F) -> F::Output {
        if thread::current().id() != self.thread {
            fatal("suspend handle used outside its fiber");
        }
        self.release();
        let output = self.handle.block_on(future);
        self.resume();
        output
    }

    fn resume(&self) {
        let permit = self
            .handle
            .block_on(Arc::clone(&self.baton).acquire_owned())
            .unwrap_or_else(|_| fatal("fiber baton closed"));
        *self.permit.lock().unwrap_or_else(PoisonError::into_inner) = Some(permit);
    }

    fn release(&self) {
        self.permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
