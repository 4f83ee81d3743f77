//! Worker process lifecycle.
//!
//! Each instance gets its own worker, connected over a socket pair whose
//! worker end is inherited by the child and named by its descriptor number.
//! Children are started with `std::process` rather than tokio's process
//! driver so the embedding host's SIGCHLD handling is left alone.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use fcdm_protocol::{Call, CapId, FactoryRequest, Reply};
use log::{debug, info, warn};
use tokio::net::UnixStream;

use crate::config::Config;
use crate::error::{BootstrapError, BootstrapResult};
use crate::rpc::{EventLoop, NoExports, RpcSession};

/// How long a worker gets to exit on its own after its socket closes.
pub const WORKER_EXIT_GRACE: Duration = Duration::from_secs(2);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Starts a worker. Returns the host end of its socket.
pub fn spawn_worker(config: &Config) -> BootstrapResult<(StdUnixStream, WorkerProcess)> {
    let path = config
        .worker_path
        .as_ref()
        .ok_or(BootstrapError::WorkerPathUnset)?;

    // Both ends start close-on-exec; the child clears the flag on its end.
    let (host_end, worker_end) = StdUnixStream::pair().map_err(BootstrapError::Socket)?;
    let fd = worker_end.as_raw_fd();

    let mut command = Command::new(path);
    command.arg(fd.to_string());
    unsafe {
        command.pre_exec(move || inherit(fd));
    }
    let child = command.spawn().map_err(|source| BootstrapError::Spawn {
        path: path.clone(),
        source,
    })?;
    drop(worker_end);

    info!("spawned worker {} (pid {})", path.display(), child.id());
    Ok((host_end, WorkerProcess { child: Some(child) }))
}

/// Clears `FD_CLOEXEC`. Runs between fork and exec, so only
/// async-signal-safe calls are allowed.
fn inherit(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Asks a fresh worker for the vendor version, then tears it down.
pub fn query_version(config: &Config) -> BootstrapResult<String> {
    let (stream, worker) = spawn_worker(config)?;
    stream.set_nonblocking(true).map_err(BootstrapError::Socket)?;
    let io = EventLoop::new().map_err(BootstrapError::EventLoop)?;

    let version = io.block_on(async {
        let stream = UnixStream::from_std(stream).map_err(BootstrapError::Socket)?;
        let session = RpcSession::spawn(stream, Rc::new(NoExports));
        let returned = session
            .call(CapId::FACTORY, Call::Factory(FactoryRequest::GetVersion))
            .await;
        session.close();
        session.closed().await;
        match returned?.reply {
            Reply::Version { version } => Ok::<_, BootstrapError>(version),
            _ => Err(BootstrapError::UnexpectedReply("GetVersion")),
        }
    });
    drop(io);
    worker.shutdown(WORKER_EXIT_GRACE);

    let version = version?;
    debug!("vendor version {version}");
    Ok(version)
}

/// A spawned worker. Dropping it kills and reaps the child.
pub struct WorkerProcess {
    child: Option<Child>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Waits up to `grace` for the worker to exit, then kills it.
    pub fn shutdown(mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        info!("worker {} exited", child.id());
                    } else {
                        warn!("worker {} exited with {status}", child.id());
                    }
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => {
                    warn!("worker {} did not exit within {grace:?}", child.id());
                    break;
                }
                Err(e) => {
                    warn!("failed to poll worker {}: {e}", child.id());
                    break;
                }
            }
        }
        reap(child);
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            reap(child);
        }
    }
}

fn reap(mut child: Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        debug!("kill worker {pid}: {e}");
    }
    match child.wait() {
        Ok(status) => debug!("reaped worker {pid}: {status}"),
        Err(e) => warn!("failed to reap worker {pid}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_unset_worker_path() {
        let config = Config::default();
        assert!(matches!(
            spawn_worker(&config),
            Err(BootstrapError::WorkerPathUnset)
        ));
    }

    #[test]
    fn test_missing_worker_executable() {
        let config = Config {
            worker_path: Some(PathBuf::from("/nonexistent/fcdm-worker")),
            ..Config::default()
        };
        match spawn_worker(&config) {
            Err(BootstrapError::Spawn { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/fcdm-worker"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawned a nonexistent worker"),
        }
    }

    #[test]
    fn test_spawned_worker_is_reaped() {
        // /bin/sh takes the descriptor number for a script name and exits.
        let config = Config {
            worker_path: Some(PathBuf::from("/bin/sh")),
            ..Config::default()
        };
        let (_stream, worker) = spawn_worker(&config).unwrap();
        assert!(worker.pid().is_some());
        worker.shutdown(Duration::from_secs(5));
    }
}
