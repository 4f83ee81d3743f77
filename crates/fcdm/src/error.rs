//! Bridge-level error types and the fatal-assertion path.

use std::fmt::Display;
use std::io;
use std::path::PathBuf;

use fcdm_protocol::RemoteError;
use thiserror::Error;

use crate::arena::ArenaError;
use crate::config::ConfigError;
use crate::rpc::RpcError;

/// Result type for instance bootstrap.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Returned by ABI methods this bridge does not forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CdmError {
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

/// Everything that can go wrong before an instance exists. Surfaced to the
/// host as a null instance or version handle.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No worker executable configured.
    #[error("worker path is not configured (set FCDM_WORKER_PATH)")]
    WorkerPathUnset,

    /// The host passed no usable host interface.
    #[error("host interface version {0} unavailable")]
    NoHost(i32),

    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    /// Socket pair creation or registration failed.
    #[error("transport setup failed: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to spawn worker {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start event loop: {0}")]
    EventLoop(#[source] io::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] RpcError),

    /// The worker answered with something other than the expected reply.
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    /// CreateInstance succeeded but carried no arena descriptor.
    #[error("worker did not pass an arena descriptor")]
    MissingArena,

    #[error("worker arena is {worker} bytes, expected {host}")]
    ArenaSizeMismatch { worker: u32, host: u32 },

    #[error("failed to map arena: {0}")]
    Arena(#[from] ArenaError),
}

impl From<RemoteError> for BootstrapError {
    fn from(err: RemoteError) -> Self {
        Self::Rpc(RpcError::Remote(err))
    }
}

/// Reports a broken invariant and terminates.
///
/// Release and dev builds abort on panic, so this takes the whole process
/// down; tests still unwind.
#[track_caller]
pub fn fatal(message: impl Display) -> ! {
    log::error!("fatal: {message}");
    panic!("{message}");
}
