//! fcdm-worker - Sandboxed host for a vendor Content Decryption Module.
//!
//! Spawned by the fcdm plugin, one process per CDM instance. The only
//! argument is the number of an inherited unix socket descriptor; the
//! vendor module path comes from the fcdm configuration. Logging is
//! controlled through `RUST_LOG`.
//!
//! ## Usage
//!
//! ```bash
//! FCDM_CDM_SO_PATH=/opt/cdm/libvendor-cdm.so fcdm-worker 3
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use fcdm::Config;
use fcdm::config::CDM_PATH_ENV;
use fcdm::vendor::VendorHandle;
use fcdm::worker;

#[derive(Parser, Debug)]
#[command(
    name = "fcdm-worker",
    about = "Sandboxed host for a vendor CDM",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Args {
    /// Inherited socket descriptor connected to the plugin.
    #[arg(allow_negative_numbers = true)]
    socket_fd: RawFd,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Validate the descriptor before taking ownership of it.
    if args.socket_fd < 0 {
        bail!("invalid socket descriptor {}", args.socket_fd);
    }
    let borrowed = unsafe { BorrowedFd::borrow_raw(args.socket_fd) };
    rustix::io::fcntl_setfd(borrowed, rustix::io::FdFlags::CLOEXEC)
        .with_context(|| format!("descriptor {} is not usable", args.socket_fd))?;
    let socket = UnixStream::from(unsafe { OwnedFd::from_raw_fd(args.socket_fd) });

    let config = Config::load().context("failed to load configuration")?;
    let cdm_path = config
        .cdm_path
        .clone()
        .with_context(|| format!("vendor module path is not configured (set {CDM_PATH_ENV})"))?;

    info!(
        "Starting fcdm-worker {} (pid={}, fd={}, vendor={:?})",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        args.socket_fd,
        cdm_path
    );

    worker::serve(socket, VendorHandle::lazy(cdm_path), config)
        .context("worker event loop failed")?;

    info!("fcdm-worker exiting");
    Ok(())
}
