//! Sandboxed Content Decryption Module bridge.
//!
//! The host loads the `fcdm-plugin` cdylib in place of a vendor CDM. Every
//! instance it creates spawns an `fcdm-worker` process that loads the real
//! vendor module and serves its calls over a unix socket; decrypted output is
//! handed back through a shared memory arena.
//!
//! Host side: [`shim::HostShim`], [`broker`]. Worker side: [`worker`],
//! [`vendor`], [`fiber`]. Both: [`rpc`], [`transport`], [`arena`], [`cdm`].

pub mod arena;
pub mod broker;
pub mod cdm;
pub mod config;
pub mod error;
pub mod fiber;
pub mod rpc;
pub mod shim;
pub mod transport;
pub mod vendor;
pub mod worker;

pub use config::Config;
pub use error::fatal;
pub use fcdm_protocol as protocol;
