//! Wire protocol between the fcdm host shim and the sandboxed worker.
//!
//! Everything that crosses the process boundary is defined here: the value
//! types of the CDM plugin ABI (version 10), the request and reply enums of the
//! three RPC interfaces (Factory, Instance, Callback), and the frame codec.

pub mod bytes;
pub mod frame;
pub mod messages;
pub mod types;

pub use frame::{FrameError, MAX_FRAME_LEN};
pub use messages::*;
pub use types::*;

/// `cdm::ContentDecryptionModule_10::kVersion`.
pub const CDM_INTERFACE_VERSION: i32 = 10;

/// `cdm::Host_10::kVersion`.
pub const HOST_INTERFACE_VERSION: i32 = 10;
