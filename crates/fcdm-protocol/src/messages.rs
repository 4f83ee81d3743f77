//! Requests and replies of the Factory, Instance and Callback interfaces.
//!
//! Each frame on the socket is either a `Call` addressed to a capability in the
//! receiver's export table, or the `Return` for an earlier call. Replies are a
//! single enum shared by every interface; each method documents which variant
//! it produces.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Address of an exported capability in the receiving side's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapId(pub u32);

impl CapId {
    /// The worker's bootstrap Factory, exported from process start.
    pub const FACTORY: Self = Self(0);
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

// ============================================================================
// Framing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Call {
        id: u64,
        target: CapId,
        call: Call,
    },
    Return {
        id: u64,
        /// Number of descriptors sent alongside this frame.
        #[serde(default)]
        fds: u8,
        reply: Reply,
    },
}

impl Frame {
    pub fn attached_fds(&self) -> usize {
        match self {
            Frame::Call { .. } => 0,
            Frame::Return { fds, .. } => usize::from(*fds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "interface", content = "request", rename_all = "snake_case")]
pub enum Call {
    Factory(FactoryRequest),
    Instance(InstanceRequest),
    Callback(CallbackRequest),
}

// ============================================================================
// Factory (worker-served, CapId::FACTORY)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FactoryRequest {
    /// Creates a vendor instance. Replies `Reply::Instance` with the arena
    /// memfd attached.
    CreateInstance {
        abi_version: i32,
        key_system: String,
        /// Callback capability in the caller's table.
        callback: CapId,
    },
    /// Replies `Reply::Version`.
    GetVersion,
}

// ============================================================================
// Instance (worker-served)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InstanceRequest {
    Initialize {
        allow_distinctive_identifier: bool,
        allow_persistent_state: bool,
        use_hw_secure_codecs: bool,
    },
    SetServerCertificate {
        promise_id: u32,
        #[serde(with = "crate::bytes")]
        certificate: Vec<u8>,
    },
    CreateSessionAndGenerateRequest {
        promise_id: u32,
        session_type: SessionType,
        init_data_type: InitDataType,
        #[serde(with = "crate::bytes")]
        init_data: Vec<u8>,
    },
    UpdateSession {
        promise_id: u32,
        #[serde(with = "crate::bytes")]
        session_id: Vec<u8>,
        #[serde(with = "crate::bytes")]
        response: Vec<u8>,
    },
    CloseSession {
        promise_id: u32,
        #[serde(with = "crate::bytes")]
        session_id: Vec<u8>,
    },
    TimerExpired {
        context: u64,
    },
    /// Replies `Reply::Decrypted`.
    Decrypt {
        encrypted: InputBuffer,
    },
    /// Replies `Reply::Status`.
    InitializeVideoDecoder {
        config: VideoDecoderConfig,
    },
    DeinitializeDecoder {
        decoder_type: StreamType,
    },
    ResetDecoder {
        decoder_type: StreamType,
    },
    /// Replies `Reply::Frame`.
    DecryptAndDecodeFrame {
        encrypted: InputBuffer,
    },
    OnQueryOutputProtectionStatus {
        result: QueryResult,
        link_mask: u32,
        output_protection_mask: u32,
    },
    /// Releases the vendor instance; the capability is gone afterwards.
    Destroy,
}

impl InstanceRequest {
    /// ABI method name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "Initialize",
            Self::SetServerCertificate { .. } => "SetServerCertificate",
            Self::CreateSessionAndGenerateRequest { .. } => "CreateSessionAndGenerateRequest",
            Self::UpdateSession { .. } => "UpdateSession",
            Self::CloseSession { .. } => "CloseSession",
            Self::TimerExpired { .. } => "TimerExpired",
            Self::Decrypt { .. } => "Decrypt",
            Self::InitializeVideoDecoder { .. } => "InitializeVideoDecoder",
            Self::DeinitializeDecoder { .. } => "DeinitializeDecoder",
            Self::ResetDecoder { .. } => "ResetDecoder",
            Self::DecryptAndDecodeFrame { .. } => "DecryptAndDecodeFrame",
            Self::OnQueryOutputProtectionStatus { .. } => "OnQueryOutputProtectionStatus",
            Self::Destroy => "Destroy",
        }
    }
}

// ============================================================================
// Callback (host-served)
// ============================================================================

/// Host callbacks issued by the vendor during an in-flight Instance call.
/// Every one replies `Reply::Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CallbackRequest {
    SetTimer {
        delay_ms: i64,
        context: u64,
    },
    OnInitialized {
        success: bool,
    },
    OnResolveNewSessionPromise {
        promise_id: u32,
        #[serde(with = "crate::bytes")]
        session_id: Vec<u8>,
    },
    OnResolvePromise {
        promise_id: u32,
    },
    OnSessionMessage {
        #[serde(with = "crate::bytes")]
        session_id: Vec<u8>,
        message_type: MessageType,
        #[serde(with = "crate::bytes")]
        message: Vec<u8>,
    },
    OnSessionKeysChange {
        #[serde(with = "crate::bytes")]
        session_id: Vec<u8>,
        has_additional_usable_key: bool,
        keys: Vec<KeyInformation>,
    },
    OnExpirationChange {
        #[serde(with = "crate::bytes")]
        session_id: Vec<u8>,
        new_expiry_time: f64,
    },
    OnSessionClosed {
        #[serde(with = "crate::bytes")]
        session_id: Vec<u8>,
    },
    QueryOutputProtectionStatus,
}

impl CallbackRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetTimer { .. } => "SetTimer",
            Self::OnInitialized { .. } => "OnInitialized",
            Self::OnResolveNewSessionPromise { .. } => "OnResolveNewSessionPromise",
            Self::OnResolvePromise { .. } => "OnResolvePromise",
            Self::OnSessionMessage { .. } => "OnSessionMessage",
            Self::OnSessionKeysChange { .. } => "OnSessionKeysChange",
            Self::OnExpirationChange { .. } => "OnExpirationChange",
            Self::OnSessionClosed { .. } => "OnSessionClosed",
            Self::QueryOutputProtectionStatus => "QueryOutputProtectionStatus",
        }
    }
}

// ============================================================================
// Replies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Completion of a method with no result.
    Done,

    /// A freshly created instance. The arena memfd travels as the frame's
    /// single attached descriptor.
    Instance { instance: CapId, arena_size: u32 },

    Version { version: String },

    Status { status: Status },

    /// `block` is present exactly when `status` is `Status::SUCCESS`.
    Decrypted {
        status: Status,
        #[serde(default)]
        block: Option<DecryptedBlockInfo>,
    },

    /// `frame` is present exactly when `status` is `Status::SUCCESS`.
    Frame {
        status: Status,
        #[serde(default)]
        frame: Option<VideoFrameInfo>,
    },

    Error(RemoteError),
}

/// A call the peer could not serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No capability with that id is exported.
    UnknownCapability,
    /// The capability does not implement the called interface.
    WrongInterface,
    /// Unsupported CDM interface version.
    VersionMismatch,
    /// The worker already hosts its maximum number of instances.
    InstanceLimit,
    /// The vendor module failed to load or returned no instance.
    InstanceCreationFailed,
    /// Worker-side failure (arena setup, fiber spawn).
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let frame = Frame::Call {
            id: 7,
            target: CapId(3),
            call: Call::Instance(InstanceRequest::CloseSession {
                promise_id: 11,
                session_id: b"s1".to_vec(),
            }),
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"frame\":\"call\""));
        assert!(json.contains("\"interface\":\"instance\""));
        assert!(json.contains("\"method\":\"close_session\""));
        assert!(json.contains("\"session_id\":\"czE=\""));

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.attached_fds(), 0);
    }

    #[test]
    fn test_return_without_fds_field() {
        let json = r#"{"frame":"return","id":1,"reply":{"reply":"done"}}"#;
        let parsed: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.attached_fds(), 0);
        match parsed {
            Frame::Return { id, reply, .. } => {
                assert_eq!(id, 1);
                assert_eq!(reply, Reply::Done);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_instance_reply_declares_descriptor() {
        let frame = Frame::Return {
            id: 2,
            fds: 1,
            reply: Reply::Instance {
                instance: CapId(1),
                arena_size: 32 << 20,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"reply\":\"instance\""));
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.attached_fds(), 1);
    }

    #[test]
    fn test_error_reply_serialization() {
        let reply = Reply::Error(RemoteError::new(
            ErrorCode::VersionMismatch,
            "unsupported CDM interface version 9",
        ));
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"reply\":\"error\""));
        assert!(json.contains("version_mismatch"));

        let parsed: Reply = serde_json::from_str(&json).unwrap();
        match parsed {
            Reply::Error(e) => {
                assert_eq!(e.code, ErrorCode::VersionMismatch);
                assert!(e.to_string().contains("version 9"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_decrypted_reply_without_block() {
        let json = r#"{"reply":"decrypted","status":2}"#;
        let parsed: Reply = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            Reply::Decrypted {
                status: Status::NO_KEY,
                block: None,
            }
        );
    }

    #[test]
    fn test_callback_names() {
        let request = CallbackRequest::OnSessionKeysChange {
            session_id: Vec::new(),
            has_additional_usable_key: true,
            keys: Vec::new(),
        };
        assert_eq!(request.name(), "OnSessionKeysChange");
        assert_eq!(InstanceRequest::Destroy.name(), "Destroy");
    }
}
