//! Rust model of the CDM plugin ABI (`ContentDecryptionModule_10`, `Host_10`).
//!
//! The same traits describe both directions of the bridge: the host shim is a
//! [`ContentDecryptionModule`] driving a remote worker, the worker's adapter
//! is a [`Host`] forwarding to a remote host. [`ffi`] maps them onto the C++
//! vtables of the real plugin interface.
//!
//! Module methods take `&self`: the vendor may call back into the host, and
//! the host may in principle call the module again, in the middle of a call.

pub mod ffi;

use std::ptr::NonNull;

pub use fcdm_protocol::types::*;

pub use crate::error::CdmError;

/// A byte buffer handed between host, bridge and vendor.
pub trait Buffer: Send {
    fn capacity(&self) -> u32;
    /// Start of the `capacity`-byte region.
    fn as_ptr(&self) -> *const u8;
    fn as_mut_ptr(&mut self) -> *mut u8;
    fn size(&self) -> u32;
    fn set_size(&mut self, size: u32);

    /// Gives up the underlying C++ object, if this buffer wraps one.
    /// Afterwards dropping `self` must not release it.
    fn take_foreign(&mut self) -> Option<NonNull<ffi::CppBuffer>> {
        None
    }
}

impl dyn Buffer + '_ {
    /// The `size()` bytes of valid data.
    pub fn data(&self) -> &[u8] {
        let len = self.size().min(self.capacity()) as usize;
        if len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.as_ptr(), len) }
    }

    /// The whole `capacity()` region, for filling.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.capacity() as usize;
        if len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }
}

/// Output of `Decrypt`.
#[derive(Default)]
pub struct DecryptedBlock {
    pub buffer: Option<Box<dyn Buffer>>,
    pub timestamp: i64,
}

/// Output of `DecryptAndDecodeFrame`.
#[derive(Default)]
pub struct VideoFrame {
    pub format: VideoFormat,
    pub size: Size,
    pub frame_buffer: Option<Box<dyn Buffer>>,
    pub planes: [PlaneInfo; VideoPlane::COUNT],
    pub timestamp: i64,
}

/// `cdm::Host_10`: services the module may call.
pub trait Host {
    fn allocate(&self, capacity: u32) -> Box<dyn Buffer>;
    fn set_timer(&self, delay_ms: i64, context: u64);
    /// Seconds since the epoch.
    fn current_wall_time(&self) -> f64;
    fn on_initialized(&self, success: bool);
    fn on_resolve_new_session_promise(&self, promise_id: u32, session_id: &[u8]);
    fn on_resolve_promise(&self, promise_id: u32);
    fn on_session_message(&self, session_id: &[u8], message_type: MessageType, message: &[u8]);
    fn on_session_keys_change(
        &self,
        session_id: &[u8],
        has_additional_usable_key: bool,
        keys: &[KeyInformation],
    );
    fn on_expiration_change(&self, session_id: &[u8], new_expiry_time: f64);
    fn on_session_closed(&self, session_id: &[u8]);
    fn query_output_protection_status(&self);

    fn on_resolve_key_status_promise(
        &self,
        _promise_id: u32,
        _key_status: KeyStatus,
    ) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("OnResolveKeyStatusPromise"))
    }

    fn on_reject_promise(
        &self,
        _promise_id: u32,
        _exception: u32,
        _system_code: u32,
        _message: &[u8],
    ) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("OnRejectPromise"))
    }

    fn send_platform_challenge(
        &self,
        _service_id: &[u8],
        _challenge: &[u8],
    ) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("SendPlatformChallenge"))
    }

    fn enable_output_protection(&self, _desired_protection_mask: u32) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("EnableOutputProtection"))
    }

    fn on_deferred_initialization_done(
        &self,
        _stream_type: StreamType,
        _decoder_status: Status,
    ) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("OnDeferredInitializationDone"))
    }

    fn create_file_io(&self) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("CreateFileIO"))
    }

    fn request_storage_id(&self, _version: u32) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("RequestStorageId"))
    }
}

/// `cdm::ContentDecryptionModule_10`.
pub trait ContentDecryptionModule {
    fn initialize(
        &self,
        allow_distinctive_identifier: bool,
        allow_persistent_state: bool,
        use_hw_secure_codecs: bool,
    );
    fn set_server_certificate(&self, promise_id: u32, certificate: &[u8]);
    fn create_session_and_generate_request(
        &self,
        promise_id: u32,
        session_type: SessionType,
        init_data_type: InitDataType,
        init_data: &[u8],
    );
    fn update_session(&self, promise_id: u32, session_id: &[u8], response: &[u8]);
    fn close_session(&self, promise_id: u32, session_id: &[u8]);
    fn timer_expired(&self, context: u64);
    fn decrypt(&self, encrypted: &InputBuffer, decrypted: &mut DecryptedBlock) -> Status;
    fn initialize_video_decoder(&self, config: &VideoDecoderConfig) -> Status;
    fn deinitialize_decoder(&self, decoder_type: StreamType);
    fn reset_decoder(&self, decoder_type: StreamType);
    fn decrypt_and_decode_frame(&self, encrypted: &InputBuffer, frame: &mut VideoFrame) -> Status;
    fn on_query_output_protection_status(
        &self,
        result: QueryResult,
        link_mask: u32,
        output_protection_mask: u32,
    );
    /// Releases the instance. No other method may be called afterwards.
    fn destroy(&self);

    fn get_status_for_policy(
        &self,
        _promise_id: u32,
        _min_hdcp_version: u32,
    ) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("GetStatusForPolicy"))
    }

    fn load_session(
        &self,
        _promise_id: u32,
        _session_type: SessionType,
        _session_id: &[u8],
    ) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("LoadSession"))
    }

    fn remove_session(&self, _promise_id: u32, _session_id: &[u8]) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("RemoveSession"))
    }

    fn initialize_audio_decoder(&self) -> Result<Status, CdmError> {
        Err(CdmError::Unimplemented("InitializeAudioDecoder"))
    }

    fn decrypt_and_decode_samples(&self, _encrypted: &InputBuffer) -> Result<Status, CdmError> {
        Err(CdmError::Unimplemented("DecryptAndDecodeSamples"))
    }

    fn on_platform_challenge_response(&self) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("OnPlatformChallengeResponse"))
    }

    fn on_storage_id(&self, _version: u32, _storage_id: &[u8]) -> Result<(), CdmError> {
        Err(CdmError::Unimplemented("OnStorageId"))
    }
}
