//! C++ object bridge for the plugin ABI.
//!
//! Every ABI object is a pointer to a struct whose first word is a vtable
//! pointer. Vtable entries follow Itanium layout: virtual methods in
//! declaration order, then the complete and deleting destructor slots (all
//! ABI classes declare their destructor last). `this` is passed as the first
//! argument.
//!
//! Two directions per object:
//! - `Foreign*` wrappers call into an object owned by the other side of the C
//!   boundary (the real host, the vendor module, their buffers).
//! - `*Object` structs expose one of our Rust implementations under a vtable
//!   we own.

use std::ffi::{c_char, c_int, c_void};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use log::debug;

use super::{
    Buffer, ContentDecryptionModule, DecryptedBlock, Host, VideoFrame, CdmError,
};
use crate::error::fatal;
use fcdm_protocol::types::*;
use fcdm_protocol::HOST_INTERFACE_VERSION;

// ============================================================================
// Module entry points
// ============================================================================

pub type GetCdmHostFn =
    unsafe extern "C" fn(host_interface_version: c_int, user_data: *mut c_void) -> *mut c_void;
pub type InitializeCdmModuleFn = unsafe extern "C" fn();
pub type CreateCdmInstanceFn = unsafe extern "C" fn(
    cdm_interface_version: c_int,
    key_system: *const c_char,
    key_system_size: u32,
    get_cdm_host_func: GetCdmHostFn,
    user_data: *mut c_void,
) -> *mut c_void;
pub type GetCdmVersionFn = unsafe extern "C" fn() -> *const c_char;

pub const INITIALIZE_CDM_MODULE: &[u8] = b"InitializeCdmModule_4\0";
pub const CREATE_CDM_INSTANCE: &[u8] = b"CreateCdmInstance\0";
pub const GET_CDM_VERSION: &[u8] = b"GetCdmVersion\0";

/// Host lookup handed to the vendor's `CreateCdmInstance`; `user_data` is
/// the [`HostObject`] to return.
pub unsafe extern "C" fn get_cdm_host(
    host_interface_version: c_int,
    user_data: *mut c_void,
) -> *mut c_void {
    debug!("GetCdmHost({host_interface_version})");
    if host_interface_version != HOST_INTERFACE_VERSION {
        fatal(format!(
            "vendor requested host interface {host_interface_version}, only {HOST_INTERFACE_VERSION} is served"
        ));
    }
    user_data
}

// ============================================================================
// Helpers
// ============================================================================

unsafe fn bytes<'a, T>(data: *const T, len: u32) -> &'a [u8] {
    if data.is_null() || len == 0 {
        return &[];
    }
    unsafe { slice::from_raw_parts(data.cast::<u8>(), len as usize) }
}

pub(crate) fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or_else(|_| fatal(format!("{len} bytes do not fit the ABI")))
}

fn supported<T>(result: Result<T, CdmError>) -> T {
    result.unwrap_or_else(|e| fatal(e))
}

/// Defines an `extern "C"` vtable slot that forwards to the wrapped Rust
/// object. `bytes(ptr: *const T, len)` arrives as pointer plus `u32` length
/// and is passed on as `&[u8]`. A `fallible` slot is fatal when the method
/// is unimplemented.
macro_rules! thunk {
    (@munch $head:tt [$($decl:tt)*] [$($arg:tt)*] bytes($p:ident: $t:ty, $len:ident) $(, $($rest:tt)*)?) => {
        thunk!(@munch $head [$($decl)* $p: $t, $len: u32,] [$($arg)* unsafe { bytes($p, $len) },] $($($rest)*)?);
    };
    (@munch $head:tt [$($decl:tt)*] [$($arg:tt)*] $p:ident: $t:ty $(, $($rest:tt)*)?) => {
        thunk!(@munch $head [$($decl)* $p: $t,] [$($arg)* $p,] $($($rest)*)?);
    };
    (@munch [$wrap:ident $name:ident $this_ty:ident $get:ident $method:ident [$($ret:tt)*]] [$($decl:tt)*] [$($arg:tt)*]) => {
        unsafe extern "C" fn $name(this: *mut $this_ty, $($decl)*) $($ret)* {
            thunk!(@call $wrap unsafe { $get(this) }.$method($($arg)*))
        }
    };
    (@call plain $e:expr) => { $e };
    (@call fallible $e:expr) => { supported($e) };
    (fn $name:ident($this_ty:ident => $get:ident) $method:ident($($params:tt)*) $(-> $ret:ty)?) => {
        thunk!(@munch [plain $name $this_ty $get $method [$(-> $ret)?]] [] [] $($params)*);
    };
    (fallible fn $name:ident($this_ty:ident => $get:ident) $method:ident($($params:tt)*) $(-> $ret:ty)?) => {
        thunk!(@munch [fallible $name $this_ty $get $method [$(-> $ret)?]] [] [] $($params)*);
    };
}

/// Implements a trait method by calling the matching slot of a foreign
/// vtable. `&[u8]` parameters go out as pointer plus `u32` length.
macro_rules! forward_to_vtable {
    (@munch $head:tt [$($decl:tt)*] [$($arg:tt)*] $p:ident: &[u8] $(, $($rest:tt)*)?) => {
        forward_to_vtable!(@munch $head [$($decl)* $p: &[u8],] [$($arg)* $p.as_ptr().cast(), len_u32($p.len()),] $($($rest)*)?);
    };
    (@munch $head:tt [$($decl:tt)*] [$($arg:tt)*] $p:ident: $t:ty $(, $($rest:tt)*)?) => {
        forward_to_vtable!(@munch $head [$($decl)* $p: $t,] [$($arg)* $p,] $($($rest)*)?);
    };
    (@munch [$method:ident $slot:ident [$($ret:tt)*]] [$($decl:tt)*] [$($arg:tt)*]) => {
        fn $method(&self, $($decl)*) $($ret)* {
            unsafe { (self.vtable().$slot)(self.this(), $($arg)*) }
        }
    };
    (fn $method:ident($($params:tt)*) $(-> $ret:ty)? => $slot:ident) => {
        forward_to_vtable!(@munch [$method $slot [$(-> $ret)?]] [] [] $($params)*);
    };
}

/// Destructor slots of bridge objects. The ABI releases objects through
/// their `Destroy` method only.
unsafe extern "C" fn no_destructor<T>(_this: *mut T) {
    fatal("C++ destructor invoked on a bridge object");
}

// ============================================================================
// Value structs
// ============================================================================

/// `cdm::InputBuffer_2`.
#[repr(C)]
pub struct CppInputBuffer {
    pub data: *const u8,
    pub data_size: u32,
    pub encryption_scheme: EncryptionScheme,
    pub key_id: *const u8,
    pub key_id_size: u32,
    pub iv: *const u8,
    pub iv_size: u32,
    pub subsamples: *const SubsampleEntry,
    pub num_subsamples: u32,
    pub pattern: Pattern,
    pub timestamp: i64,
}

impl CppInputBuffer {
    /// Borrows `input`; the result is valid while `input` is.
    pub fn borrow(input: &InputBuffer) -> Self {
        Self {
            data: input.data.as_ptr(),
            data_size: len_u32(input.data.len()),
            encryption_scheme: input.encryption_scheme,
            key_id: input.key_id.as_ptr(),
            key_id_size: len_u32(input.key_id.len()),
            iv: input.iv.as_ptr(),
            iv_size: len_u32(input.iv.len()),
            subsamples: input.subsamples.as_ptr(),
            num_subsamples: len_u32(input.subsamples.len()),
            pattern: input.pattern,
            timestamp: input.timestamp,
        }
    }

    pub unsafe fn to_input(&self) -> InputBuffer {
        let subsamples = if self.subsamples.is_null() || self.num_subsamples == 0 {
            Vec::new()
        } else {
            unsafe { slice::from_raw_parts(self.subsamples, self.num_subsamples as usize) }
                .to_vec()
        };
        unsafe {
            InputBuffer {
                data: bytes(self.data, self.data_size).to_vec(),
                encryption_scheme: self.encryption_scheme,
                key_id: bytes(self.key_id, self.key_id_size).to_vec(),
                iv: bytes(self.iv, self.iv_size).to_vec(),
                subsamples,
                pattern: self.pattern,
                timestamp: self.timestamp,
            }
        }
    }
}

/// `cdm::VideoDecoderConfig_2`.
#[repr(C)]
pub struct CppVideoDecoderConfig {
    pub codec: VideoCodec,
    pub profile: VideoCodecProfile,
    pub format: VideoFormat,
    pub color_space: ColorSpace,
    pub coded_size: Size,
    pub extra_data: *mut u8,
    pub extra_data_size: u32,
    pub encryption_scheme: EncryptionScheme,
}

impl CppVideoDecoderConfig {
    /// Borrows `config`. The vendor only reads `extra_data`.
    pub fn borrow(config: &VideoDecoderConfig) -> Self {
        Self {
            codec: config.codec,
            profile: config.profile,
            format: config.format,
            color_space: config.color_space,
            coded_size: config.coded_size,
            extra_data: config.extra_data.as_ptr().cast_mut(),
            extra_data_size: len_u32(config.extra_data.len()),
            encryption_scheme: config.encryption_scheme,
        }
    }

    pub unsafe fn to_config(&self) -> VideoDecoderConfig {
        VideoDecoderConfig {
            codec: self.codec,
            profile: self.profile,
            format: self.format,
            color_space: self.color_space,
            coded_size: self.coded_size,
            extra_data: unsafe { bytes(self.extra_data, self.extra_data_size) }.to_vec(),
            encryption_scheme: self.encryption_scheme,
        }
    }
}

/// `cdm::KeyInformation`.
#[repr(C)]
pub struct CppKeyInformation {
    pub key_id: *const u8,
    pub key_id_size: u32,
    pub status: KeyStatus,
    pub system_code: u32,
}

// ============================================================================
// Buffer
// ============================================================================

#[repr(C)]
pub struct CppBuffer {
    vtable: *const BufferVtable,
}

#[repr(C)]
struct BufferVtable {
    destroy: unsafe extern "C" fn(*mut CppBuffer),
    capacity: unsafe extern "C" fn(*const CppBuffer) -> u32,
    data: unsafe extern "C" fn(*mut CppBuffer) -> *mut u8,
    set_size: unsafe extern "C" fn(*mut CppBuffer, u32),
    size: unsafe extern "C" fn(*const CppBuffer) -> u32,
    complete_destructor: unsafe extern "C" fn(*mut CppBuffer),
    deleting_destructor: unsafe extern "C" fn(*mut CppBuffer),
}

/// A `cdm::Buffer` owned by the real host or the vendor.
pub struct ForeignBuffer {
    raw: *mut CppBuffer,
}

// The ABI hands buffers between threads of the same call.
unsafe impl Send for ForeignBuffer {}

impl ForeignBuffer {
    /// Takes ownership: dropping the wrapper calls `Destroy`.
    pub unsafe fn from_raw(raw: NonNull<CppBuffer>) -> Self {
        Self { raw: raw.as_ptr() }
    }

    fn vtable(&self) -> &BufferVtable {
        unsafe { &*(*self.raw).vtable }
    }
}

impl Buffer for ForeignBuffer {
    fn capacity(&self) -> u32 {
        unsafe { (self.vtable().capacity)(self.raw) }
    }

    fn as_ptr(&self) -> *const u8 {
        unsafe { (self.vtable().data)(self.raw) }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { (self.vtable().data)(self.raw) }
    }

    fn size(&self) -> u32 {
        unsafe { (self.vtable().size)(self.raw) }
    }

    fn set_size(&mut self, size: u32) {
        unsafe { (self.vtable().set_size)(self.raw, size) }
    }

    fn take_foreign(&mut self) -> Option<NonNull<CppBuffer>> {
        NonNull::new(std::mem::replace(&mut self.raw, ptr::null_mut()))
    }
}

impl Drop for ForeignBuffer {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { (self.vtable().destroy)(self.raw) }
        }
    }
}

#[repr(C)]
struct BufferObject {
    base: CppBuffer,
    inner: Box<dyn Buffer>,
}

static BUFFER_VTABLE: BufferVtable = BufferVtable {
    destroy: buffer_destroy,
    capacity: buffer_capacity,
    data: buffer_data,
    set_size: buffer_set_size,
    size: buffer_size,
    complete_destructor: no_destructor::<CppBuffer>,
    deleting_destructor: no_destructor::<CppBuffer>,
};

/// Hands `buffer` across the C boundary. The receiver releases it with
/// `Destroy`. Buffers that already wrap a C++ object are unwrapped.
pub fn buffer_into_raw(mut buffer: Box<dyn Buffer>) -> *mut CppBuffer {
    if let Some(raw) = buffer.take_foreign() {
        return raw.as_ptr();
    }
    let object = Box::new(BufferObject {
        base: CppBuffer {
            vtable: &BUFFER_VTABLE,
        },
        inner: buffer,
    });
    Box::into_raw(object).cast()
}

/// Reclaims a buffer pointer coming back across the C boundary. Our own
/// objects are unboxed; anything else is wrapped.
pub unsafe fn buffer_from_raw(raw: NonNull<CppBuffer>) -> Box<dyn Buffer> {
    let vtable = unsafe { (*raw.as_ptr()).vtable };
    if ptr::eq(vtable, &BUFFER_VTABLE) {
        let object = unsafe { Box::from_raw(raw.as_ptr().cast::<BufferObject>()) };
        return object.inner;
    }
    Box::new(unsafe { ForeignBuffer::from_raw(raw) })
}

unsafe fn buffer_object<'a>(this: *const CppBuffer) -> &'a mut BufferObject {
    unsafe { &mut *(this.cast_mut().cast::<BufferObject>()) }
}

unsafe extern "C" fn buffer_destroy(this: *mut CppBuffer) {
    drop(unsafe { Box::from_raw(this.cast::<BufferObject>()) });
}

unsafe extern "C" fn buffer_capacity(this: *const CppBuffer) -> u32 {
    unsafe { buffer_object(this) }.inner.capacity()
}

unsafe extern "C" fn buffer_data(this: *mut CppBuffer) -> *mut u8 {
    unsafe { buffer_object(this) }.inner.as_mut_ptr()
}

unsafe extern "C" fn buffer_set_size(this: *mut CppBuffer, size: u32) {
    unsafe { buffer_object(this) }.inner.set_size(size);
}

unsafe extern "C" fn buffer_size(this: *const CppBuffer) -> u32 {
    unsafe { buffer_object(this) }.inner.size()
}

// ============================================================================
// DecryptedBlock
// ============================================================================

#[repr(C)]
pub struct CppDecryptedBlock {
    vtable: *const DecryptedBlockVtable,
}

#[repr(C)]
struct DecryptedBlockVtable {
    set_decrypted_buffer: unsafe extern "C" fn(*mut CppDecryptedBlock, *mut CppBuffer),
    decrypted_buffer: unsafe extern "C" fn(*mut CppDecryptedBlock) -> *mut CppBuffer,
    set_timestamp: unsafe extern "C" fn(*mut CppDecryptedBlock, i64),
    timestamp: unsafe extern "C" fn(*const CppDecryptedBlock) -> i64,
    complete_destructor: unsafe extern "C" fn(*mut CppDecryptedBlock),
    deleting_destructor: unsafe extern "C" fn(*mut CppDecryptedBlock),
}

/// Block object passed to the vendor's `Decrypt`, collected afterwards with
/// [`DecryptedBlockObject::into_block`].
#[repr(C)]
pub struct DecryptedBlockObject {
    base: CppDecryptedBlock,
    buffer: *mut CppBuffer,
    timestamp: i64,
}

static DECRYPTED_BLOCK_VTABLE: DecryptedBlockVtable = DecryptedBlockVtable {
    set_decrypted_buffer: block_set_decrypted_buffer,
    decrypted_buffer: block_decrypted_buffer,
    set_timestamp: block_set_timestamp,
    timestamp: block_timestamp,
    complete_destructor: no_destructor::<CppDecryptedBlock>,
    deleting_destructor: no_destructor::<CppDecryptedBlock>,
};

impl DecryptedBlockObject {
    pub fn new() -> Self {
        Self {
            base: CppDecryptedBlock {
                vtable: &DECRYPTED_BLOCK_VTABLE,
            },
            buffer: ptr::null_mut(),
            timestamp: 0,
        }
    }

    pub fn as_raw(&mut self) -> *mut CppDecryptedBlock {
        ptr::from_mut(self).cast()
    }

    pub fn into_block(self) -> DecryptedBlock {
        DecryptedBlock {
            buffer: NonNull::new(self.buffer).map(|raw| unsafe { buffer_from_raw(raw) }),
            timestamp: self.timestamp,
        }
    }
}

impl Default for DecryptedBlockObject {
    fn default() -> Self {
        Self::new()
    }
}

unsafe extern "C" fn block_set_decrypted_buffer(this: *mut CppDecryptedBlock, buffer: *mut CppBuffer) {
    unsafe { (*this.cast::<DecryptedBlockObject>()).buffer = buffer };
}

unsafe extern "C" fn block_decrypted_buffer(this: *mut CppDecryptedBlock) -> *mut CppBuffer {
    unsafe { (*this.cast::<DecryptedBlockObject>()).buffer }
}

unsafe extern "C" fn block_set_timestamp(this: *mut CppDecryptedBlock, timestamp: i64) {
    unsafe { (*this.cast::<DecryptedBlockObject>()).timestamp = timestamp };
}

unsafe extern "C" fn block_timestamp(this: *const CppDecryptedBlock) -> i64 {
    unsafe { (*this.cast::<DecryptedBlockObject>()).timestamp }
}

/// Stores `block` into a host-owned `cdm::DecryptedBlock`.
pub unsafe fn fill_foreign_block(raw: NonNull<CppDecryptedBlock>, block: DecryptedBlock) {
    let raw = raw.as_ptr();
    let vtable = unsafe { &*(*raw).vtable };
    if !unsafe { (vtable.decrypted_buffer)(raw) }.is_null() {
        fatal("host passed a DecryptedBlock that already holds a buffer");
    }
    if let Some(buffer) = block.buffer {
        unsafe { (vtable.set_decrypted_buffer)(raw, buffer_into_raw(buffer)) };
    }
    unsafe { (vtable.set_timestamp)(raw, block.timestamp) };
}

// ============================================================================
// VideoFrame
// ============================================================================

#[repr(C)]
pub struct CppVideoFrame {
    vtable: *const VideoFrameVtable,
}

#[repr(C)]
struct VideoFrameVtable {
    set_format: unsafe extern "C" fn(*mut CppVideoFrame, VideoFormat),
    format: unsafe extern "C" fn(*const CppVideoFrame) -> VideoFormat,
    set_size: unsafe extern "C" fn(*mut CppVideoFrame, Size),
    size: unsafe extern "C" fn(*const CppVideoFrame) -> Size,
    set_frame_buffer: unsafe extern "C" fn(*mut CppVideoFrame, *mut CppBuffer),
    frame_buffer: unsafe extern "C" fn(*mut CppVideoFrame) -> *mut CppBuffer,
    set_plane_offset: unsafe extern "C" fn(*mut CppVideoFrame, VideoPlane, u32),
    plane_offset: unsafe extern "C" fn(*mut CppVideoFrame, VideoPlane) -> u32,
    set_stride: unsafe extern "C" fn(*mut CppVideoFrame, VideoPlane, u32),
    stride: unsafe extern "C" fn(*mut CppVideoFrame, VideoPlane) -> u32,
    set_timestamp: unsafe extern "C" fn(*mut CppVideoFrame, i64),
    timestamp: unsafe extern "C" fn(*const CppVideoFrame) -> i64,
    complete_destructor: unsafe extern "C" fn(*mut CppVideoFrame),
    deleting_destructor: unsafe extern "C" fn(*mut CppVideoFrame),
}

/// Frame object passed to the vendor's `DecryptAndDecodeFrame`.
#[repr(C)]
pub struct VideoFrameObject {
    base: CppVideoFrame,
    format: VideoFormat,
    size: Size,
    frame_buffer: *mut CppBuffer,
    planes: [PlaneInfo; VideoPlane::COUNT],
    timestamp: i64,
}

static VIDEO_FRAME_VTABLE: VideoFrameVtable = VideoFrameVtable {
    set_format: frame_set_format,
    format: frame_format,
    set_size: frame_set_size,
    size: frame_size,
    set_frame_buffer: frame_set_frame_buffer,
    frame_buffer: frame_frame_buffer,
    set_plane_offset: frame_set_plane_offset,
    plane_offset: frame_plane_offset,
    set_stride: frame_set_stride,
    stride: frame_stride,
    set_timestamp: frame_set_timestamp,
    timestamp: frame_timestamp,
    complete_destructor: no_destructor::<CppVideoFrame>,
    deleting_destructor: no_destructor::<CppVideoFrame>,
};

impl VideoFrameObject {
    pub fn new() -> Self {
        Self {
            base: CppVideoFrame {
                vtable: &VIDEO_FRAME_VTABLE,
            },
            format: VideoFormat::UNKNOWN,
            size: Size::default(),
            frame_buffer: ptr::null_mut(),
            planes: Default::default(),
            timestamp: 0,
        }
    }

    pub fn as_raw(&mut self) -> *mut CppVideoFrame {
        ptr::from_mut(self).cast()
    }

    pub fn into_frame(self) -> VideoFrame {
        VideoFrame {
            format: self.format,
            size: self.size,
            frame_buffer: NonNull::new(self.frame_buffer).map(|raw| unsafe { buffer_from_raw(raw) }),
            planes: self.planes,
            timestamp: self.timestamp,
        }
    }
}

impl Default for VideoFrameObject {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn frame_object<'a>(this: *const CppVideoFrame) -> &'a mut VideoFrameObject {
    unsafe { &mut *(this.cast_mut().cast::<VideoFrameObject>()) }
}

fn plane_index(plane: VideoPlane) -> usize {
    plane
        .index()
        .unwrap_or_else(|| fatal(format!("invalid video plane {}", plane.0)))
}

unsafe extern "C" fn frame_set_format(this: *mut CppVideoFrame, format: VideoFormat) {
    unsafe { frame_object(this) }.format = format;
}

unsafe extern "C" fn frame_format(this: *const CppVideoFrame) -> VideoFormat {
    unsafe { frame_object(this) }.format
}

unsafe extern "C" fn frame_set_size(this: *mut CppVideoFrame, size: Size) {
    unsafe { frame_object(this) }.size = size;
}

unsafe extern "C" fn frame_size(this: *const CppVideoFrame) -> Size {
    unsafe { frame_object(this) }.size
}

unsafe extern "C" fn frame_set_frame_buffer(this: *mut CppVideoFrame, buffer: *mut CppBuffer) {
    unsafe { frame_object(this) }.frame_buffer = buffer;
}

unsafe extern "C" fn frame_frame_buffer(this: *mut CppVideoFrame) -> *mut CppBuffer {
    unsafe { frame_object(this) }.frame_buffer
}

unsafe extern "C" fn frame_set_plane_offset(this: *mut CppVideoFrame, plane: VideoPlane, offset: u32) {
    unsafe { frame_object(this) }.planes[plane_index(plane)].offset = offset;
}

unsafe extern "C" fn frame_plane_offset(this: *mut CppVideoFrame, plane: VideoPlane) -> u32 {
    unsafe { frame_object(this) }.planes[plane_index(plane)].offset
}

unsafe extern "C" fn frame_set_stride(this: *mut CppVideoFrame, plane: VideoPlane, stride: u32) {
    unsafe { frame_object(this) }.planes[plane_index(plane)].stride = stride;
}

unsafe extern "C" fn frame_stride(this: *mut CppVideoFrame, plane: VideoPlane) -> u32 {
    unsafe { frame_object(this) }.planes[plane_index(plane)].stride
}

unsafe extern "C" fn frame_set_timestamp(this: *mut CppVideoFrame, timestamp: i64) {
    unsafe { frame_object(this) }.timestamp = timestamp;
}

unsafe extern "C" fn frame_timestamp(this: *const CppVideoFrame) -> i64 {
    unsafe { frame_object(this) }.timestamp
}

/// Stores `frame` into a host-owned `cdm::VideoFrame`.
pub unsafe fn fill_foreign_frame(raw: NonNull<CppVideoFrame>, frame: VideoFrame) {
    let raw = raw.as_ptr();
    let vtable = unsafe { &*(*raw).vtable };
    if !unsafe { (vtable.frame_buffer)(raw) }.is_null() {
        fatal("host passed a VideoFrame that already holds a buffer");
    }
    unsafe {
        (vtable.set_format)(raw, frame.format);
        (vtable.set_size)(raw, frame.size);
        if let Some(buffer) = frame.frame_buffer {
            (vtable.set_frame_buffer)(raw, buffer_into_raw(buffer));
        }
        for (index, plane) in frame.planes.iter().enumerate() {
            let id = VideoPlane(index as u32);
            (vtable.set_plane_offset)(raw, id, plane.offset);
            (vtable.set_stride)(raw, id, plane.stride);
        }
        (vtable.set_timestamp)(raw, frame.timestamp);
    }
}

// ============================================================================
// Host_10
// ============================================================================

#[repr(C)]
pub struct CppHost {
    vtable: *const HostVtable,
}

#[repr(C)]
struct HostVtable {
    allocate: unsafe extern "C" fn(*mut CppHost, u32) -> *mut CppBuffer,
    set_timer: unsafe extern "C" fn(*mut CppHost, i64, *mut c_void),
    get_current_wall_time: unsafe extern "C" fn(*mut CppHost) -> f64,
    on_initialized: unsafe extern "C" fn(*mut CppHost, bool),
    on_resolve_key_status_promise: unsafe extern "C" fn(*mut CppHost, u32, KeyStatus),
    on_resolve_new_session_promise: unsafe extern "C" fn(*mut CppHost, u32, *const c_char, u32),
    on_resolve_promise: unsafe extern "C" fn(*mut CppHost, u32),
    on_reject_promise: unsafe extern "C" fn(*mut CppHost, u32, u32, u32, *const c_char, u32),
    on_session_message:
        unsafe extern "C" fn(*mut CppHost, *const c_char, u32, MessageType, *const c_char, u32),
    on_session_keys_change: unsafe extern "C" fn(
        *mut CppHost,
        *const c_char,
        u32,
        bool,
        *const CppKeyInformation,
        u32,
    ),
    on_expiration_change: unsafe extern "C" fn(*mut CppHost, *const c_char, u32, f64),
    on_session_closed: unsafe extern "C" fn(*mut CppHost, *const c_char, u32),
    send_platform_challenge:
        unsafe extern "C" fn(*mut CppHost, *const c_char, u32, *const c_char, u32),
    enable_output_protection: unsafe extern "C" fn(*mut CppHost, u32),
    query_output_protection_status: unsafe extern "C" fn(*mut CppHost),
    on_deferred_initialization_done: unsafe extern "C" fn(*mut CppHost, StreamType, Status),
    create_file_io: unsafe extern "C" fn(*mut CppHost, *mut c_void) -> *mut c_void,
    request_storage_id: unsafe extern "C" fn(*mut CppHost, u32),
    complete_destructor: unsafe extern "C" fn(*mut CppHost),
    deleting_destructor: unsafe extern "C" fn(*mut CppHost),
}

/// The real host's `cdm::Host_10`, as seen from the plugin.
pub struct ForeignHost {
    raw: NonNull<CppHost>,
}

impl ForeignHost {
    /// The host object must outlive the wrapper; the host owns it.
    pub unsafe fn from_raw(raw: NonNull<CppHost>) -> Self {
        Self { raw }
    }

    fn this(&self) -> *mut CppHost {
        self.raw.as_ptr()
    }

    fn vtable(&self) -> &HostVtable {
        unsafe { &*(*self.this()).vtable }
    }
}

impl Host for ForeignHost {
    fn allocate(&self, capacity: u32) -> Box<dyn Buffer> {
        let raw = unsafe { (self.vtable().allocate)(self.this(), capacity) };
        match NonNull::new(raw) {
            Some(raw) => Box::new(unsafe { ForeignBuffer::from_raw(raw) }),
            None => fatal(format!("host failed to allocate {capacity} bytes")),
        }
    }

    fn set_timer(&self, delay_ms: i64, context: u64) {
        let context = context as usize as *mut c_void;
        unsafe { (self.vtable().set_timer)(self.this(), delay_ms, context) }
    }

    forward_to_vtable!(fn current_wall_time() -> f64 => get_current_wall_time);

    forward_to_vtable!(fn on_initialized(success: bool) => on_initialized);

    forward_to_vtable!(fn on_resolve_new_session_promise(promise_id: u32, session_id: &[u8])
        => on_resolve_new_session_promise);

    forward_to_vtable!(fn on_resolve_promise(promise_id: u32) => on_resolve_promise);

    forward_to_vtable!(fn on_session_message(session_id: &[u8], message_type: MessageType, message: &[u8])
        => on_session_message);

    fn on_session_keys_change(
        &self,
        session_id: &[u8],
        has_additional_usable_key: bool,
        keys: &[KeyInformation],
    ) {
        let raw_keys: Vec<CppKeyInformation> = keys
            .iter()
            .map(|key| CppKeyInformation {
                key_id: key.key_id.as_ptr(),
                key_id_size: len_u32(key.key_id.len()),
                status: key.status,
                system_code: key.system_code,
            })
            .collect();
        unsafe {
            (self.vtable().on_session_keys_change)(
                self.this(),
                session_id.as_ptr().cast(),
                len_u32(session_id.len()),
                has_additional_usable_key,
                raw_keys.as_ptr(),
                len_u32(raw_keys.len()),
            )
        }
    }

    forward_to_vtable!(fn on_expiration_change(session_id: &[u8], new_expiry_time: f64)
        => on_expiration_change);

    forward_to_vtable!(fn on_session_closed(session_id: &[u8]) => on_session_closed);

    forward_to_vtable!(fn query_output_protection_status() => query_output_protection_status);
}

/// Exposes a Rust [`Host`] to the vendor module.
#[repr(C)]
pub struct HostObject {
    base: CppHost,
    host: Arc<dyn Host + Send + Sync>,
}

static HOST_VTABLE: HostVtable = HostVtable {
    allocate: host_allocate,
    set_timer: host_set_timer,
    get_current_wall_time: host_get_current_wall_time,
    on_initialized: host_on_initialized,
    on_resolve_key_status_promise: host_on_resolve_key_status_promise,
    on_resolve_new_session_promise: host_on_resolve_new_session_promise,
    on_resolve_promise: host_on_resolve_promise,
    on_reject_promise: host_on_reject_promise,
    on_session_message: host_on_session_message,
    on_session_keys_change: host_on_session_keys_change,
    on_expiration_change: host_on_expiration_change,
    on_session_closed: host_on_session_closed,
    send_platform_challenge: host_send_platform_challenge,
    enable_output_protection: host_enable_output_protection,
    query_output_protection_status: host_query_output_protection_status,
    on_deferred_initialization_done: host_on_deferred_initialization_done,
    create_file_io: host_create_file_io,
    request_storage_id: host_request_storage_id,
    complete_destructor: no_destructor::<CppHost>,
    deleting_destructor: no_destructor::<CppHost>,
};

impl HostObject {
    pub fn into_raw(host: Arc<dyn Host + Send + Sync>) -> NonNull<CppHost> {
        let object = Box::new(HostObject {
            base: CppHost {
                vtable: &HOST_VTABLE,
            },
            host,
        });
        NonNull::from(Box::leak(object)).cast()
    }

    /// Releases an object created by [`HostObject::into_raw`].
    pub unsafe fn free(raw: NonNull<CppHost>) {
        drop(unsafe { Box::from_raw(raw.as_ptr().cast::<HostObject>()) });
    }
}

unsafe fn host<'a>(this: *mut CppHost) -> &'a (dyn Host + Send + Sync) {
    unsafe { &*(*this.cast::<HostObject>()).host }
}

unsafe extern "C" fn host_allocate(this: *mut CppHost, capacity: u32) -> *mut CppBuffer {
    buffer_into_raw(unsafe { host(this) }.allocate(capacity))
}

unsafe extern "C" fn host_set_timer(this: *mut CppHost, delay_ms: i64, context: *mut c_void) {
    unsafe { host(this) }.set_timer(delay_ms, context as usize as u64);
}

thunk!(fn host_get_current_wall_time(CppHost => host) current_wall_time() -> f64);

thunk!(fn host_on_initialized(CppHost => host) on_initialized(success: bool));

thunk!(fallible fn host_on_resolve_key_status_promise(CppHost => host)
    on_resolve_key_status_promise(promise_id: u32, key_status: KeyStatus));

thunk!(fn host_on_resolve_new_session_promise(CppHost => host)
    on_resolve_new_session_promise(promise_id: u32, bytes(session_id: *const c_char, session_id_size)));

thunk!(fn host_on_resolve_promise(CppHost => host) on_resolve_promise(promise_id: u32));

thunk!(fallible fn host_on_reject_promise(CppHost => host) on_reject_promise(
    promise_id: u32,
    exception: u32,
    system_code: u32,
    bytes(error_message: *const c_char, error_message_size),
));

thunk!(fn host_on_session_message(CppHost => host) on_session_message(
    bytes(session_id: *const c_char, session_id_size),
    message_type: MessageType,
    bytes(message: *const c_char, message_size),
));

unsafe extern "C" fn host_on_session_keys_change(
    this: *mut CppHost,
    session_id: *const c_char,
    session_id_size: u32,
    has_additional_usable_key: bool,
    keys_info: *const CppKeyInformation,
    keys_info_count: u32,
) {
    let raw_keys = if keys_info.is_null() || keys_info_count == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(keys_info, keys_info_count as usize) }
    };
    let keys: Vec<KeyInformation> = raw_keys
        .iter()
        .map(|key| KeyInformation {
            key_id: unsafe { bytes(key.key_id, key.key_id_size) }.to_vec(),
            status: key.status,
            system_code: key.system_code,
        })
        .collect();
    unsafe {
        host(this).on_session_keys_change(
            bytes(session_id, session_id_size),
            has_additional_usable_key,
            &keys,
        )
    };
}

thunk!(fn host_on_expiration_change(CppHost => host)
    on_expiration_change(bytes(session_id: *const c_char, session_id_size), new_expiry_time: f64));

thunk!(fn host_on_session_closed(CppHost => host)
    on_session_closed(bytes(session_id: *const c_char, session_id_size)));

thunk!(fallible fn host_send_platform_challenge(CppHost => host) send_platform_challenge(
    bytes(service_id: *const c_char, service_id_size),
    bytes(challenge: *const c_char, challenge_size),
));

thunk!(fallible fn host_enable_output_protection(CppHost => host)
    enable_output_protection(desired_protection_mask: u32));

thunk!(fn host_query_output_protection_status(CppHost => host)
    query_output_protection_status());

thunk!(fallible fn host_on_deferred_initialization_done(CppHost => host)
    on_deferred_initialization_done(stream_type: StreamType, decoder_status: Status));

unsafe extern "C" fn host_create_file_io(this: *mut CppHost, _client: *mut c_void) -> *mut c_void {
    supported(unsafe { host(this) }.create_file_io());
    ptr::null_mut()
}

thunk!(fallible fn host_request_storage_id(CppHost => host) request_storage_id(version: u32));

// ============================================================================
// ContentDecryptionModule_10
// ============================================================================

#[repr(C)]
pub struct CppCdm {
    vtable: *const CdmVtable,
}

#[repr(C)]
struct CdmVtable {
    initialize: unsafe extern "C" fn(*mut CppCdm, bool, bool, bool),
    get_status_for_policy: unsafe extern "C" fn(*mut CppCdm, u32, *const u32),
    set_server_certificate: unsafe extern "C" fn(*mut CppCdm, u32, *const u8, u32),
    create_session_and_generate_request:
        unsafe extern "C" fn(*mut CppCdm, u32, SessionType, InitDataType, *const u8, u32),
    load_session: unsafe extern "C" fn(*mut CppCdm, u32, SessionType, *const c_char, u32),
    update_session: unsafe extern "C" fn(*mut CppCdm, u32, *const c_char, u32, *const u8, u32),
    close_session: unsafe extern "C" fn(*mut CppCdm, u32, *const c_char, u32),
    remove_session: unsafe extern "C" fn(*mut CppCdm, u32, *const c_char, u32),
    timer_expired: unsafe extern "C" fn(*mut CppCdm, *mut c_void),
    decrypt: unsafe extern "C" fn(*mut CppCdm, *const CppInputBuffer, *mut CppDecryptedBlock) -> Status,
    initialize_audio_decoder: unsafe extern "C" fn(*mut CppCdm, *const c_void) -> Status,
    initialize_video_decoder: unsafe extern "C" fn(*mut CppCdm, *const CppVideoDecoderConfig) -> Status,
    deinitialize_decoder: unsafe extern "C" fn(*mut CppCdm, StreamType),
    reset_decoder: unsafe extern "C" fn(*mut CppCdm, StreamType),
    decrypt_and_decode_frame:
        unsafe extern "C" fn(*mut CppCdm, *const CppInputBuffer, *mut CppVideoFrame) -> Status,
    decrypt_and_decode_samples:
        unsafe extern "C" fn(*mut CppCdm, *const CppInputBuffer, *mut c_void) -> Status,
    on_platform_challenge_response: unsafe extern "C" fn(*mut CppCdm, *const c_void),
    on_query_output_protection_status: unsafe extern "C" fn(*mut CppCdm, QueryResult, u32, u32),
    on_storage_id: unsafe extern "C" fn(*mut CppCdm, u32, *const u8, u32),
    destroy: unsafe extern "C" fn(*mut CppCdm),
    complete_destructor: unsafe extern "C" fn(*mut CppCdm),
    deleting_destructor: unsafe extern "C" fn(*mut CppCdm),
}

/// A vendor `cdm::ContentDecryptionModule_10`, plus the host object it was
/// created with.
pub struct ForeignCdm {
    raw: NonNull<CppCdm>,
    host: NonNull<CppHost>,
}

// The vendor instance is driven from fiber threads, one at a time.
unsafe impl Send for ForeignCdm {}
unsafe impl Sync for ForeignCdm {}

impl ForeignCdm {
    /// `host` is released after the vendor's `Destroy`.
    pub unsafe fn from_raw(raw: NonNull<CppCdm>, host: NonNull<CppHost>) -> Self {
        Self { raw, host }
    }

    fn this(&self) -> *mut CppCdm {
        self.raw.as_ptr()
    }

    fn vtable(&self) -> &CdmVtable {
        unsafe { &*(*self.this()).vtable }
    }
}

impl ContentDecryptionModule for ForeignCdm {
    forward_to_vtable!(fn initialize(
        allow_distinctive_identifier: bool,
        allow_persistent_state: bool,
        use_hw_secure_codecs: bool
    ) => initialize);

    forward_to_vtable!(fn set_server_certificate(promise_id: u32, certificate: &[u8]) => set_server_certificate);

    forward_to_vtable!(fn create_session_and_generate_request(
        promise_id: u32,
        session_type: SessionType,
        init_data_type: InitDataType,
        init_data: &[u8]
    ) => create_session_and_generate_request);

    forward_to_vtable!(fn update_session(promise_id: u32, session_id: &[u8], response: &[u8]) => update_session);

    forward_to_vtable!(fn close_session(promise_id: u32, session_id: &[u8]) => close_session);

    fn timer_expired(&self, context: u64) {
        unsafe { (self.vtable().timer_expired)(self.this(), context as usize as *mut c_void) }
    }

    fn decrypt(&self, encrypted: &InputBuffer, decrypted: &mut DecryptedBlock) -> Status {
        let input = CppInputBuffer::borrow(encrypted);
        let mut block = DecryptedBlockObject::new();
        let status = unsafe { (self.vtable().decrypt)(self.this(), &input, block.as_raw()) };
        *decrypted = block.into_block();
        status
    }

    fn initialize_video_decoder(&self, config: &VideoDecoderConfig) -> Status {
        let config = CppVideoDecoderConfig::borrow(config);
        unsafe { (self.vtable().initialize_video_decoder)(self.this(), &config) }
    }

    forward_to_vtable!(fn deinitialize_decoder(decoder_type: StreamType) => deinitialize_decoder);

    forward_to_vtable!(fn reset_decoder(decoder_type: StreamType) => reset_decoder);

    fn decrypt_and_decode_frame(&self, encrypted: &InputBuffer, frame: &mut VideoFrame) -> Status {
        let input = CppInputBuffer::borrow(encrypted);
        let mut object = VideoFrameObject::new();
        let status =
            unsafe { (self.vtable().decrypt_and_decode_frame)(self.this(), &input, object.as_raw()) };
        *frame = object.into_frame();
        status
    }

    forward_to_vtable!(fn on_query_output_protection_status(
        result: QueryResult,
        link_mask: u32,
        output_protection_mask: u32
    ) => on_query_output_protection_status);

    fn destroy(&self) {
        unsafe {
            (self.vtable().destroy)(self.this());
            HostObject::free(self.host);
        }
    }
}

/// Exposes a Rust [`ContentDecryptionModule`] to the real host.
#[repr(C)]
pub struct CdmObject {
    base: CppCdm,
    cdm: Box<dyn ContentDecryptionModule>,
}

static CDM_VTABLE: CdmVtable = CdmVtable {
    initialize: cdm_initialize,
    get_status_for_policy: cdm_get_status_for_policy,
    set_server_certificate: cdm_set_server_certificate,
    create_session_and_generate_request: cdm_create_session_and_generate_request,
    load_session: cdm_load_session,
    update_session: cdm_update_session,
    close_session: cdm_close_session,
    remove_session: cdm_remove_session,
    timer_expired: cdm_timer_expired,
    decrypt: cdm_decrypt,
    initialize_audio_decoder: cdm_initialize_audio_decoder,
    initialize_video_decoder: cdm_initialize_video_decoder,
    deinitialize_decoder: cdm_deinitialize_decoder,
    reset_decoder: cdm_reset_decoder,
    decrypt_and_decode_frame: cdm_decrypt_and_decode_frame,
    decrypt_and_decode_samples: cdm_decrypt_and_decode_samples,
    on_platform_challenge_response: cdm_on_platform_challenge_response,
    on_query_output_protection_status: cdm_on_query_output_protection_status,
    on_storage_id: cdm_on_storage_id,
    destroy: cdm_destroy,
    complete_destructor: no_destructor::<CppCdm>,
    deleting_destructor: no_destructor::<CppCdm>,
};

impl CdmObject {
    /// The host releases the object through `Destroy`.
    pub fn into_raw(cdm: Box<dyn ContentDecryptionModule>) -> NonNull<CppCdm> {
        let object = Box::new(CdmObject {
            base: CppCdm {
                vtable: &CDM_VTABLE,
            },
            cdm,
        });
        NonNull::from(Box::leak(object)).cast()
    }
}

unsafe fn cdm<'a>(this: *mut CppCdm) -> &'a dyn ContentDecryptionModule {
    unsafe { &*(*this.cast::<CdmObject>()).cdm }
}

thunk!(fn cdm_initialize(CppCdm => cdm) initialize(
    allow_distinctive_identifier: bool,
    allow_persistent_state: bool,
    use_hw_secure_codecs: bool,
));

unsafe extern "C" fn cdm_get_status_for_policy(this: *mut CppCdm, promise_id: u32, policy: *const u32) {
    let min_hdcp_version = if policy.is_null() { 0 } else { unsafe { *policy } };
    supported(unsafe { cdm(this) }.get_status_for_policy(promise_id, min_hdcp_version));
}

thunk!(fn cdm_set_server_certificate(CppCdm => cdm)
    set_server_certificate(promise_id: u32, bytes(data: *const u8, size)));

thunk!(fn cdm_create_session_and_generate_request(CppCdm => cdm) create_session_and_generate_request(
    promise_id: u32,
    session_type: SessionType,
    init_data_type: InitDataType,
    bytes(init_data: *const u8, init_data_size),
));

thunk!(fallible fn cdm_load_session(CppCdm => cdm) load_session(
    promise_id: u32,
    session_type: SessionType,
    bytes(session_id: *const c_char, session_id_size),
));

thunk!(fn cdm_update_session(CppCdm => cdm) update_session(
    promise_id: u32,
    bytes(session_id: *const c_char, session_id_size),
    bytes(response: *const u8, response_size),
));

thunk!(fn cdm_close_session(CppCdm => cdm)
    close_session(promise_id: u32, bytes(session_id: *const c_char, session_id_size)));

thunk!(fallible fn cdm_remove_session(CppCdm => cdm)
    remove_session(promise_id: u32, bytes(session_id: *const c_char, session_id_size)));

unsafe extern "C" fn cdm_timer_expired(this: *mut CppCdm, context: *mut c_void) {
    unsafe { cdm(this) }.timer_expired(context as usize as u64);
}

unsafe extern "C" fn cdm_decrypt(
    this: *mut CppCdm,
    encrypted: *const CppInputBuffer,
    decrypted: *mut CppDecryptedBlock,
) -> Status {
    let Some(out) = NonNull::new(decrypted) else {
        fatal("Decrypt called without an output block");
    };
    let input = unsafe { (*encrypted).to_input() };
    let mut block = DecryptedBlock::default();
    let status = unsafe { cdm(this) }.decrypt(&input, &mut block);
    unsafe { fill_foreign_block(out, block) };
    status
}

unsafe extern "C" fn cdm_initialize_audio_decoder(this: *mut CppCdm, _config: *const c_void) -> Status {
    supported(unsafe { cdm(this) }.initialize_audio_decoder())
}

unsafe extern "C" fn cdm_initialize_video_decoder(
    this: *mut CppCdm,
    config: *const CppVideoDecoderConfig,
) -> Status {
    let config = unsafe { (*config).to_config() };
    unsafe { cdm(this) }.initialize_video_decoder(&config)
}

thunk!(fn cdm_deinitialize_decoder(CppCdm => cdm) deinitialize_decoder(decoder_type: StreamType));

thunk!(fn cdm_reset_decoder(CppCdm => cdm) reset_decoder(decoder_type: StreamType));

unsafe extern "C" fn cdm_decrypt_and_decode_frame(
    this: *mut CppCdm,
    encrypted: *const CppInputBuffer,
    video_frame: *mut CppVideoFrame,
) -> Status {
    let Some(out) = NonNull::new(video_frame) else {
        fatal("DecryptAndDecodeFrame called without an output frame");
    };
    let input = unsafe { (*encrypted).to_input() };
    let mut frame = VideoFrame::default();
    let status = unsafe { cdm(this) }.decrypt_and_decode_frame(&input, &mut frame);
    unsafe { fill_foreign_frame(out, frame) };
    status
}

unsafe extern "C" fn cdm_decrypt_and_decode_samples(
    this: *mut CppCdm,
    encrypted: *const CppInputBuffer,
    _audio_frames: *mut c_void,
) -> Status {
    let input = unsafe { (*encrypted).to_input() };
    supported(unsafe { cdm(this) }.decrypt_and_decode_samples(&input))
}

unsafe extern "C" fn cdm_on_platform_challenge_response(this: *mut CppCdm, _response: *const c_void) {
    supported(unsafe { cdm(this) }.on_platform_challenge_response());
}

thunk!(fn cdm_on_query_output_protection_status(CppCdm => cdm) on_query_output_protection_status(
    result: QueryResult,
    link_mask: u32,
    output_protection_mask: u32,
));

thunk!(fallible fn cdm_on_storage_id(CppCdm => cdm)
    on_storage_id(version: u32, bytes(storage_id: *const u8, size)));

unsafe extern "C" fn cdm_destroy(this: *mut CppCdm) {
    let object = unsafe { Box::from_raw(this.cast::<CdmObject>()) };
    object.cdm.destroy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;
    use std::sync::Mutex;

    struct VecBuffer {
        bytes: Vec<u8>,
        size: u32,
    }

    impl VecBuffer {
        fn boxed(capacity: usize) -> Box<dyn Buffer> {
            Box::new(Self {
                bytes: vec![0; capacity],
                size: 0,
            })
        }
    }

    impl Buffer for VecBuffer {
        fn capacity(&self) -> u32 {
            self.bytes.len() as u32
        }
        fn as_ptr(&self) -> *const u8 {
            self.bytes.as_ptr()
        }
        fn as_mut_ptr(&mut self) -> *mut u8 {
            self.bytes.as_mut_ptr()
        }
        fn size(&self) -> u32 {
            self.size
        }
        fn set_size(&mut self, size: u32) {
            self.size = size;
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHost {
        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Host for RecordingHost {
        fn allocate(&self, capacity: u32) -> Box<dyn Buffer> {
            VecBuffer::boxed(capacity as usize)
        }
        fn set_timer(&self, delay_ms: i64, context: u64) {
            self.record(format!("timer {delay_ms} {context}"));
        }
        fn current_wall_time(&self) -> f64 {
            1.5
        }
        fn on_initialized(&self, success: bool) {
            self.record(format!("initialized {success}"));
        }
        fn on_resolve_new_session_promise(&self, promise_id: u32, session_id: &[u8]) {
            self.record(format!(
                "new session {promise_id} {}",
                String::from_utf8_lossy(session_id)
            ));
        }
        fn on_resolve_promise(&self, promise_id: u32) {
            self.record(format!("resolved {promise_id}"));
        }
        fn on_session_message(&self, session_id: &[u8], message_type: MessageType, message: &[u8]) {
            self.record(format!(
                "message {} {} {}",
                String::from_utf8_lossy(session_id),
                message_type.0,
                String::from_utf8_lossy(message)
            ));
        }
        fn on_session_keys_change(&self, _session_id: &[u8], _more: bool, keys: &[KeyInformation]) {
            let ids: Vec<_> = keys
                .iter()
                .map(|k| format!("{}:{}", String::from_utf8_lossy(&k.key_id), k.status.0))
                .collect();
            self.record(format!("keys {}", ids.join(",")));
        }
        fn on_expiration_change(&self, _session_id: &[u8], new_expiry_time: f64) {
            self.record(format!("expiry {new_expiry_time}"));
        }
        fn on_session_closed(&self, session_id: &[u8]) {
            self.record(format!("closed {}", String::from_utf8_lossy(session_id)));
        }
        fn query_output_protection_status(&self) {
            self.record("query".into());
        }
    }

    #[test]
    fn test_buffer_object_through_vtable() {
        let raw = NonNull::new(buffer_into_raw(VecBuffer::boxed(32))).unwrap();
        let mut foreign: Box<dyn Buffer> = Box::new(unsafe { ForeignBuffer::from_raw(raw) });
        assert_eq!(foreign.capacity(), 32);

        foreign.data_mut()[..4].copy_from_slice(b"pcm!");
        foreign.set_size(4);
        assert_eq!(foreign.size(), 4);
        assert_eq!(foreign.data(), b"pcm!");
        // Dropping calls Destroy through the vtable, which frees the object.
    }

    #[test]
    fn test_foreign_buffer_unwraps_on_the_way_back() {
        let raw = NonNull::new(buffer_into_raw(VecBuffer::boxed(8))).unwrap();
        let foreign: Box<dyn Buffer> = Box::new(unsafe { ForeignBuffer::from_raw(raw) });
        // Passing a wrapped pointer back out must yield the same object.
        assert_eq!(buffer_into_raw(foreign), raw.as_ptr());

        let mut back = unsafe { buffer_from_raw(raw) };
        assert!(back.take_foreign().is_none());
        assert_eq!(back.capacity(), 8);
    }

    #[test]
    fn test_host_object_through_vtable() {
        let recording = Arc::new(RecordingHost::default());
        let raw = HostObject::into_raw(recording.clone());
        let host = unsafe { ForeignHost::from_raw(raw) };

        host.on_initialized(true);
        host.set_timer(250, 0xfeed);
        host.on_resolve_new_session_promise(3, b"session-1");
        host.on_session_message(b"session-1", MessageType::LICENSE_RENEWAL, b"renew");
        host.on_session_keys_change(
            b"session-1",
            false,
            &[
                KeyInformation {
                    key_id: b"k1".to_vec(),
                    status: KeyStatus::USABLE,
                    system_code: 0,
                },
                KeyInformation {
                    key_id: b"k2".to_vec(),
                    status: KeyStatus::EXPIRED,
                    system_code: 7,
                },
            ],
        );
        host.on_session_closed(b"session-1");
        assert_eq!(host.current_wall_time(), 1.5);

        let mut buffer = host.allocate(16);
        assert_eq!(buffer.capacity(), 16);
        buffer.set_size(2);

        assert_eq!(
            *recording.events.lock().unwrap(),
            vec![
                "initialized true",
                "timer 250 65261",
                "new session 3 session-1",
                "message session-1 1 renew",
                "keys k1:0,k2:2",
                "closed session-1",
            ]
        );

        drop(buffer);
        unsafe { HostObject::free(raw) };
    }

    /// Implements only the required module methods.
    #[derive(Default)]
    struct RecordingCdm {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingCdm {
        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl ContentDecryptionModule for RecordingCdm {
        fn initialize(&self, distinctive: bool, persistent: bool, hw_secure: bool) {
            self.record(format!("initialize {distinctive} {persistent} {hw_secure}"));
        }
        fn set_server_certificate(&self, promise_id: u32, certificate: &[u8]) {
            self.record(format!("certificate {promise_id} {}", certificate.len()));
        }
        fn create_session_and_generate_request(
            &self,
            promise_id: u32,
            _session_type: SessionType,
            _init_data_type: InitDataType,
            init_data: &[u8],
        ) {
            self.record(format!("create {promise_id} {}", String::from_utf8_lossy(init_data)));
        }
        fn update_session(&self, promise_id: u32, session_id: &[u8], response: &[u8]) {
            self.record(format!(
                "update {promise_id} {} {}",
                String::from_utf8_lossy(session_id),
                String::from_utf8_lossy(response)
            ));
        }
        fn close_session(&self, promise_id: u32, session_id: &[u8]) {
            self.record(format!("close {promise_id} {}", String::from_utf8_lossy(session_id)));
        }
        fn timer_expired(&self, context: u64) {
            self.record(format!("timer {context}"));
        }
        fn decrypt(&self, _: &InputBuffer, _: &mut DecryptedBlock) -> Status {
            Status::DECRYPT_ERROR
        }
        fn initialize_video_decoder(&self, _: &VideoDecoderConfig) -> Status {
            Status::SUCCESS
        }
        fn deinitialize_decoder(&self, decoder_type: StreamType) {
            self.record(format!("deinitialize {}", decoder_type.0));
        }
        fn reset_decoder(&self, decoder_type: StreamType) {
            self.record(format!("reset {}", decoder_type.0));
        }
        fn decrypt_and_decode_frame(&self, _: &InputBuffer, _: &mut VideoFrame) -> Status {
            Status::DECODE_ERROR
        }
        fn on_query_output_protection_status(&self, _: QueryResult, link_mask: u32, _: u32) {
            self.record(format!("protection {link_mask}"));
        }
        fn destroy(&self) {
            self.record("destroy".into());
        }
    }

    #[test]
    fn test_cdm_object_through_vtable() {
        let cdm = RecordingCdm::default();
        let events = Arc::clone(&cdm.events);
        let raw = CdmObject::into_raw(Box::new(cdm));
        let host = HostObject::into_raw(Arc::new(RecordingHost::default()));
        let foreign = unsafe { ForeignCdm::from_raw(raw, host) };

        foreign.initialize(true, false, true);
        foreign.set_server_certificate(1, b"cert");
        foreign.create_session_and_generate_request(2, SessionType::TEMPORARY, InitDataType::CENC, b"pssh");
        foreign.update_session(3, b"s1", b"license");
        foreign.close_session(4, b"s1");
        foreign.timer_expired(99);
        foreign.reset_decoder(StreamType::VIDEO);
        foreign.on_query_output_protection_status(QueryResult::SUCCEEDED, 2, 0);
        foreign.destroy();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "initialize true false true",
                "certificate 1 4",
                "create 2 pssh",
                "update 3 s1 license",
                "close 4 s1",
                "timer 99",
                "reset 1",
                "protection 2",
                "destroy",
            ]
        );
    }

    /// Set in a child test process to the one test allowed to abort.
    const ABORTING_TEST_ENV: &str = "FCDM_ABORTING_TEST";

    /// Fatal errors inside a slot cannot unwind across `extern "C"`, so the
    /// test reruns itself in a child process and inspects how it died.
    fn assert_aborts(test: &str, expected: &str, call: impl FnOnce()) {
        if std::env::var(ABORTING_TEST_ENV).as_deref() == Ok(test) {
            call();
            return;
        }
        let module = module_path!()
            .split_once("::")
            .map_or(module_path!(), |(_, rest)| rest);
        let output = Command::new(std::env::current_exe().unwrap())
            .args(["--exact", &format!("{module}::{test}"), "--nocapture"])
            .env(ABORTING_TEST_ENV, test)
            .output()
            .unwrap();
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{stderr}");
        assert!(stderr.contains(expected), "{stderr}");
    }

    #[test]
    fn test_unsupported_cdm_slot_is_fatal() {
        assert_aborts("test_unsupported_cdm_slot_is_fatal", "LoadSession is not implemented", || {
            let raw = CdmObject::into_raw(Box::new(RecordingCdm::default())).as_ptr();
            let session = b"persisted";
            unsafe {
                ((*(*raw).vtable).load_session)(
                    raw,
                    1,
                    SessionType::PERSISTENT_LICENSE,
                    session.as_ptr().cast(),
                    session.len() as u32,
                )
            };
        });
    }

    #[test]
    fn test_unsupported_audio_decoder_is_fatal() {
        assert_aborts(
            "test_unsupported_audio_decoder_is_fatal",
            "InitializeAudioDecoder is not implemented",
            || {
                let raw = CdmObject::into_raw(Box::new(RecordingCdm::default())).as_ptr();
                unsafe { ((*(*raw).vtable).initialize_audio_decoder)(raw, ptr::null()) };
            },
        );
    }

    #[test]
    fn test_unsupported_host_slot_is_fatal() {
        assert_aborts("test_unsupported_host_slot_is_fatal", "CreateFileIO is not implemented", || {
            let raw = HostObject::into_raw(Arc::new(RecordingHost::default())).as_ptr();
            unsafe { ((*(*raw).vtable).create_file_io)(raw, ptr::null_mut()) };
        });
    }

    #[test]
    fn test_rejected_promise_without_support_is_fatal() {
        assert_aborts(
            "test_rejected_promise_without_support_is_fatal",
            "OnRejectPromise is not implemented",
            || {
                let raw = HostObject::into_raw(Arc::new(RecordingHost::default())).as_ptr();
                let message = b"denied";
                unsafe {
                    ((*(*raw).vtable).on_reject_promise)(
                        raw,
                        5,
                        0,
                        0,
                        message.as_ptr().cast(),
                        message.len() as u32,
                    )
                };
            },
        );
    }

    #[test]
    fn test_get_cdm_host_returns_user_data() {
        let mut marker = 0u8;
        let user_data = ptr::from_mut(&mut marker).cast::<c_void>();
        let got = unsafe { get_cdm_host(HOST_INTERFACE_VERSION, user_data) };
        assert_eq!(got, user_data);
    }

    #[test]
    fn test_get_cdm_host_rejects_other_versions() {
        assert_aborts("test_get_cdm_host_rejects_other_versions", "host interface 9", || {
            unsafe { get_cdm_host(9, ptr::null_mut()) };
        });
    }

    #[test]
    fn test_input_buffer_layout_round_trip() {
        let input = InputBuffer {
            data: b"ciphertext".to_vec(),
            encryption_scheme: EncryptionScheme::CBCS,
            key_id: b"kid".to_vec(),
            iv: vec![1; 16],
            subsamples: vec![SubsampleEntry {
                clear_bytes: 2,
                cipher_bytes: 8,
            }],
            pattern: Pattern {
                crypt_byte_block: 1,
                skip_byte_block: 9,
            },
            timestamp: 42,
        };
        let raw = CppInputBuffer::borrow(&input);
        assert_eq!(unsafe { raw.to_input() }, input);
    }

    #[test]
    fn test_abi_struct_layouts() {
        use std::mem::{align_of, offset_of, size_of};
        assert_eq!(offset_of!(CppInputBuffer, iv), 32);
        assert_eq!(offset_of!(CppInputBuffer, pattern), 60);
        assert_eq!(offset_of!(CppInputBuffer, timestamp), 72);
        assert_eq!(size_of::<CppInputBuffer>(), 80);
        assert_eq!(offset_of!(CppVideoDecoderConfig, coded_size), 16);
        assert_eq!(offset_of!(CppVideoDecoderConfig, extra_data), 24);
        assert_eq!(size_of::<CppKeyInformation>(), 24);
        assert_eq!(size_of::<Size>(), 8);
        assert_eq!(align_of::<ColorSpace>(), 1);
    }
}
