//! Shared fixtures: a recording host and a scriptable stub vendor.

#![allow(dead_code)]

use std::cell::RefCell;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use fcdm::Config;
use fcdm::cdm::*;
use fcdm::shim::HostShim;
use fcdm::vendor::{VendorHandle, VendorModule};
use fcdm::worker;

pub const KEY_SYSTEM: &str = "org.example.stub";
pub const ARENA_SIZE: u32 = 1024 * 1024;
pub const FIBER_STACK: usize = 256 * 1024;

/// Monotonic counter shared by host and vendor to order observations.
#[derive(Clone, Default)]
pub struct Clock(Arc<AtomicUsize>);

impl Clock {
    pub fn tick(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

pub fn test_config() -> Config {
    Config {
        arena_size: ARENA_SIZE,
        fiber_stack_size: FIBER_STACK,
        ..Config::default()
    }
}

// ============================================================================
// Host
// ============================================================================

pub struct VecBuffer {
    bytes: Vec<u8>,
    size: u32,
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

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Timer { delay_ms: i64, context: u64 },
    Initialized(bool),
    NewSession { promise_id: u32, session_id: Vec<u8> },
    Resolved(u32),
    Message { session_id: Vec<u8>, message_type: MessageType, message: Vec<u8> },
    KeysChange { session_id: Vec<u8>, keys: Vec<KeyInformation> },
    Expiration { session_id: Vec<u8>, expiry: f64 },
    Closed(Vec<u8>),
    QueryOutputProtection,
}

/// Records every callback, stamped with the shared clock.
pub struct TestHost {
    pub clock: Clock,
    pub events: RefCell<Vec<(usize, Event)>>,
}

impl TestHost {
    pub fn new(clock: Clock) -> Rc<Self> {
        Rc::new(Self {
            clock,
            events: RefCell::new(Vec::new()),
        })
    }

    fn record(&self, event: Event) {
        let at = self.clock.tick();
        self.events.borrow_mut().push((at, event));
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn take_events(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).map(|(_, e)| e).collect()
    }
}

impl Host for TestHost {
    fn allocate(&self, capacity: u32) -> Box<dyn Buffer> {
        Box::new(VecBuffer {
            bytes: vec![0; capacity as usize],
            size: 0,
        })
    }

    fn set_timer(&self, delay_ms: i64, context: u64) {
        self.record(Event::Timer { delay_ms, context });
    }

    fn current_wall_time(&self) -> f64 {
        0.0
    }

    fn on_initialized(&self, success: bool) {
        self.record(Event::Initialized(success));
    }

    fn on_resolve_new_session_promise(&self, promise_id: u32, session_id: &[u8]) {
        self.record(Event::NewSession {
            promise_id,
            session_id: session_id.to_vec(),
        });
    }

    fn on_resolve_promise(&self, promise_id: u32) {
        self.record(Event::Resolved(promise_id));
    }

    fn on_session_message(&self, session_id: &[u8], message_type: MessageType, message: &[u8]) {
        self.record(Event::Message {
            session_id: session_id.to_vec(),
            message_type,
            message: message.to_vec(),
        });
    }

    fn on_session_keys_change(&self, session_id: &[u8], _more: bool, keys: &[KeyInformation]) {
        self.record(Event::KeysChange {
            session_id: session_id.to_vec(),
            keys: keys.to_vec(),
        });
    }

    fn on_expiration_change(&self, session_id: &[u8], new_expiry_time: f64) {
        self.record(Event::Expiration {
            session_id: session_id.to_vec(),
            expiry: new_expiry_time,
        });
    }

    fn on_session_closed(&self, session_id: &[u8]) {
        self.record(Event::Closed(session_id.to_vec()));
    }

    fn query_output_protection_status(&self) {
        self.record(Event::QueryOutputProtection);
    }
}

// ============================================================================
// Vendor
// ============================================================================

/// Key id that makes the stub report `NO_KEY`.
pub const MISSING_KEY: &[u8] = b"missing";

/// Wall time the stub reports as session expiry.
pub const EXPIRY: f64 = 1_700_000_000.0;

pub struct StubVendor {
    pub clock: Clock,
    /// Clock readings taken by the vendor right after each in-Decrypt
    /// callback returned.
    pub resumed: Arc<Mutex<Vec<usize>>>,
    pub destroyed: Arc<AtomicUsize>,
}

impl StubVendor {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            resumed: Arc::default(),
            destroyed: Arc::default(),
        }
    }
}

impl VendorModule for StubVendor {
    fn initialize_module(&self) {}

    fn create_instance(
        &self,
        abi_version: i32,
        key_system: &str,
        host: Arc<dyn Host + Send + Sync>,
    ) -> Option<Box<dyn ContentDecryptionModule + Send + Sync>> {
        if abi_version != 10 || key_system.is_empty() {
            return None;
        }
        Some(Box::new(StubCdm {
            key_system: key_system.to_owned(),
            host,
            clock: self.clock.clone(),
            resumed: Arc::clone(&self.resumed),
            destroyed: Arc::clone(&self.destroyed),
            sessions: AtomicUsize::new(0),
        }))
    }

    fn version(&self) -> String {
        "stub-cdm 1.0".into()
    }
}

/// Decrypts by prefixing the key system to the payload, truncated or
/// zero-padded to 16 bytes.
pub struct StubCdm {
    key_system: String,
    host: Arc<dyn Host + Send + Sync>,
    clock: Clock,
    resumed: Arc<Mutex<Vec<usize>>>,
    destroyed: Arc<AtomicUsize>,
    sessions: AtomicUsize,
}

pub fn stub_plaintext(key_system: &str, data: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = key_system.bytes().chain(data.iter().copied()).take(16).collect();
    out.resize(16, 0);
    out
}

impl ContentDecryptionModule for StubCdm {
    fn initialize(&self, _: bool, _: bool, _: bool) {
        self.host.on_initialized(true);
    }

    fn set_server_certificate(&self, promise_id: u32, _certificate: &[u8]) {
        self.host.on_resolve_promise(promise_id);
    }

    fn create_session_and_generate_request(
        &self,
        promise_id: u32,
        _session_type: SessionType,
        _init_data_type: InitDataType,
        init_data: &[u8],
    ) {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("session-{n}");
        self.host
            .on_resolve_new_session_promise(promise_id, session_id.as_bytes());
        self.host
            .on_session_message(session_id.as_bytes(), MessageType::LICENSE_REQUEST, init_data);
    }

    fn update_session(&self, promise_id: u32, session_id: &[u8], response: &[u8]) {
        let key = KeyInformation {
            key_id: response.to_vec(),
            status: KeyStatus::USABLE,
            system_code: 0,
        };
        self.host.on_session_keys_change(session_id, true, &[key]);
        self.host.on_expiration_change(session_id, EXPIRY);
        self.host.on_resolve_promise(promise_id);
    }

    fn close_session(&self, promise_id: u32, session_id: &[u8]) {
        self.host.on_session_closed(session_id);
        self.host.on_resolve_promise(promise_id);
    }

    fn timer_expired(&self, context: u64) {
        self.host.set_timer(100, context + 1);
    }

    fn decrypt(&self, encrypted: &InputBuffer, decrypted: &mut DecryptedBlock) -> Status {
        if encrypted.key_id == MISSING_KEY {
            return Status::NO_KEY;
        }
        self.host
            .on_session_message(b"decrypt", MessageType::LICENSE_RENEWAL, &encrypted.data);
        self.resumed
            .lock()
            .unwrap()
            .push(self.clock.tick());

        let plaintext = stub_plaintext(&self.key_system, &encrypted.data);
        let mut buffer = self.host.allocate(plaintext.len() as u32);
        buffer.data_mut()[..plaintext.len()].copy_from_slice(&plaintext);
        buffer.set_size(plaintext.len() as u32);
        *decrypted = DecryptedBlock {
            buffer: Some(buffer),
            timestamp: encrypted.timestamp,
        };
        Status::SUCCESS
    }

    fn initialize_video_decoder(&self, config: &VideoDecoderConfig) -> Status {
        if config.codec == VideoCodec::VP9 {
            Status::SUCCESS
        } else {
            Status::INITIALIZATION_ERROR
        }
    }

    fn deinitialize_decoder(&self, _: StreamType) {}

    fn reset_decoder(&self, _: StreamType) {}

    /// Produces a 4x4 I420 frame whose bytes count up from the first payload
    /// byte.
    fn decrypt_and_decode_frame(&self, encrypted: &InputBuffer, frame: &mut VideoFrame) -> Status {
        let Some(&seed) = encrypted.data.first() else {
            return Status::NEED_MORE_DATA;
        };
        let len = 4 * 4 + 2 * (2 * 2);
        let mut buffer = self.host.allocate(len);
        for (i, byte) in buffer.data_mut()[..len as usize].iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        buffer.set_size(len);
        *frame = VideoFrame {
            format: VideoFormat::I420,
            size: Size {
                width: 4,
                height: 4,
            },
            frame_buffer: Some(buffer),
            planes: [
                PlaneInfo { offset: 0, stride: 4 },
                PlaneInfo { offset: 16, stride: 2 },
                PlaneInfo { offset: 20, stride: 2 },
            ],
            timestamp: encrypted.timestamp,
        };
        Status::SUCCESS
    }

    fn on_query_output_protection_status(&self, result: QueryResult, _: u32, _: u32) {
        if result == QueryResult::FAILED {
            self.host.query_output_protection_status();
        }
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Serves `vendor` on a background thread; returns the host end.
pub fn start_worker(vendor: Arc<dyn VendorModule>, config: Config) -> UnixStream {
    let (host_end, worker_end) = UnixStream::pair().unwrap();
    thread::Builder::new()
        .name("fcdm-worker".into())
        .spawn(move || worker::serve(worker_end, VendorHandle::preloaded(vendor), config).unwrap())
        .unwrap();
    host_end
}

/// A shim connected to an in-process worker running [`StubVendor`].
pub struct Harness {
    pub shim: HostShim,
    pub host: Rc<TestHost>,
    pub vendor: Arc<StubVendor>,
    pub clock: Clock,
}

pub fn connect(key_system: &str) -> Harness {
    let clock = Clock::default();
    let vendor = Arc::new(StubVendor::new(clock.clone()));
    let host = TestHost::new(clock.clone());
    let stream = start_worker(vendor.clone(), test_config());
    let shim = HostShim::connect(stream, None, ARENA_SIZE, 10, key_system, host.clone()).unwrap();
    Harness {
        shim,
        host,
        vendor,
        clock,
    }
}

pub fn encrypted(data: &[u8], timestamp: i64) -> InputBuffer {
    InputBuffer {
        data: data.to_vec(),
        encryption_scheme: EncryptionScheme::CENC,
        key_id: b"key-1".to_vec(),
        iv: vec![0; 16],
        subsamples: Vec::new(),
        pattern: Pattern::default(),
        timestamp,
    }
}
