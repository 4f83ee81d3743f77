//! Worker side: serves the Factory and Instance interfaces on top of the
//! vendor module.
//!
//! The RPC session and the export table live on the event-loop thread.
//! Every vendor call runs on its own fiber; the event loop only dispatches
//! and delivers replies.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

use fcdm_protocol::{
    CDM_INTERFACE_VERSION, Call, CallbackRequest, CapId, ErrorCode, FactoryRequest,
    InstanceRequest, Reply,
};
use log::{debug, info, warn};
use tokio::net::UnixStream;
use tokio::runtime::Handle;

use crate::arena::{Arena, ArenaBuffer};
use crate::cdm::{
    Buffer, ContentDecryptionModule, DecryptedBlock, DecryptedBlockInfo, Host, KeyInformation,
    MessageType, Status, VideoFrame, VideoFrameInfo,
};
use crate::config::Config;
use crate::error::fatal;
use crate::fiber::{FiberScheduler, Suspender};
use crate::rpc::{Dispatch, EventLoop, Responder, Returned, RpcSession};
use crate::vendor::VendorHandle;

/// Serves one host connection until it closes.
pub fn serve(socket: StdUnixStream, vendor: VendorHandle, config: Config) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    let events = EventLoop::new()?;
    events.block_on(async move {
        let stream = UnixStream::from_std(socket)?;
        let scheduler = FiberScheduler::new(Handle::current(), config.fiber_stack_size);
        let worker = Rc::new(Worker::new(vendor, config, scheduler));
        let session = RpcSession::spawn(stream, worker);
        session.closed().await;
        info!("host connection closed");
        Ok(())
    })
}

// ============================================================================
// Export table
// ============================================================================

struct Worker {
    vendor: Arc<VendorHandle>,
    config: Config,
    scheduler: FiberScheduler,
    instances: Rc<RefCell<HashMap<CapId, Arc<Instance>>>>,
    sessions: Rc<Cell<usize>>,
    next_cap: Cell<u32>,
}

impl Worker {
    fn new(vendor: VendorHandle, config: Config, scheduler: FiberScheduler) -> Self {
        Self {
            vendor: Arc::new(vendor),
            config,
            scheduler,
            instances: Rc::default(),
            sessions: Rc::default(),
            next_cap: Cell::new(1),
        }
    }

    fn serve_factory(&self, session: &RpcSession, request: FactoryRequest, responder: Responder) {
        match request {
            FactoryRequest::GetVersion => match self.vendor.get() {
                Ok(module) => responder.reply(Reply::Version {
                    version: module.version(),
                }),
                Err(e) => {
                    warn!("GetVersion: {e}");
                    responder.fail(ErrorCode::InstanceCreationFailed, e.to_string());
                }
            },
            FactoryRequest::CreateInstance {
                abi_version,
                key_system,
                callback,
            } => self.create_instance(session, abi_version, key_system, callback, responder),
        }
    }

    fn create_instance(
        &self,
        session: &RpcSession,
        abi_version: i32,
        key_system: String,
        callback: CapId,
        responder: Responder,
    ) {
        if abi_version != CDM_INTERFACE_VERSION {
            return responder.fail(
                ErrorCode::VersionMismatch,
                format!("interface version {abi_version} requested, {CDM_INTERFACE_VERSION} served"),
            );
        }
        if self.sessions.get() >= self.config.max_sessions {
            return responder.fail(
                ErrorCode::InstanceLimit,
                format!("worker already serves {} sessions", self.sessions.get()),
            );
        }
        let module = match self.vendor.get() {
            Ok(module) => module,
            Err(e) => {
                warn!("CreateInstance: {e}");
                return responder.fail(ErrorCode::InstanceCreationFailed, e.to_string());
            }
        };
        let arena = match Arena::create_shared(self.config.arena_size) {
            Ok(arena) => Arc::new(arena),
            Err(e) => return responder.fail(ErrorCode::Internal, format!("arena: {e}")),
        };
        let arena_fd = match arena.fd().map(|fd| fd.try_clone_to_owned()) {
            Some(Ok(fd)) => fd,
            Some(Err(e)) => return responder.fail(ErrorCode::Internal, format!("arena: {e}")),
            None => fatal("shared arena has no descriptor"),
        };

        let cap = CapId(self.next_cap.get());
        self.next_cap.set(cap.0 + 1);
        self.sessions.set(self.sessions.get() + 1);

        let host = Arc::new(HostAdapter::new(session.clone(), callback));
        let fiber = self.scheduler.spawn("create", move |suspender| {
            let cdm = {
                let _scope = host.enter(&suspender, &arena);
                module.create_instance(abi_version, &key_system, host.clone())
            };
            cdm.map(|cdm| Arc::new(Instance { cdm, arena, host }))
        });
        let fiber = match fiber {
            Ok(fiber) => fiber,
            Err(e) => {
                self.sessions.set(self.sessions.get() - 1);
                return responder.fail(ErrorCode::Internal, format!("fiber: {e}"));
            }
        };

        let instances = Rc::clone(&self.instances);
        let sessions = Rc::clone(&self.sessions);
        let arena_size = self.config.arena_size;
        tokio::task::spawn_local(async move {
            match fiber.await {
                Ok(Some(instance)) => {
                    instances.borrow_mut().insert(cap, instance);
                    info!("created instance {cap}");
                    responder.reply_with_fds(
                        Reply::Instance {
                            instance: cap,
                            arena_size,
                        },
                        vec![arena_fd],
                    );
                }
                Ok(None) => {
                    sessions.set(sessions.get() - 1);
                    warn!("vendor refused to create an instance");
                    responder.fail(ErrorCode::InstanceCreationFailed, "vendor returned no instance");
                }
                Err(_) => fatal("instance creation fiber ended without a result"),
            }
        });
    }

    fn serve_instance(&self, cap: CapId, instance: Arc<Instance>, request: InstanceRequest, responder: Responder) {
        let name = request.name();
        let destroying = matches!(request, InstanceRequest::Destroy);
        if destroying {
            self.instances.borrow_mut().remove(&cap);
        }

        let fiber = self.scheduler.spawn(name, move |suspender| {
            let _scope = instance.host.enter(&suspender, &instance.arena);
            debug!("{cap} {name} ->");
            let reply = instance.serve(request);
            debug!("{cap} {name} <-");
            reply
        });
        let fiber = match fiber {
            Ok(fiber) => fiber,
            Err(e) => fatal(format!("failed to start fiber for {name}: {e}")),
        };

        let sessions = Rc::clone(&self.sessions);
        tokio::task::spawn_local(async move {
            let reply = match fiber.await {
                Ok(reply) => reply,
                Err(_) => fatal(format!("{name} fiber ended without a reply")),
            };
            if destroying {
                sessions.set(sessions.get() - 1);
                info!("destroyed instance {cap}");
            }
            responder.reply(reply);
        });
    }
}

impl Dispatch for Worker {
    fn dispatch(&self, session: &RpcSession, target: CapId, call: Call, responder: Responder) {
        if target == CapId::FACTORY {
            return match call {
                Call::Factory(request) => self.serve_factory(session, request, responder),
                _ => responder.fail(ErrorCode::WrongInterface, "the factory only serves Factory calls"),
            };
        }

        let instance = self.instances.borrow().get(&target).cloned();
        match (instance, call) {
            (Some(instance), Call::Instance(request)) => {
                self.serve_instance(target, instance, request, responder)
            }
            (Some(_), _) => responder.fail(ErrorCode::WrongInterface, format!("{target} is an Instance")),
            (None, _) => responder.fail(ErrorCode::UnknownCapability, format!("{target} is not exported")),
        }
    }
}

// ============================================================================
// Instance
// ============================================================================

struct Instance {
    cdm: Box<dyn ContentDecryptionModule + Send + Sync>,
    arena: Arc<Arena>,
    host: Arc<HostAdapter>,
}

impl Instance {
    fn serve(&self, request: InstanceRequest) -> Reply {
        let cdm = &*self.cdm;
        match request {
            InstanceRequest::Initialize {
                allow_distinctive_identifier,
                allow_persistent_state,
                use_hw_secure_codecs,
            } => cdm.initialize(
                allow_distinctive_identifier,
                allow_persistent_state,
                use_hw_secure_codecs,
            ),
            InstanceRequest::SetServerCertificate {
                promise_id,
                certificate,
            } => cdm.set_server_certificate(promise_id, &certificate),
            InstanceRequest::CreateSessionAndGenerateRequest {
                promise_id,
                session_type,
                init_data_type,
                init_data,
            } => cdm.create_session_and_generate_request(
                promise_id,
                session_type,
                init_data_type,
                &init_data,
            ),
            InstanceRequest::UpdateSession {
                promise_id,
                session_id,
                response,
            } => cdm.update_session(promise_id, &session_id, &response),
            InstanceRequest::CloseSession {
                promise_id,
                session_id,
            } => cdm.close_session(promise_id, &session_id),
            InstanceRequest::TimerExpired { context } => cdm.timer_expired(context),
            InstanceRequest::Decrypt { encrypted } => {
                self.arena.reset();
                let mut block = DecryptedBlock::default();
                let status = cdm.decrypt(&encrypted, &mut block);
                return Reply::Decrypted {
                    status,
                    block: (status == Status::SUCCESS).then(|| self.export_block(block)),
                };
            }
            InstanceRequest::InitializeVideoDecoder { config } => {
                return Reply::Status {
                    status: cdm.initialize_video_decoder(&config),
                };
            }
            InstanceRequest::DeinitializeDecoder { decoder_type } => {
                cdm.deinitialize_decoder(decoder_type)
            }
            InstanceRequest::ResetDecoder { decoder_type } => cdm.reset_decoder(decoder_type),
            InstanceRequest::DecryptAndDecodeFrame { encrypted } => {
                self.arena.reset();
                let mut frame = VideoFrame::default();
                let status = cdm.decrypt_and_decode_frame(&encrypted, &mut frame);
                return Reply::Frame {
                    status,
                    frame: (status == Status::SUCCESS).then(|| self.export_frame(frame)),
                };
            }
            InstanceRequest::OnQueryOutputProtectionStatus {
                result,
                link_mask,
                output_protection_mask,
            } => cdm.on_query_output_protection_status(result, link_mask, output_protection_mask),
            InstanceRequest::Destroy => cdm.destroy(),
        }
        Reply::Done
    }

    /// Translates the vendor's output buffer into an arena range and
    /// releases it.
    fn export_buffer(&self, buffer: Option<Box<dyn Buffer>>, method: &str) -> fcdm_protocol::BufferRef {
        let Some(buffer) = buffer else {
            fatal(format!("{method} succeeded without an output buffer"));
        };
        self.arena
            .locate(buffer.as_ptr(), buffer.size())
            .unwrap_or_else(|e| fatal(format!("{method} output is not in the arena: {e}")))
    }

    fn export_block(&self, block: DecryptedBlock) -> DecryptedBlockInfo {
        DecryptedBlockInfo {
            buffer: self.export_buffer(block.buffer, "Decrypt"),
            timestamp: block.timestamp,
        }
    }

    fn export_frame(&self, frame: VideoFrame) -> VideoFrameInfo {
        VideoFrameInfo {
            format: frame.format,
            size: frame.size,
            buffer: self.export_buffer(frame.frame_buffer, "DecryptAndDecodeFrame"),
            planes: frame.planes,
            timestamp: frame.timestamp,
        }
    }
}

// ============================================================================
// Call context
// ============================================================================

/// Per-fiber values that exist for exactly the duration of one call.
pub struct ContextRegistry<T> {
    entries: Mutex<HashMap<ThreadId, T>>,
}

impl<T: Clone> ContextRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `value` for fiber `id` until the scope is dropped.
    pub fn enter(&self, id: ThreadId, value: T) -> ContextScope<'_, T> {
        if self.entries().insert(id, value).is_some() {
            fatal(format!("call context for {id:?} entered twice"));
        }
        ContextScope { registry: self, id }
    }

    /// The context of the calling fiber.
    pub fn current(&self) -> Option<T> {
        self.entries().get(&thread::current().id()).cloned()
    }
}

impl<T: Clone> Default for ContextRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ContextScope<'a, T: Clone> {
    registry: &'a ContextRegistry<T>,
    id: ThreadId,
}

impl<T: Clone> Drop for ContextScope<'_, T> {
    fn drop(&mut self) {
        if self.registry.entries().remove(&self.id).is_none() {
            fatal(format!("call context for {:?} vanished before exit", self.id));
        }
    }
}

#[derive(Clone)]
struct CallContext {
    suspender: Arc<Suspender>,
    arena: Arc<Arena>,
}

// ============================================================================
// Host adapter
// ============================================================================

/// The vendor's view of the host: forwards callbacks over the session and
/// serves `Allocate` and the clock locally.
struct HostAdapter {
    session: RpcSession,
    callback: CapId,
    contexts: ContextRegistry<CallContext>,
}

impl HostAdapter {
    fn new(session: RpcSession, callback: CapId) -> Self {
        Self {
            session,
            callback,
            contexts: ContextRegistry::new(),
        }
    }

    fn enter(&self, suspender: &Arc<Suspender>, arena: &Arc<Arena>) -> ContextScope<'_, CallContext> {
        let context = CallContext {
            suspender: Arc::clone(suspender),
            arena: Arc::clone(arena),
        };
        self.contexts.enter(suspender.id(), context)
    }

    fn context(&self) -> CallContext {
        self.contexts
            .current()
            .unwrap_or_else(|| fatal("host called outside of a vendor call"))
    }

    fn forward(&self, request: CallbackRequest) {
        let name = request.name();
        let context = self.context();
        debug!("{name} -> host");
        let result = context
            .suspender
            .wait(self.session.call(self.callback, Call::Callback(request)));
        debug!("{name} <- host");
        match result {
            Ok(Returned {
                reply: Reply::Done, ..
            }) => {}
            Ok(Returned { reply, .. }) => fatal(format!("unexpected reply to {name}: {reply:?}")),
            Err(e) => fatal(format!("{name} failed: {e}")),
        }
    }
}

/// Negative for clocks set before 1970.
fn seconds_since_epoch(now: SystemTime) -> f64 {
    match now.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

impl Host for HostAdapter {
    fn allocate(&self, capacity: u32) -> Box<dyn Buffer> {
        let context = self.context();
        match ArenaBuffer::allocate(&context.arena, capacity) {
            Ok(buffer) => Box::new(buffer),
            Err(e) => fatal(format!("Allocate({capacity}): {e}")),
        }
    }

    fn set_timer(&self, delay_ms: i64, context: u64) {
        self.forward(CallbackRequest::SetTimer { delay_ms, context });
    }

    fn current_wall_time(&self) -> f64 {
        seconds_since_epoch(SystemTime::now())
    }

    fn on_initialized(&self, success: bool) {
        self.forward(CallbackRequest::OnInitialized { success });
    }

    fn on_resolve_new_session_promise(&self, promise_id: u32, session_id: &[u8]) {
        self.forward(CallbackRequest::OnResolveNewSessionPromise {
            promise_id,
            session_id: session_id.to_vec(),
        });
    }

    fn on_resolve_promise(&self, promise_id: u32) {
        self.forward(CallbackRequest::OnResolvePromise { promise_id });
    }

    fn on_session_message(&self, session_id: &[u8], message_type: MessageType, message: &[u8]) {
        self.forward(CallbackRequest::OnSessionMessage {
            session_id: session_id.to_vec(),
            message_type,
            message: message.to_vec(),
        });
    }

    fn on_session_keys_change(
        &self,
        session_id: &[u8],
        has_additional_usable_key: bool,
        keys: &[KeyInformation],
    ) {
        self.forward(CallbackRequest::OnSessionKeysChange {
            session_id: session_id.to_vec(),
            has_additional_usable_key,
            keys: keys.to_vec(),
        });
    }

    fn on_expiration_change(&self, session_id: &[u8], new_expiry_time: f64) {
        self.forward(CallbackRequest::OnExpirationChange {
            session_id: session_id.to_vec(),
            new_expiry_time,
        });
    }

    fn on_session_closed(&self, session_id: &[u8]) {
        self.forward(CallbackRequest::OnSessionClosed {
            session_id: session_id.to_vec(),
        });
    }

    fn query_output_protection_status(&self) {
        self.forward(CallbackRequest::QueryOutputProtectionStatus);
    }
}
