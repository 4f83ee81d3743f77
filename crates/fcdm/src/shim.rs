//! Host side of the bridge: a [`ContentDecryptionModule`] that forwards
//! every call to an instance living in a worker process.
//!
//! The shim owns a private event loop that only runs while a call waits for
//! its reply. Callbacks the worker makes during that wait are served from
//! the same loop, on the host's thread.

use std::cell::{Ref, RefCell};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::rc::Rc;

use fcdm_protocol::{Call, CallbackRequest, CapId, ErrorCode, FactoryRequest, InstanceRequest, Reply};
use log::{debug, info, warn};
use tokio::net::UnixStream;

use crate::arena::ArenaView;
use crate::broker::{self, WORKER_EXIT_GRACE, WorkerProcess};
use crate::cdm::{
    Buffer, BufferRef, ContentDecryptionModule, DecryptedBlock, Host, InitDataType, InputBuffer,
    QueryResult, SessionType, Status, StreamType, VideoDecoderConfig, VideoFrame,
};
use crate::config::Config;
use crate::error::{BootstrapError, BootstrapResult, fatal};
use crate::rpc::{Dispatch, EventLoop, Responder, Returned, RpcSession};

/// Capability id under which the shim exports the host's callbacks.
pub const CALLBACK_CAP: CapId = CapId(1);

pub struct HostShim {
    conn: RefCell<Option<Connection>>,
}

struct Connection {
    io: EventLoop,
    session: RpcSession,
    instance: CapId,
    arena: ArenaView,
    host: Rc<dyn Host>,
    worker: Option<WorkerProcess>,
}

impl HostShim {
    /// Spawns a worker and creates an instance in it.
    pub fn create(
        config: &Config,
        abi_version: i32,
        key_system: &str,
        host: Rc<dyn Host>,
    ) -> BootstrapResult<Self> {
        let (stream, worker) = broker::spawn_worker(config)?;
        Self::connect(stream, Some(worker), config.arena_size, abi_version, key_system, host)
    }

    /// Creates an instance over an already connected worker socket.
    ///
    /// `worker`, when given, is reaped after `Destroy`.
    pub fn connect(
        stream: StdUnixStream,
        worker: Option<WorkerProcess>,
        arena_size: u32,
        abi_version: i32,
        key_system: &str,
        host: Rc<dyn Host>,
    ) -> BootstrapResult<Self> {
        stream.set_nonblocking(true).map_err(BootstrapError::Socket)?;
        let io = EventLoop::new().map_err(BootstrapError::EventLoop)?;

        let callbacks = Rc::new(CallbackServer {
            host: Rc::clone(&host),
        });
        let (session, returned) = io.block_on(async {
            let stream = UnixStream::from_std(stream).map_err(BootstrapError::Socket)?;
            let session = RpcSession::spawn(stream, callbacks);
            let request = FactoryRequest::CreateInstance {
                abi_version,
                key_system: key_system.to_owned(),
                callback: CALLBACK_CAP,
            };
            let returned = session.call(CapId::FACTORY, Call::Factory(request)).await?;
            Ok::<_, BootstrapError>((session, returned))
        })?;

        let Returned { reply, fds } = returned;
        let Reply::Instance {
            instance,
            arena_size: advertised,
        } = reply
        else {
            return Err(BootstrapError::UnexpectedReply("CreateInstance"));
        };
        if advertised != arena_size {
            return Err(BootstrapError::ArenaSizeMismatch {
                worker: advertised,
                host: arena_size,
            });
        }
        let fd = fds.into_iter().next().ok_or(BootstrapError::MissingArena)?;
        let arena = ArenaView::map(fd, arena_size)?;
        info!("connected to {instance} for {key_system}");

        Ok(Self {
            conn: RefCell::new(Some(Connection {
                io,
                session,
                instance,
                arena,
                host,
                worker,
            })),
        })
    }

    fn connection(&self) -> Ref<'_, Connection> {
        Ref::filter_map(self.conn.borrow(), Option::as_ref)
            .unwrap_or_else(|_| fatal("call on a destroyed CDM instance"))
    }

    fn call(&self, request: InstanceRequest) -> Reply {
        self.connection().call(request)
    }

    fn call_done(&self, request: InstanceRequest) {
        let name = request.name();
        match self.call(request) {
            Reply::Done => {}
            other => fatal(format!("unexpected reply to {name}: {other:?}")),
        }
    }
}

impl Connection {
    fn call(&self, request: InstanceRequest) -> Reply {
        let name = request.name();
        debug!("{name} -> {}", self.instance);
        let result = self
            .io
            .block_on(self.session.call(self.instance, Call::Instance(request)));
        debug!("{name} <- {}", self.instance);
        match result {
            Ok(returned) => returned.reply,
            Err(e) => fatal(format!("{name} failed: {e}")),
        }
    }

    /// Copies an arena range into a buffer from the host's allocator.
    fn copy_out(&self, range: BufferRef) -> Box<dyn Buffer> {
        if let Err(e) = self.arena.check(range) {
            fatal(format!("worker returned a bad range: {e}"));
        }
        let mut buffer = self.host.allocate(range.size);
        if let Err(e) = self.arena.copy_to(range, buffer.data_mut()) {
            fatal(format!("copying decrypted output: {e}"));
        }
        buffer.set_size(range.size);
        buffer
    }
}

impl ContentDecryptionModule for HostShim {
    fn initialize(
        &self,
        allow_distinctive_identifier: bool,
        allow_persistent_state: bool,
        use_hw_secure_codecs: bool,
    ) {
        self.call_done(InstanceRequest::Initialize {
            allow_distinctive_identifier,
            allow_persistent_state,
            use_hw_secure_codecs,
        });
    }

    fn set_server_certificate(&self, promise_id: u32, certificate: &[u8]) {
        self.call_done(InstanceRequest::SetServerCertificate {
            promise_id,
            certificate: certificate.to_vec(),
        });
    }

    fn create_session_and_generate_request(
        &self,
        promise_id: u32,
        session_type: SessionType,
        init_data_type: InitDataType,
        init_data: &[u8],
    ) {
        self.call_done(InstanceRequest::CreateSessionAndGenerateRequest {
            promise_id,
            session_type,
            init_data_type,
            init_data: init_data.to_vec(),
        });
    }

    fn update_session(&self, promise_id: u32, session_id: &[u8], response: &[u8]) {
        self.call_done(InstanceRequest::UpdateSession {
            promise_id,
            session_id: session_id.to_vec(),
            response: response.to_vec(),
        });
    }

    fn close_session(&self, promise_id: u32, session_id: &[u8]) {
        self.call_done(InstanceRequest::CloseSession {
            promise_id,
            session_id: session_id.to_vec(),
        });
    }

    fn timer_expired(&self, context: u64) {
        self.call_done(InstanceRequest::TimerExpired { context });
    }

    fn decrypt(&self, encrypted: &InputBuffer, decrypted: &mut DecryptedBlock) -> Status {
        let conn = self.connection();
        let reply = conn.call(InstanceRequest::Decrypt {
            encrypted: encrypted.clone(),
        });
        let (status, block) = match reply {
            Reply::Decrypted { status, block } => (status, block),
            other => fatal(format!("unexpected reply to Decrypt: {other:?}")),
        };
        if status == Status::SUCCESS {
            let Some(block) = block else {
                fatal("Decrypt succeeded without a block");
            };
            *decrypted = DecryptedBlock {
                buffer: Some(conn.copy_out(block.buffer)),
                timestamp: block.timestamp,
            };
        }
        status
    }

    fn initialize_video_decoder(&self, config: &VideoDecoderConfig) -> Status {
        match self.call(InstanceRequest::InitializeVideoDecoder {
            config: config.clone(),
        }) {
            Reply::Status { status } => status,
            other => fatal(format!("unexpected reply to InitializeVideoDecoder: {other:?}")),
        }
    }

    fn deinitialize_decoder(&self, decoder_type: StreamType) {
        self.call_done(InstanceRequest::DeinitializeDecoder { decoder_type });
    }

    fn reset_decoder(&self, decoder_type: StreamType) {
        self.call_done(InstanceRequest::ResetDecoder { decoder_type });
    }

    fn decrypt_and_decode_frame(&self, encrypted: &InputBuffer, frame: &mut VideoFrame) -> Status {
        let conn = self.connection();
        let reply = conn.call(InstanceRequest::DecryptAndDecodeFrame {
            encrypted: encrypted.clone(),
        });
        let (status, info) = match reply {
            Reply::Frame { status, frame } => (status, frame),
            other => fatal(format!("unexpected reply to DecryptAndDecodeFrame: {other:?}")),
        };
        if status == Status::SUCCESS {
            let Some(info) = info else {
                fatal("DecryptAndDecodeFrame succeeded without a frame");
            };
            *frame = VideoFrame {
                format: info.format,
                size: info.size,
                frame_buffer: Some(conn.copy_out(info.buffer)),
                planes: info.planes,
                timestamp: info.timestamp,
            };
        }
        status
    }

    fn on_query_output_protection_status(
        &self,
        result: QueryResult,
        link_mask: u32,
        output_protection_mask: u32,
    ) {
        self.call_done(InstanceRequest::OnQueryOutputProtectionStatus {
            result,
            link_mask,
            output_protection_mask,
        });
    }

    fn destroy(&self) {
        let Some(conn) = self.conn.borrow_mut().take() else {
            fatal("CDM instance destroyed twice");
        };
        let Connection {
            io,
            session,
            instance,
            arena,
            host: _,
            worker,
        } = conn;

        match io.block_on(session.call(instance, Call::Instance(InstanceRequest::Destroy))) {
            Ok(Returned {
                reply: Reply::Done, ..
            }) => {}
            Ok(Returned { reply, .. }) => warn!("unexpected reply to Destroy: {reply:?}"),
            Err(e) => warn!("Destroy failed: {e}"),
        }
        session.close();
        io.block_on(session.closed());
        drop(arena);
        drop(io);

        if let Some(worker) = worker {
            worker.shutdown(WORKER_EXIT_GRACE);
        }
        info!("destroyed {instance}");
    }
}

/// Serves the Callback interface by invoking the real host.
struct CallbackServer {
    host: Rc<dyn Host>,
}

impl CallbackServer {
    fn invoke(&self, request: CallbackRequest) {
        let host = &*self.host;
        match request {
            CallbackRequest::SetTimer { delay_ms, context } => host.set_timer(delay_ms, context),
            CallbackRequest::OnInitialized { success } => host.on_initialized(success),
            CallbackRequest::OnResolveNewSessionPromise {
                promise_id,
                session_id,
            } => host.on_resolve_new_session_promise(promise_id, &session_id),
            CallbackRequest::OnResolvePromise { promise_id } => host.on_resolve_promise(promise_id),
            CallbackRequest::OnSessionMessage {
                session_id,
                message_type,
                message,
            } => host.on_session_message(&session_id, message_type, &message),
            CallbackRequest::OnSessionKeysChange {
                session_id,
                has_additional_usable_key,
                keys,
            } => host.on_session_keys_change(&session_id, has_additional_usable_key, &keys),
            CallbackRequest::OnExpirationChange {
                session_id,
                new_expiry_time,
            } => host.on_expiration_change(&session_id, new_expiry_time),
            CallbackRequest::OnSessionClosed { session_id } => host.on_session_closed(&session_id),
            CallbackRequest::QueryOutputProtectionStatus => host.query_output_protection_status(),
        }
    }
}

impl Dispatch for CallbackServer {
    fn dispatch(&self, _session: &RpcSession, target: CapId, call: Call, responder: Responder) {
        if target != CALLBACK_CAP {
            return responder.fail(ErrorCode::UnknownCapability, format!("{target} is not exported"));
        }
        match call {
            Call::Callback(request) => {
                debug!("host <- {}", request.name());
                self.invoke(request);
                responder.reply(Reply::Done);
            }
            _ => responder.fail(ErrorCode::WrongInterface, "only Callback calls are served"),
        }
    }
}
