//! `ControlSocket`: the connection-owning event loop (§4.1).
//!
//! Grounded on `ftpcontrolsocket.cpp`'s whole-file shape (dial, optional
//! implicit TLS, the logon handshake, then a steady state of one
//! command-at-a-time dispatch) and on the teacher's
//! `server::controlchan::control_loop::spawn` for the `tokio::spawn` +
//! `tokio::select!` event-loop idiom — a fused command source racing an
//! internal-message channel and an idle timeout, generalized here from "one
//! server session" to "one client connection driving an [`super::OpData`]
//! stack". The host never touches the stack or the socket directly: it
//! talks to a cheap, cloneable [`ControlSocket`] handle that forwards
//! requests to a task running [`Connection::run`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::pki_types::ServerName;

use crate::control::change_dir::ChangeDirOp;
use crate::control::chmod::ChmodOp;
use crate::control::context::{EngineShared, OpContext};
use crate::control::delete_op::DeleteOp;
use crate::control::file_transfer::{FileTransferOp, FileTransferSettings};
use crate::control::list::ListOp;
use crate::control::logon::LogonOp;
use crate::control::mkdir::MkdirOp;
use crate::control::raw_command::RawCommandOp;
use crate::control::remove_dir::RemoveDirOp;
use crate::control::rename::RenameOp;
use crate::control::{dispatch_reply, drive_send, DriveResult, OpData};
use crate::error::{EngineError, EngineErrorKind};
use crate::notification::{CertificateTrustReply, ConnectionStatus, EventMeta, FileExistsReply, MessageCategory, Notification, NotificationListener, TransferStatus};
use crate::options::EngineOptions;
use crate::reply::{Reply, ReplyAssembler};
use crate::server_info::{Credentials, Protocol, Server, ServerPath};
use crate::status::OpStatus;
use crate::transfer_socket::{self, TransferEndReason, TransferEvent, TransferOutcome, TransferRequest};

/// How long an idling connection waits before sending a keep-alive probe
/// (§4.1 "keep-alive").
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
/// Absolute ceiling on how long a connection may sit idle before the engine
/// gives up on it rather than keep probing forever (§4.1).
const KEEPALIVE_CUTOFF: Duration = Duration::from_secs(30 * 60);
/// How long a call to [`Connection::read_reply`] will wait for the next
/// byte before treating the connection as dead (§4.1 "inactivity timeout").
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Anything a [`Connection`] can read from and write to, erased so an
/// explicit-TLS upgrade can swap a plain [`TcpStream`] for a
/// `tokio_rustls::client::TlsStream` mid-connection without changing the
/// `Connection`'s own type.
trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> AsyncReadWrite for T {}

/// A handle to one connection's background task. Cheap to clone; every
/// method forwards a request over a channel and, for commands, waits for
/// the corresponding top-level [`OpStatus`] (§4.1 "Command surface").
#[derive(Clone)]
pub struct ControlSocket {
    requests: mpsc::Sender<Request>,
}

enum Request {
    Submit {
        op: Box<dyn OpData>,
        done: oneshot::Sender<Result<OpStatus, EngineError>>,
    },
    AnswerFileExists(FileExistsReply),
    AnswerCertificateTrust(CertificateTrustReply),
    AnswerInteractiveLogin(String),
    Disconnect,
}

impl ControlSocket {
    /// Dials `server`, performs an implicit TLS handshake if
    /// `server.protocol` is [`Protocol::Ftps`], then drives a [`LogonOp`] to
    /// completion. Returns the connected handle together with the logon's
    /// final status; the host decides whether a non-OK status is fatal to
    /// its own workflow (§4.1 "connect").
    pub async fn connect(server: Server, credentials: Credentials, options: EngineOptions, shared: EngineShared, listener: Arc<dyn NotificationListener>) -> Result<(ControlSocket, OpStatus), EngineError> {
        let post_login_commands = server.post_login_commands.clone();
        let tcp = TcpStream::connect((server.host.as_str(), server.port)).await?;
        tcp.set_nodelay(true).ok();
        let local_addr = tcp.local_addr()?;
        let peer_addr = tcp.peer_addr()?;

        let mut ctx = OpContext::new(shared, server, credentials, options);
        ctx.control_local_addr = Some(local_addr);
        ctx.control_peer_addr = Some(peer_addr);

        let (requests_tx, requests_rx) = mpsc::channel(8);
        let mut connection = Connection {
            stream: Box::new(tcp),
            assembler: ReplyAssembler::new(),
            buffered_replies: VecDeque::new(),
            stack: Vec::new(),
            ctx,
            listener,
            sequence: 0,
            requests: requests_rx,
            current_op_name: None,
            pending_top_level: None,
            closing: false,
            last_activity: Instant::now(),
            transfer_events: None,
        };

        connection.notify(Notification::StatusChanged(ConnectionStatus::Connecting)).await;
        if connection.ctx.server.protocol == Protocol::Ftps {
            connection.ctx.pending_tls_upgrade = true;
            if let Err(e) = connection.drain_pending().await {
                connection.notify(Notification::StatusChanged(ConnectionStatus::Disconnected)).await;
                return Err(e);
            }
        }
        connection.notify(Notification::StatusChanged(ConnectionStatus::LoggingIn)).await;

        tokio::spawn(connection.run());

        let handle = ControlSocket { requests: requests_tx };
        let status = handle.submit(Box::new(LogonOp::new(post_login_commands))).await?;
        Ok((handle, status))
    }

    async fn submit(&self, op: Box<dyn OpData>) -> Result<OpStatus, EngineError> {
        let (done, rx) = oneshot::channel();
        self.requests
            .send(Request::Submit { op, done })
            .await
            .map_err(|_| EngineError::new(EngineErrorKind::Disconnected))?;
        rx.await.map_err(|_| EngineError::new(EngineErrorKind::Disconnected))?
    }

    /// Lists `dir` (§4.4). The refreshed listing, if any, arrives as a
    /// [`Notification::DirectoryListingChanged`] rather than as a return
    /// value — the core is notification-driven, not request/response for
    /// payload data.
    pub async fn list(&self, dir: ServerPath) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(ListOp::new(dir))).await
    }

    /// Changes the remote working directory to `path` (§4.3).
    pub async fn change_dir(&self, path: ServerPath) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(ChangeDirOp::to(path))).await
    }

    /// Uploads or downloads one file (§4.5). `download = true` pulls
    /// `remote_name` from `dir` into `local_path`; `download = false` pushes
    /// `local_path` up as `remote_name`.
    pub async fn file_transfer(&self, dir: ServerPath, remote_name: impl Into<String>, local_path: PathBuf, download: bool, settings: FileTransferSettings) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(FileTransferOp::new(dir, remote_name, local_path, download, settings))).await
    }

    /// Sends one command verbatim and reports its reply as a notification
    /// (§4.8).
    pub async fn raw_command(&self, command: impl Into<String>) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(RawCommandOp::new(command))).await
    }

    /// Deletes `names` from `dir` (§4.4).
    pub async fn delete(&self, dir: ServerPath, names: Vec<String>) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(DeleteOp::new(dir, names))).await
    }

    /// Removes the directory at `target` (§4.4).
    pub async fn remove_dir(&self, target: ServerPath) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(RemoveDirOp::new(target))).await
    }

    /// Creates `path`, including any missing parent directories (§4.4).
    pub async fn mkdir(&self, path: ServerPath) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(MkdirOp::new(path))).await
    }

    /// Renames `from` to `to` (§4.4).
    pub async fn rename(&self, from: ServerPath, to: ServerPath) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(RenameOp::new(from, to))).await
    }

    /// Issues `SITE CHMOD` for `name` within `dir` (§4.4).
    pub async fn chmod(&self, dir: ServerPath, name: impl Into<String>, permission: impl Into<String>) -> Result<OpStatus, EngineError> {
        self.submit(Box::new(ChmodOp::new(dir, name, permission))).await
    }

    /// Answers an outstanding [`Notification::FileExistsPrompt`].
    pub async fn answer_file_exists(&self, reply: FileExistsReply) {
        let _ = self.requests.send(Request::AnswerFileExists(reply)).await;
    }

    /// Answers an outstanding [`Notification::CertificatePrompt`].
    pub async fn answer_certificate_trust(&self, reply: CertificateTrustReply) {
        let _ = self.requests.send(Request::AnswerCertificateTrust(reply)).await;
    }

    /// Answers an outstanding [`Notification::InteractiveLoginPrompt`].
    pub async fn answer_interactive_login(&self, reply: impl Into<String>) {
        let _ = self.requests.send(Request::AnswerInteractiveLogin(reply.into())).await;
    }

    /// Closes the connection. Any operation awaiting its result receives
    /// [`EngineErrorKind::Disconnected`].
    pub async fn disconnect(&self) {
        let _ = self.requests.send(Request::Disconnect).await;
    }
}

/// Whether a suspended operation was unblocked by engine-internal async
/// work (a lock, a resolved address, a finished handshake or transfer) or is
/// genuinely waiting for the next line on the control channel.
enum Resolution {
    Resolved,
    WaitForReply,
}

/// What [`Connection::pump_once`]'s single `select!` produced.
enum PumpEvent {
    Transfer(Option<TransferEvent>),
    Replies(Result<Vec<Reply>, EngineError>),
}

/// Reads one chunk off `stream`, feeding it to `assembler`. Standalone
/// rather than a `Connection` method so [`Connection::pump_once`] can race
/// it against a read of `self.transfer_events` without borrowing all of
/// `self`.
async fn read_chunk(stream: &mut Box<dyn AsyncReadWrite>, assembler: &mut ReplyAssembler) -> Result<Vec<Reply>, EngineError> {
    let mut buf = [0u8; crate::reply::READ_CHUNK_SIZE];
    let n = tokio::select! {
        result = stream.read(&mut buf) => result?,
        _ = tokio::time::sleep(INACTIVITY_TIMEOUT) => return Err(EngineError::new(EngineErrorKind::Timeout)),
    };
    if n == 0 {
        return Err(EngineError::new(EngineErrorKind::Disconnected));
    }
    assembler.feed(&buf[..n])
}

/// Owns the socket, the op stack, and the per-connection context. Lives
/// entirely inside the task spawned by [`ControlSocket::connect`]; the host
/// never sees this type.
struct Connection {
    stream: Box<dyn AsyncReadWrite>,
    assembler: ReplyAssembler,
    buffered_replies: VecDeque<Reply>,
    stack: Vec<Box<dyn OpData>>,
    ctx: OpContext,
    listener: Arc<dyn NotificationListener>,
    sequence: u64,
    requests: mpsc::Receiver<Request>,
    /// Name of the op currently driving the stack as a top-level command,
    /// captured at `Request::Submit` time since `unwind_one` has already
    /// popped it by the time `DriveResult::Completed` is observed.
    current_op_name: Option<&'static str>,
    /// The caller waiting on the current top-level command, if any. `None`
    /// while driving an engine-internal probe (keep-alive).
    pending_top_level: Option<oneshot::Sender<Result<OpStatus, EngineError>>>,
    closing: bool,
    last_activity: Instant,
    /// Events from a data-channel transfer spawned by [`Connection::start_transfer`],
    /// once the data connection itself is up. Drained alongside control-channel
    /// bytes by [`Connection::pump_once`] so `Progress`/`Ended` events don't
    /// block the control reply the transfer command is still waiting on.
    transfer_events: Option<mpsc::Receiver<TransferEvent>>,
}

impl Connection {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else { return };
                    self.handle_request(request).await;
                    if self.closing {
                        self.notify(Notification::StatusChanged(ConnectionStatus::Disconnected)).await;
                        return;
                    }
                }
                _ = tokio::time::sleep(KEEPALIVE_IDLE), if self.ctx.options.ftp_send_keepalive && self.stack.is_empty() => {
                    if self.last_activity.elapsed() >= KEEPALIVE_CUTOFF {
                        self.notify(Notification::Log {
                            category: MessageCategory::DebugWarning,
                            text: "keep-alive cutoff reached, closing idle connection".to_string(),
                        }).await;
                        self.notify(Notification::StatusChanged(ConnectionStatus::Disconnected)).await;
                        return;
                    }
                    self.send_keepalive_probe().await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Submit { op, done } => {
                self.current_op_name = Some(op.name());
                self.pending_top_level = Some(done);
                self.stack.push(op);
                self.drive_one_op().await;
            }
            Request::AnswerFileExists(reply) => self.ctx.file_exists_reply = Some(reply),
            Request::AnswerCertificateTrust(reply) => self.ctx.certificate_trust_reply = Some(reply),
            Request::AnswerInteractiveLogin(reply) => self.ctx.interactive_login_reply = Some(reply),
            Request::Disconnect => self.closing = true,
        }
    }

    /// Drives the stack from the moment a top-level op is pushed until the
    /// stack empties (success or error) — §4.1 "Dispatch".
    async fn drive_one_op(&mut self) {
        let mut result = drive_send(&mut self.stack, &mut self.ctx);
        loop {
            self.flush_notifications().await;
            match result {
                DriveResult::SendCommand(cmd) => {
                    if let Err(e) = self.write_command(&cmd).await {
                        self.fail_connection(e).await;
                        return;
                    }
                    match self.read_reply().await {
                        Ok(reply) => {
                            result = dispatch_reply(&mut self.stack, &mut self.ctx, &reply);
                            continue;
                        }
                        Err(e) => {
                            self.fail_connection(e).await;
                            return;
                        }
                    }
                }
                DriveResult::Suspend => match self.drain_pending().await {
                    Ok(true) => {
                        result = drive_send(&mut self.stack, &mut self.ctx);
                        continue;
                    }
                    Ok(false) => match self.read_reply().await {
                        Ok(reply) => {
                            result = dispatch_reply(&mut self.stack, &mut self.ctx, &reply);
                            continue;
                        }
                        Err(e) => {
                            self.fail_connection(e).await;
                            return;
                        }
                    },
                    Err(e) => {
                        self.fail_top_level(e).await;
                        return;
                    }
                },
                DriveResult::Completed(status) => {
                    self.finish_top_level(status).await;
                    return;
                }
                DriveResult::StackEmpty => return,
            }
        }
    }

    /// Resolves every `ctx.pending_*` field that is currently set, looping
    /// until none remain. Returns whether anything was actually resolved —
    /// `false` means the op's `Suspend` simply meant "wait for the next
    /// control-channel reply" (e.g. the banner).
    async fn drain_pending(&mut self) -> Result<bool, EngineError> {
        let mut resolved_any = false;
        loop {
            match self.resolve_pending().await? {
                Resolution::Resolved => resolved_any = true,
                Resolution::WaitForReply => return Ok(resolved_any),
            }
        }
    }

    async fn resolve_pending(&mut self) -> Result<Resolution, EngineError> {
        if let Some((path, kind)) = self.ctx.pending_lock.take() {
            let guard = self.ctx.shared.locks.acquire(&self.ctx.server, &path, kind).await;
            self.ctx.held_lock = Some(guard);
            return Ok(Resolution::Resolved);
        }
        if let Some(request) = self.ctx.pending_listener_bind.take() {
            let listener = transfer_socket::bind_active_listener(request.bind_addr, request.port_range).await?;
            let port = listener.local_addr()?.port();
            self.ctx.bound_listener = Some((listener, port));
            return Ok(Resolution::Resolved);
        }
        if self.ctx.pending_external_ip {
            self.ctx.pending_external_ip = false;
            let control_peer_is_routable = self
                .ctx
                .control_peer_addr
                .map(|addr| !transfer_socket::is_non_routable(addr.ip()))
                .unwrap_or(false);
            let control_local_addr = self.ctx.control_local_addr.map(|addr| addr.ip()).unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
            let resolved = self
                .ctx
                .shared
                .external_ip
                .resolve(&self.ctx.options.external_ip_mode, self.ctx.options.no_external_on_local, control_local_addr, control_peer_is_routable)
                .await;
            self.ctx.external_ip_result = Some(resolved);
            return Ok(Resolution::Resolved);
        }
        if self.ctx.pending_tls_upgrade {
            self.ctx.pending_tls_upgrade = false;
            self.upgrade_tls().await?;
            if let Some(info) = self.ctx.shared.tls.take_certificate_info(&self.ctx.server) {
                self.ctx.pending_certificate_prompt = Some(info);
            }
            return Ok(Resolution::Resolved);
        }
        if let Some(info) = self.ctx.pending_certificate_prompt.take() {
            self.notify(Notification::CertificatePrompt(info)).await;
            let request = self.await_answer(|r| matches!(r, Request::AnswerCertificateTrust(_)), "certificate trust").await?;
            let Request::AnswerCertificateTrust(reply) = request else { unreachable!() };
            if matches!(reply, CertificateTrustReply::Reject) {
                self.ctx.shared.tls.forget(&self.ctx.server);
                return Err(EngineError::new(EngineErrorKind::CertificateNotTrusted));
            }
            self.ctx.certificate_trust_reply = Some(reply);
            return Ok(Resolution::Resolved);
        }
        if let Some(info) = self.ctx.pending_file_exists_prompt.take() {
            self.notify(Notification::FileExistsPrompt(info)).await;
            let request = self.await_answer(|r| matches!(r, Request::AnswerFileExists(_)), "file exists").await?;
            let Request::AnswerFileExists(reply) = request else { unreachable!() };
            self.ctx.file_exists_reply = Some(reply);
            return Ok(Resolution::Resolved);
        }
        if let Some(challenge) = self.ctx.pending_interactive_login_prompt.take() {
            self.notify(Notification::InteractiveLoginPrompt { challenge }).await;
            let request = self.await_answer(|r| matches!(r, Request::AnswerInteractiveLogin(_)), "interactive login").await?;
            let Request::AnswerInteractiveLogin(reply) = request else { unreachable!() };
            self.ctx.interactive_login_reply = Some(reply);
            return Ok(Resolution::Resolved);
        }
        if let Some(request) = self.ctx.pending_transfer_request.take() {
            self.start_transfer(request).await;
            return Ok(Resolution::Resolved);
        }
        Ok(Resolution::WaitForReply)
    }

    /// Blocks on `self.requests` until a `Request` matching `accept` shows
    /// up, answering any `Submit` that arrives in the meantime with an
    /// immediate error — only one thing may be in flight on a control
    /// connection at a time (§4.1, §5).
    async fn await_answer(&mut self, accept: impl Fn(&Request) -> bool, what: &str) -> Result<Request, EngineError> {
        loop {
            match self.requests.recv().await {
                Some(request) if accept(&request) => return Ok(request),
                Some(Request::Submit { done, .. }) => {
                    tracing::debug!(trace_id = %self.ctx.trace_id, waiting_for = what, "rejecting command submitted while a host prompt is outstanding");
                    let _ = done.send(Ok(OpStatus::ERROR));
                }
                Some(Request::Disconnect) => {
                    self.closing = true;
                    return Err(EngineError::new(EngineErrorKind::Canceled));
                }
                Some(_) => {}
                None => return Err(EngineError::new(EngineErrorKind::Disconnected)),
            }
        }
    }

    /// Spawns the data-channel transfer task and waits only until the data
    /// connection itself is up (or the attempt has already failed) — NOT
    /// until the transfer finishes. The transfer command on the control
    /// channel (`State::TransferCmd` in [`crate::control::raw_transfer`])
    /// has not been sent yet at this point, so blocking here for completion
    /// would deadlock: the server has no reason to send data until it
    /// receives that command. Once the data connection is confirmed, the
    /// remaining `Progress`/`Ended` events are drained by [`Connection::pump_once`]
    /// alongside control-channel replies.
    async fn start_transfer(&mut self, request: TransferRequest) {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let tls_resume_hint = self.ctx.shared.capabilities.snapshot(&self.ctx.server).tls_resume;
        tokio::spawn(transfer_socket::run(request, self.ctx.server.clone(), self.ctx.shared.tls.clone(), self.ctx.options.tls_flags, tls_resume_hint, events_tx));
        loop {
            match events_rx.recv().await {
                Some(TransferEvent::Connected) => {
                    self.notify(Notification::Log {
                        category: MessageCategory::DebugVerbose,
                        text: "data connection established".to_string(),
                    })
                    .await;
                    self.transfer_events = Some(events_rx);
                    return;
                }
                Some(TransferEvent::Progress { bytes_transferred }) => {
                    self.notify(Notification::TransferStatus(TransferStatus {
                        bytes_transferred,
                        bytes_total: None,
                        bytes_per_second: 0.0,
                    }))
                    .await;
                }
                Some(TransferEvent::Ended(outcome)) => {
                    self.ctx.transfer_outcome = Some(outcome);
                    return;
                }
                None => {
                    self.ctx.transfer_outcome = Some(TransferOutcome {
                        reason: TransferEndReason::TransferFailure,
                        bytes_transferred: 0,
                        listing_entries: None,
                        tls_resumed: None,
                    });
                    return;
                }
            }
        }
    }

    async fn upgrade_tls(&mut self) -> Result<(), EngineError> {
        let connector = self.ctx.shared.tls.connector_for(&self.ctx.server, self.ctx.options.tls_flags);
        let domain = ServerName::try_from(self.ctx.server.host.clone()).map_err(|_| EngineError::new(EngineErrorKind::TlsHandshake))?.to_owned();
        let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::empty()));
        let tls = connector.connect(domain, plain).await.map_err(|e| EngineError::with_source(EngineErrorKind::TlsHandshake, e))?;
        self.stream = Box::new(tls);
        Ok(())
    }

    async fn send_keepalive_probe(&mut self) {
        let choices = ["NOOP", "TYPE I", "PWD"];
        let mut byte = [0u8; 1];
        let index = if getrandom::fill(&mut byte).is_ok() { byte[0] as usize % choices.len() } else { 0 };
        self.current_op_name = None;
        self.pending_top_level = None;
        self.stack.push(Box::new(RawCommandOp::new(choices[index])));
        self.drive_one_op().await;
    }

    async fn read_reply(&mut self) -> Result<Reply, EngineError> {
        loop {
            if let Some(reply) = self.buffered_replies.pop_front() {
                return Ok(reply);
            }
            self.pump_once().await?;
        }
    }

    /// Advances by exactly one event: either a chunk of control-channel
    /// bytes (fed to the assembler, yielding zero or more buffered replies),
    /// or, while a transfer is in flight, one [`TransferEvent`] from it.
    /// Keeping these on one `select!` means a transfer's progress updates
    /// never stall the control reply its command is waiting on, and vice
    /// versa (§4.1, §4.6).
    async fn pump_once(&mut self) -> Result<(), EngineError> {
        let outcome = if let Some(events_rx) = self.transfer_events.as_mut() {
            tokio::select! {
                event = events_rx.recv() => PumpEvent::Transfer(event),
                replies = read_chunk(&mut self.stream, &mut self.assembler) => PumpEvent::Replies(replies),
            }
        } else {
            PumpEvent::Replies(read_chunk(&mut self.stream, &mut self.assembler).await)
        };
        match outcome {
            PumpEvent::Transfer(Some(TransferEvent::Progress { bytes_transferred })) => {
                self.notify(Notification::TransferStatus(TransferStatus {
                    bytes_transferred,
                    bytes_total: None,
                    bytes_per_second: 0.0,
                }))
                .await;
                Ok(())
            }
            PumpEvent::Transfer(Some(TransferEvent::Ended(outcome))) => {
                self.ctx.transfer_outcome = Some(outcome);
                self.transfer_events = None;
                Ok(())
            }
            PumpEvent::Transfer(Some(TransferEvent::Connected)) => Ok(()),
            PumpEvent::Transfer(None) => {
                self.ctx.transfer_outcome = Some(TransferOutcome {
                    reason: TransferEndReason::TransferFailure,
                    bytes_transferred: 0,
                    listing_entries: None,
                    tls_resumed: None,
                });
                self.transfer_events = None;
                Ok(())
            }
            PumpEvent::Replies(result) => {
                let replies = result?;
                self.buffered_replies.extend(replies);
                self.last_activity = Instant::now();
                Ok(())
            }
        }
    }

    async fn write_command(&mut self, cmd: &str) -> Result<(), EngineError> {
        self.notify(Notification::Log {
            category: MessageCategory::Command,
            text: mask_command(cmd),
        })
        .await;
        self.stream.write_all(cmd.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Fails the current top-level command with `error` without tearing
    /// down the connection — used when an engine-internal async step (a
    /// rejected certificate, a canceled prompt) fails but the transport is
    /// still sound (§9 Open Question 4).
    async fn fail_top_level(&mut self, error: EngineError) {
        self.stack.clear();
        self.ctx.held_lock = None;
        self.transfer_events = None;
        self.flush_notifications().await;
        if let Some(done) = self.pending_top_level.take() {
            let _ = done.send(Err(error));
        }
    }

    /// Fails the current top-level command and closes the connection — used
    /// for transport-level failures, where nothing further can be trusted
    /// (§9 Open Question 4).
    async fn fail_connection(&mut self, error: EngineError) {
        self.stack.clear();
        self.ctx.held_lock = None;
        self.transfer_events = None;
        self.flush_notifications().await;
        if let Some(done) = self.pending_top_level.take() {
            let _ = done.send(Err(error));
        }
        self.closing = true;
    }

    /// Delivers a completed top-level op's status to its caller and applies
    /// the connect-vs-operation error distinction: a failed `Logon` closes
    /// the connection, a failed ordinary operation only resets the stack
    /// (already empty here) and leaves the connection open (§9 Open
    /// Question 4).
    async fn finish_top_level(&mut self, status: OpStatus) {
        let operation = self.current_op_name.take().unwrap_or("unknown");
        if let Some(done) = self.pending_top_level.take() {
            let _ = done.send(Ok(status));
            self.notify(Notification::OperationCompleted { operation, status }).await;
        }
        if operation == "logon" {
            if status.is_error() {
                self.ctx.logon_in_progress = false;
                self.closing = true;
            } else {
                self.notify(Notification::StatusChanged(ConnectionStatus::Ready)).await;
            }
        }
    }

    async fn notify(&mut self, event: Notification) {
        self.sequence += 1;
        let meta = EventMeta {
            server_label: self.ctx.server.name.clone().unwrap_or_else(|| self.ctx.server.host.clone()),
            trace_id: self.ctx.trace_id.clone(),
            sequence_number: self.sequence,
        };
        self.listener.receive(event, meta).await;
    }

    async fn flush_notifications(&mut self) {
        let pending = std::mem::take(&mut self.ctx.pending_notifications);
        for notification in pending {
            self.notify(notification).await;
        }
    }
}

/// Masks a `PASS` command's argument before it reaches a log notification
/// (§10.1: the engine never emits credentials to its own diagnostics).
fn mask_command(cmd: &str) -> String {
    if let Some(rest) = cmd.strip_prefix("PASS ") {
        let _ = rest;
        "PASS ****".to_string()
    } else if let Some(rest) = cmd.strip_prefix("ACCT ") {
        let _ = rest;
        "ACCT ****".to_string()
    } else {
        cmd.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_command_hides_password_and_account() {
        assert_eq!(mask_command("PASS hunter2"), "PASS ****");
        assert_eq!(mask_command("ACCT billing"), "ACCT ****");
        assert_eq!(mask_command("USER anonymous"), "USER anonymous");
    }
}
