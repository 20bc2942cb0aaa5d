//! Shared state threaded through every [`super::OpData`] (§2, §9 "Global
//! singletons").
//!
//! The original engine reaches its caches and connection state through
//! friend-class pointer access from each `COpData` back into
//! `CFtpControlSocket`. SPEC_FULL §9 calls for an explicit context struct
//! instead; [`OpContext`] is that struct. It is owned by the
//! [`super::ControlSocket`] and handed to each operation by `&mut`
//! reference for the duration of one `send`/`parse_response`/
//! `subcommand_result` call, never stored inside an `OpData`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::caches::locks::{LockGuard, LockKind};
use crate::caches::{DirectoryCache, PathCache, PathLockTable, ServerCapabilities};
use crate::external_ip::{ExternalIpResolver, ResolvedAddress};
use crate::latency::LatencyMeter;
use crate::notification::{CertificateInfo, CertificateTrustReply, FileExistsInfo, FileExistsReply, Notification};
use crate::options::EngineOptions;
use crate::server_info::{Credentials, Server, ServerPath};
use crate::tls::TlsSessionCache;
use crate::transfer_socket::{TransferOutcome, TransferRequest, TransferResult};

/// Process-wide state shared by every connection, handed to a fresh
/// [`OpContext`] at `connect` time (§9 "Global singletons": "Model them as
/// process-scoped values held by a top-level `Engine` context").
#[derive(Clone)]
pub struct EngineShared {
    /// Capability tri-states, keyed by [`Server`].
    pub capabilities: ServerCapabilities,
    /// Listing cache, keyed by `(Server, ServerPath)`.
    pub directory_cache: DirectoryCache,
    /// `(current, subdir) -> canonical` memoization, keyed by [`Server`].
    pub path_cache: PathCache,
    /// Advisory per-path lock table (§5).
    pub locks: Arc<PathLockTable>,
    /// Cached TLS client configs, keyed by [`Server`] (§4.1, §4.7).
    pub tls: TlsSessionCache,
    /// The one-shot external-IP resolver task (§4.1, §4.6).
    pub external_ip: Arc<ExternalIpResolver>,
}

impl Default for EngineShared {
    fn default() -> Self {
        EngineShared {
            capabilities: ServerCapabilities::default(),
            directory_cache: DirectoryCache::default(),
            path_cache: PathCache::default(),
            locks: Arc::new(PathLockTable::new()),
            tls: TlsSessionCache::default(),
            external_ip: Arc::new(ExternalIpResolver::new()),
        }
    }
}

/// Per-connection protocol state, rebuilt fresh for every `connect`.
pub struct OpContext {
    /// Process-wide caches and resolvers.
    pub shared: EngineShared,
    /// The server this connection is talking to.
    pub server: Server,
    /// Credentials supplied for this connection.
    pub credentials: Credentials,
    /// Effective configuration for this connection.
    pub options: EngineOptions,
    /// The remote working directory, as last confirmed by `CWD`/`PWD`
    /// (§8 invariant 5: "updated only upon a 2xy/3xy reply to CWD, or a
    /// successful PWD parse, never speculatively").
    pub current_path: Option<ServerPath>,
    /// Whether the last `TYPE` command sent was `TYPE I` (binary). Used by
    /// `RawTransfer` to skip a redundant `TYPE` before a transfer.
    pub last_type_binary: bool,
    /// Whether `PBSZ 0`/`PROT P` succeeded during logon; gates whether the
    /// data channel must also be TLS-protected (§4.1, §6).
    pub protect_data_channel: bool,
    /// Whether the current top-of-stack operation is the `Logon` op, used
    /// to decide connect-vs-operation error handling (§9 Open Question 4).
    pub logon_in_progress: bool,
    /// Per-connection trace id for log correlation (§10.1).
    pub trace_id: String,
    /// Set by an operation that needs an advisory path lock before it can
    /// proceed, then cleared by [`super::socket::ControlSocket`] once
    /// acquired (§5). `OpData` methods are synchronous, so the actual
    /// `.await` happens in the socket's event loop, not inside the op.
    pub pending_lock: Option<(ServerPath, LockKind)>,
    /// The lock most recently requested via `pending_lock`, once granted.
    /// An operation that pushed a request finds its guard here on the next
    /// `send` call after the event loop resumes it.
    pub held_lock: Option<LockGuard>,
    /// Set by `RawTransfer` to ask [`super::socket::ControlSocket`] to stand
    /// up a [`crate::transfer_socket::TransferSocket`] for the data channel
    /// (§4.6, §4.7). The socket's actual setup is asynchronous, so — like
    /// `pending_lock` above — this is a request the synchronous `OpData`
    /// methods hand off to the event loop rather than perform themselves.
    pub pending_transfer_request: Option<TransferRequest>,
    /// The final outcome of the most recently requested transfer, once the
    /// `TransferSocket` task reports completion.
    pub transfer_outcome: Option<TransferOutcome>,
    /// Set by `RawTransfer` when it needs the address to advertise in
    /// `PORT`/`EPRT` and `external_ip_mode` requires asynchronous
    /// resolution (§4.1, §4.6).
    pub pending_external_ip: bool,
    /// The most recently resolved external-IP address, once available.
    pub external_ip_result: Option<ResolvedAddress>,
    /// Round-trip latency sampling for this connection (§2 `LatencyMeter`).
    pub latency: LatencyMeter,
    /// This connection's local address on the control channel, once
    /// connected. `RawTransfer` reads this for source-IP binding and
    /// active-mode listener family selection (§4.6, §4.7).
    pub control_local_addr: Option<SocketAddr>,
    /// The control channel's peer address, once connected. `RawTransfer`
    /// reads this to substitute an unroutable `PASV` reply address and as
    /// the host for `EPSV` (§4.6).
    pub control_peer_addr: Option<SocketAddr>,
    /// Set by `RawTransfer` in active mode to ask the event loop to bind a
    /// listening socket before the `PORT`/`EPRT` command text can be
    /// composed (the port must be known up front, unlike passive mode's
    /// connect-after-the-fact flow).
    pub pending_listener_bind: Option<ListenerBindRequest>,
    /// The listener bound in response to `pending_listener_bind`, together
    /// with the local port `RawTransfer` advertises to the server. Taken
    /// (via [`Option::take`]) once `RawTransfer` reaches `TransferCmd` and
    /// hands it off inside a [`TransferRequest`].
    pub bound_listener: Option<(tokio::net::TcpListener, u16)>,
    /// Set by `RawTransfer` on completion with data its parent (`List`,
    /// `FileTransfer`) needs but that doesn't fit in an [`OpStatus`] —
    /// bytes moved, parsed listing entries. Read (and taken) by the parent's
    /// `subcommand_result`.
    pub last_transfer_result: Option<TransferResult>,
    /// Notifications queued by an operation for [`super::socket::ControlSocket`]
    /// to forward to the host's [`crate::notification::NotificationListener`]
    /// on the next event loop iteration, mirroring `pending_lock`'s
    /// synchronous-op/async-loop handoff.
    pub pending_notifications: Vec<Notification>,
    /// Set by `FileTransfer` when the host must decide whether to overwrite,
    /// resume, or skip before a transfer proceeds (§4.5). Cleared once
    /// `file_exists_reply` is filled in by the host.
    pub pending_file_exists_prompt: Option<FileExistsInfo>,
    /// The host's answer to `pending_file_exists_prompt`, supplied out of
    /// band via `ControlSocket::answer_file_exists`.
    pub file_exists_reply: Option<FileExistsReply>,
    /// Set by the TLS handshake step when a certificate needs a trust
    /// decision from the host (§4.7).
    pub pending_certificate_prompt: Option<CertificateInfo>,
    /// The host's answer to `pending_certificate_prompt`, supplied out of
    /// band via `ControlSocket::answer_certificate_trust`.
    pub certificate_trust_reply: Option<CertificateTrustReply>,
    /// Set by `Logon` once `AUTH TLS`/`AUTH SSL` is accepted, asking the
    /// event loop to perform the explicit-FTPES handshake on the existing
    /// TCP socket before the stack is driven any further (§4.1 "TLS
    /// upgrade", §4.2 `AuthTls`/`AuthWait`).
    pub pending_tls_upgrade: bool,
    /// Set by `Logon` when `LogonType::Ask`/`Interactive` needs a
    /// host-supplied credential before continuing (§4.1, §4.2). Cleared
    /// once `interactive_login_reply` is filled in by the host, the same
    /// handoff shape as `pending_file_exists_prompt`.
    pub pending_interactive_login_prompt: Option<String>,
    /// The host's answer to `pending_interactive_login_prompt`, supplied out
    /// of band via `ControlSocket::answer_interactive_login`.
    pub interactive_login_reply: Option<String>,
}

/// Parameters for an active-mode listener bind, handed to the event loop
/// via [`OpContext::pending_listener_bind`] (§4.6 "PortPasv", §4.7
/// "Active-mode listening").
pub struct ListenerBindRequest {
    /// Local address to bind to (family matches the control connection or
    /// the resolved external address).
    pub bind_addr: std::net::IpAddr,
    /// Port range to try, if port-range limiting is configured.
    pub port_range: Option<std::ops::RangeInclusive<u16>>,
}

impl OpContext {
    /// Builds a fresh per-connection context against the given shared
    /// process state.
    pub fn new(shared: EngineShared, server: Server, credentials: Credentials, options: EngineOptions) -> Self {
        OpContext {
            shared,
            server,
            credentials,
            options,
            current_path: None,
            last_type_binary: false,
            protect_data_channel: false,
            logon_in_progress: true,
            trace_id: uuid::Uuid::new_v4().to_string(),
            pending_lock: None,
            held_lock: None,
            pending_transfer_request: None,
            transfer_outcome: None,
            pending_external_ip: false,
            external_ip_result: None,
            latency: LatencyMeter::new(),
            control_local_addr: None,
            control_peer_addr: None,
            pending_listener_bind: None,
            bound_listener: None,
            last_transfer_result: None,
            pending_notifications: Vec::new(),
            pending_file_exists_prompt: None,
            file_exists_reply: None,
            pending_certificate_prompt: None,
            certificate_trust_reply: None,
            pending_tls_upgrade: false,
            pending_interactive_login_prompt: None,
            interactive_login_reply: None,
        }
    }
}
