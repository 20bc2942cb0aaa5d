//! Host-facing event types (§4.1, §7).
//!
//! Grounded on `notification::event::{DataEvent, PresenceEvent,
//! DataListener, PresenceListener}` in the teacher crate: a small `Debug +
//! Clone` event enum plus an `async_trait` listener the host implements.
//! The teacher's events describe *storage-backend* outcomes observed by a
//! server; this crate's [`Notification`] describes *protocol-engine*
//! outcomes observed by a client host, per the list in spec.md §4.1:
//! "log lines, status changes, directory-listing-updated, file-exists
//! prompt, interactive-login prompt, certificate prompt, transfer-status,
//! operation-completed(result)".

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

use crate::directory_listing::DirectoryListing;
use crate::server_info::ServerPath;
use crate::status::OpStatus;

/// The stable message categories the core itself emits (§7); the host maps
/// these to localized strings, the core never produces user-facing text
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// A status update unrelated to a specific error.
    Status,
    /// An error condition worth surfacing to the user.
    Error,
    /// A command the engine is about to send (password arguments masked).
    Command,
    /// A raw server reply line.
    Response,
    /// A recoverable anomaly worth a user's attention at default verbosity.
    DebugWarning,
    /// Informational diagnostic detail.
    DebugInfo,
    /// Verbose diagnostic detail (state transitions, retries).
    DebugVerbose,
    /// Maximum diagnostic detail (byte-level framing, cache hits/misses).
    DebugDebug,
}

/// The connection-level status the host is kept informed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Dialing the control connection.
    Connecting,
    /// TCP connected, TLS handshake (if any) and logon in progress.
    LoggingIn,
    /// Logon complete; idle or executing an operation.
    Ready,
    /// The control connection has been torn down.
    Disconnected,
}

/// Why a server TLS certificate needs a trust decision from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name / SAN summary, as a display string.
    pub subject: String,
    /// Issuer display string.
    pub issuer: String,
    /// Hex-encoded SHA-256 fingerprint.
    pub fingerprint_sha256: String,
    /// Why verification did not succeed on its own (empty if the host is
    /// simply being asked to confirm a first-seen certificate).
    pub verification_problem: Option<String>,
}

/// The host's answer to a [`Notification::CertificatePrompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateTrustReply {
    /// Trust this certificate for this connection only.
    TrustOnce,
    /// Trust this certificate and remember the decision (persistence is a
    /// host concern; the core only receives the verdict).
    TrustAlways,
    /// Reject the certificate; the connection will be closed.
    Reject,
}

/// Why the host is being asked whether to overwrite/resume/skip a local
/// file before a transfer proceeds (§4.5).
#[derive(Debug, Clone)]
pub struct FileExistsInfo {
    /// Local file path.
    pub local_path: std::path::PathBuf,
    /// Local file size, if it exists.
    pub local_size: Option<u64>,
    /// Remote file size, if known.
    pub remote_size: Option<u64>,
    /// Remote modification time, if known.
    pub remote_mtime: Option<chrono::DateTime<chrono::Utc>>,
}

/// The host's answer to a [`Notification::FileExistsPrompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileExistsReply {
    /// Overwrite the local/remote file.
    Overwrite,
    /// Resume the transfer at the existing file's size.
    Resume,
    /// Skip this file.
    Skip,
}

/// Live transfer progress, emitted periodically while a `RawTransfer` is
/// in flight.
#[derive(Debug, Clone, Copy)]
pub struct TransferStatus {
    /// Bytes transferred so far this operation.
    pub bytes_transferred: u64,
    /// Total expected bytes, if known.
    pub bytes_total: Option<u64>,
    /// Instantaneous transfer rate in bytes/second.
    pub bytes_per_second: f64,
}

/// Every event the engine can deliver to the host (§4.1).
#[derive(Debug, Clone)]
pub enum Notification {
    /// A log line in one of the stable categories (§7).
    Log {
        /// The category, for host-side filtering/formatting.
        category: MessageCategory,
        /// The message text (already assembled; never re-localized by the
        /// core).
        text: String,
    },
    /// The connection's overall status changed.
    StatusChanged(ConnectionStatus),
    /// A directory listing was refreshed or invalidated.
    DirectoryListingChanged {
        /// The path whose listing changed.
        path: ServerPath,
        /// The refreshed listing, if this notification carries one rather
        /// than announcing an invalidation.
        listing: Option<DirectoryListing>,
    },
    /// The host must decide whether to overwrite, resume, or skip before a
    /// transfer proceeds.
    FileExistsPrompt(FileExistsInfo),
    /// The server issued an interactive login challenge (`LogonType::Interactive`)
    /// that needs a host-supplied reply.
    InteractiveLoginPrompt {
        /// The server's challenge text.
        challenge: String,
    },
    /// A server certificate needs a trust decision.
    CertificatePrompt(CertificateInfo),
    /// Live transfer progress.
    TransferStatus(TransferStatus),
    /// An operation finished; carries its final [`OpStatus`].
    OperationCompleted {
        /// Which operation completed, by name, for host-side correlation.
        operation: &'static str,
        /// The final status.
        status: OpStatus,
    },
}

/// Metadata identifying which connection/session a [`Notification`]
/// pertains to, mirroring the teacher's `EventMeta` (username, trace id,
/// sequence number) generalized from "authenticated server session" to
/// "one control connection".
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// The server this connection is talking to, by display name or host.
    pub server_label: String,
    /// Per-connection trace id for log correlation (§10.1).
    pub trace_id: String,
    /// Monotonically increasing per-connection sequence number.
    pub sequence_number: u64,
}

/// Receives [`Notification`]s from one [`crate::control::ControlSocket`].
/// Implementations can be passed to connect to observe everything the core
/// reports back (§4.1).
#[async_trait]
pub trait NotificationListener: Sync + Send + Debug {
    /// Called for every notification the engine emits, in order.
    async fn receive(&self, event: Notification, meta: EventMeta);
}

#[async_trait]
impl NotificationListener for Box<dyn NotificationListener> {
    async fn receive(&self, event: Notification, meta: EventMeta) {
        self.as_ref().receive(event, meta).await
    }
}

#[async_trait]
impl NotificationListener for Arc<dyn NotificationListener> {
    async fn receive(&self, event: Notification, meta: EventMeta) {
        self.as_ref().receive(event, meta).await
    }
}
