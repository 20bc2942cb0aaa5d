//! Typed error hierarchy for the engine.
//!
//! Every fallible entry point returns an [`EngineError`], a thin wrapper
//! around an [`EngineErrorKind`] that optionally carries the underlying
//! cause. This mirrors the separation the teacher crate draws between its
//! outer `ControlChanError` struct (carries `#[source]`) and the
//! `Display`-derived `ControlChanErrorKind` enum naming each failure mode.

use derive_more::Display;
use std::io;

/// A boxed error used as the `source` of an [`EngineError`] when the cause
/// came from a dependency rather than from engine logic.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type returned by fallible engine operations.
#[derive(Debug, thiserror::Error)]
#[error("ftp engine error: {kind}")]
pub struct EngineError {
    kind: EngineErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl EngineError {
    /// Builds an error with no underlying cause.
    pub fn new(kind: EngineErrorKind) -> Self {
        EngineError { kind, source: None }
    }

    /// Builds an error with an underlying cause attached.
    pub fn with_source(kind: EngineErrorKind, source: impl Into<BoxError>) -> Self {
        EngineError {
            kind,
            source: Some(source.into()),
        }
    }

    /// The classification of this error.
    pub fn kind(&self) -> &EngineErrorKind {
        &self.kind
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::with_source(EngineErrorKind::Io, e)
    }
}

/// The set of ways an engine operation can fail.
#[derive(Debug, Display, Eq, PartialEq, Clone)]
pub enum EngineErrorKind {
    /// Underlying I/O failure on the control or data channel.
    #[display("i/o error")]
    Io,
    /// The server sent a reply line the engine could not parse.
    #[display("malformed reply: {_0}")]
    MalformedReply(String),
    /// A command argument could not be encoded in the negotiated charset.
    #[display("failed to encode command in negotiated charset")]
    EncodingFailure,
    /// The TLS handshake (control or data channel) failed.
    #[display("tls handshake failed")]
    TlsHandshake,
    /// The server certificate was rejected by the host.
    #[display("server certificate not trusted")]
    CertificateNotTrusted,
    /// The banner line suggests the peer is not an FTP server (e.g. SSH).
    #[display("wrong protocol: server banner does not look like FTP")]
    WrongProtocol,
    /// Authentication was rejected by the server.
    #[display("authentication failed")]
    AuthenticationFailed,
    /// An operation was cancelled by the host.
    #[display("operation canceled")]
    Canceled,
    /// The inactivity timer fired.
    #[display("connection timed out")]
    Timeout,
    /// The control connection is no longer usable.
    #[display("disconnected")]
    Disconnected,
    /// A `CWD` target turned out not to be a directory.
    #[display("not a directory")]
    LinkNotDir,
    /// Local filesystem write failed during a download.
    #[display("local write failed")]
    WriteFailed,
    /// A passive- or active-mode negotiation failed.
    #[display("data connection setup failed: {_0}")]
    DataConnectionSetup(String),
    /// An invariant the engine relies on was violated; this is a bug.
    #[display("internal error: {_0}")]
    Internal(String),
}
