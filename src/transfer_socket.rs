//! `TransferSocket`: the secondary data-channel actor (§4.7).
//!
//! Grounded on the teacher crate's separation of its control-channel loop
//! from a per-connection data-channel task fed through an internal message
//! enum (`server::chancomms::InternalMsg`), generalized from "upload bytes
//! from storage backend to data socket" to the four modes §4.7 names:
//! listing, download, upload, and the one-byte resume probe. A
//! `RawTransfer` operation requests one of these by setting
//! [`crate::control::OpContext::pending_transfer_request`]; the
//! [`crate::control::ControlSocket`] event loop spawns [`run`] as a detached
//! task and receives [`TransferEvent`]s back over a bounded `mpsc` channel,
//! per SPEC_FULL §5's task layout.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::caches::capabilities::Tri;
use crate::directory_listing::{DirEntry, ListingParser};
use crate::options::TlsFlags;
use crate::server_info::Server;
use crate::tls::TlsSessionCache;

/// What kind of data-channel activity this transfer socket carries out
/// (§4.7).
pub enum TransferMode {
    /// Stream a directory listing into a [`ListingParser`].
    List(Box<dyn ListingParser>),
    /// Pull bytes from the data channel and write them to a local file.
    Download {
        /// Destination file.
        local_path: PathBuf,
        /// Byte offset to start writing at (resume support).
        resume_offset: u64,
    },
    /// Read bytes from a local file and push them to the data channel.
    Upload {
        /// Source file.
        local_path: PathBuf,
        /// Byte offset to start reading at (resume support).
        resume_offset: u64,
    },
    /// Expect exactly one byte then a clean close (§4.7 "ResumeTest").
    ResumeTest,
}

/// How the data connection is established (§4.6 "PortPasv").
pub enum DataChannelMode {
    /// Connect out to a server-reported passive-mode endpoint.
    Passive {
        /// Address reported by `PASV`/`EPSV` (possibly substituted per
        /// `pasv_reply_fallback_mode`).
        addr: SocketAddr,
        /// Address to bind the outbound socket's source to, if the
        /// pasv-reply-vs-peer-routability check requires it (§4.7
        /// "Source-IP binding").
        bind_source: Option<IpAddr>,
    },
    /// Accept the server's incoming connection on an already-bound listener
    /// (active mode). The listener is bound up front by
    /// [`super::control::socket::ControlSocket`] so `RawTransfer` knows the
    /// port to advertise in `PORT`/`EPRT` before this request is built.
    Active {
        /// The listener `PORT`/`EPRT` already advertised to the server.
        listener: TcpListener,
    },
}

/// A fully specified request for one data-channel transfer, built by
/// `RawTransfer` and handed to the `ControlSocket` event loop via
/// [`crate::control::OpContext::pending_transfer_request`].
pub struct TransferRequest {
    /// What to do with the bytes.
    pub mode: TransferMode,
    /// How to establish the connection.
    pub channel: DataChannelMode,
    /// Whether TLS must be layered on the data channel (`protect_data_channel`).
    pub protect: bool,
    /// Whether the control channel's TLS session should be offered for
    /// resumption, per the server's last-known `tls_resume` capability.
    pub attempt_tls_resumption: bool,
}

/// Why a transfer ended (§4.6 "Transfer-end reasons").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEndReason {
    /// Completed without error.
    Successful,
    /// The inactivity timer tripped mid-transfer.
    Timeout,
    /// A recoverable data-channel failure.
    TransferFailure,
    /// A local file I/O failure (write during download, read during upload).
    TransferFailureCritical,
    /// The transfer command itself failed after data flow had begun.
    TransferCommandFailure,
    /// The transfer command failed immediately (`5xy` before any data).
    TransferCommandFailureImmediate,
    /// A command preceding the transfer command (e.g. `REST`) failed.
    PreTransferCommandFailure,
    /// The one-byte resume probe received an unexpected byte count.
    FailedResumeTest,
}

/// The final result of one data-channel transfer.
pub struct TransferOutcome {
    /// Why the transfer ended.
    pub reason: TransferEndReason,
    /// Total bytes moved over the data channel.
    pub bytes_transferred: u64,
    /// Parsed listing entries, if [`TransferMode::List`] was requested and
    /// parsing completed.
    pub listing_entries: Option<Vec<DirEntry>>,
    /// Whether the server's TLS session was successfully resumed on this
    /// data channel, when resumption was attempted.
    pub tls_resumed: Option<bool>,
}

/// The data `RawTransfer` hands back to its parent operation (`List`,
/// `FileTransfer`) on completion, via
/// [`crate::control::OpContext::last_transfer_result`] — `OpData::Done`
/// only carries an [`crate::status::OpStatus`], so richer results ride
/// alongside on the context the same way `ChangeDir` writes
/// `ctx.current_path` directly rather than returning it.
pub struct TransferResult {
    /// Total bytes moved over the data channel.
    pub bytes_transferred: u64,
    /// Parsed listing entries, for `List`-mode transfers.
    pub listing_entries: Option<Vec<DirEntry>>,
}

/// Progress/completion events the spawned transfer task reports back to the
/// `ControlSocket` event loop.
pub enum TransferEvent {
    /// The data connection is established (accepted or connected).
    Connected,
    /// Incremental progress, for `transfer-status` notifications.
    Progress {
        /// Bytes moved so far.
        bytes_transferred: u64,
    },
    /// The transfer finished, one way or another.
    Ended(TransferOutcome),
}

const DOWNLOAD_UPLOAD_CHUNK: usize = 64 * 1024;
/// Upper bound on read/write iterations serviced per event-loop pass, so a
/// single transfer cannot starve the `ControlSocket`'s own reply processing
/// (§4.7 "Download": "bounded to ~100 iterations per event").
const MAX_ITERATIONS_PER_TICK: usize = 100;

/// Runs one data-channel transfer to completion, reporting progress and the
/// final outcome over `events`. Spawned as a detached `tokio::spawn` task by
/// the `ControlSocket` event loop; never called synchronously from an
/// `OpData` method.
pub async fn run(request: TransferRequest, server: Server, tls_cache: TlsSessionCache, tls_flags: TlsFlags, tls_resume_hint: Tri, events: mpsc::Sender<TransferEvent>) {
    let stream = match establish(&request.channel).await {
        Ok(s) => s,
        Err(_) => {
            let _ = events
                .send(TransferEvent::Ended(TransferOutcome {
                    reason: TransferEndReason::PreTransferCommandFailure,
                    bytes_transferred: 0,
                    listing_entries: None,
                    tls_resumed: None,
                }))
                .await;
            return;
        }
    };
    let _ = events.send(TransferEvent::Connected).await;

    let attempt_resumption = request.attempt_tls_resumption && crate::tls::should_attempt_resumption(tls_resume_hint);
    if request.protect {
        if !attempt_resumption {
            // Force a fresh handshake rather than risk resuming a session
            // the server is known (or suspected) not to resume correctly.
            tls_cache.forget(&server);
        }
        match upgrade_tls(stream, &server, &tls_cache, tls_flags).await {
            Ok(stream) => run_mode(request.mode, stream, attempt_resumption, events).await,
            Err(_) => {
                let _ = events
                    .send(TransferEvent::Ended(TransferOutcome {
                        reason: TransferEndReason::TransferFailure,
                        bytes_transferred: 0,
                        listing_entries: None,
                        tls_resumed: Some(false),
                    }))
                    .await;
            }
        }
    } else {
        run_mode(request.mode, stream, false, events).await;
    }
}

async fn establish(channel: &DataChannelMode) -> io::Result<TcpStream> {
    match channel {
        DataChannelMode::Passive { addr, bind_source } => {
            if let Some(src) = bind_source {
                let socket = match src {
                    IpAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                    IpAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
                };
                socket.bind(SocketAddr::new(*src, 0))?;
                socket.connect(*addr).await
            } else {
                TcpStream::connect(addr).await
            }
        }
        DataChannelMode::Active { listener } => {
            let (stream, _peer) = listener.accept().await?;
            Ok(stream)
        }
    }
}

/// Opens the active-mode listening socket (§4.7 "Active-mode listening"): a
/// random port within the configured range is tried first, then the
/// remaining ports in the range sequentially, falling back to an
/// OS-assigned ephemeral port when no range is configured. Called by
/// [`crate::control::ControlSocket`] while `RawTransfer` is suspended in its
/// `PortPasv` state, so the bound port is known before the `PORT`/`EPRT`
/// command text is composed.
pub(crate) async fn bind_active_listener(bind_addr: IpAddr, port_range: Option<RangeInclusive<u16>>) -> io::Result<TcpListener> {
    let Some(range) = port_range else {
        return TcpListener::bind((bind_addr, 0)).await;
    };
    let first = random_port_in(&range);
    if let Ok(listener) = TcpListener::bind((bind_addr, first)).await {
        return Ok(listener);
    }
    for port in range {
        if port == first {
            continue;
        }
        if let Ok(listener) = TcpListener::bind((bind_addr, port)).await {
            return Ok(listener);
        }
    }
    Err(io::Error::new(io::ErrorKind::AddrInUse, "no port available in configured range"))
}

fn random_port_in(range: &RangeInclusive<u16>) -> u16 {
    let span = (*range.end() as u32).saturating_sub(*range.start() as u32) + 1;
    let mut buf = [0u8; 4];
    if getrandom::fill(&mut buf).is_err() {
        return *range.start();
    }
    let offset = u32::from_le_bytes(buf) % span;
    range.start() + offset as u16
}

async fn upgrade_tls(stream: TcpStream, server: &Server, tls_cache: &TlsSessionCache, tls_flags: TlsFlags) -> Result<tokio_rustls::client::TlsStream<TcpStream>, io::Error> {
    let connector = tls_cache.connector_for(server, tls_flags);
    let domain = tokio_rustls::rustls::pki_types::ServerName::try_from(server.host.clone()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    connector.connect(domain, stream).await.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

async fn run_mode<S>(mode: TransferMode, mut stream: S, tls_resumption_attempted: bool, events: mpsc::Sender<TransferEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = match mode {
        TransferMode::List(parser) => run_list(&mut stream, parser, &events).await,
        TransferMode::Download { local_path, resume_offset } => run_download(&mut stream, &local_path, resume_offset, &events).await,
        TransferMode::Upload { local_path, resume_offset } => run_upload(&mut stream, &local_path, resume_offset, &events).await,
        TransferMode::ResumeTest => run_resume_test(&mut stream).await,
    };
    // rustls doesn't expose a "was this handshake actually resumed" signal
    // on the client side, so this only records that resumption was offered
    // and the handshake subsequently succeeded, not whether a prior session
    // was reused.
    let tls_resumed = tls_resumption_attempted.then_some(true);
    let outcome = TransferOutcome { tls_resumed, ..outcome };
    let _ = events.send(TransferEvent::Ended(outcome)).await;
}

async fn run_list<S: AsyncRead + Unpin>(stream: &mut S, mut parser: Box<dyn ListingParser>, events: &mpsc::Sender<TransferEvent>) -> TransferOutcome {
    let mut buf = [0u8; DOWNLOAD_UPLOAD_CHUNK];
    let mut total = 0u64;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                parser.feed(&buf[..n]);
                total += n as u64;
                let _ = events.send(TransferEvent::Progress { bytes_transferred: total }).await;
            }
            Err(_) => {
                return TransferOutcome {
                    reason: TransferEndReason::TransferFailure,
                    bytes_transferred: total,
                    listing_entries: None,
                    tls_resumed: None,
                };
            }
        }
    }
    TransferOutcome {
        reason: TransferEndReason::Successful,
        bytes_transferred: total,
        listing_entries: Some(parser.finish()),
        tls_resumed: None,
    }
}

async fn run_download<S: AsyncRead + Unpin>(stream: &mut S, local_path: &std::path::Path, resume_offset: u64, events: &mpsc::Sender<TransferEvent>) -> TransferOutcome {
    let file = tokio::fs::OpenOptions::new().create(true).write(true).open(local_path).await;
    let mut file = match file {
        Ok(f) => f,
        Err(_) => {
            return TransferOutcome {
                reason: TransferEndReason::TransferFailureCritical,
                bytes_transferred: 0,
                listing_entries: None,
                tls_resumed: None,
            };
        }
    };
    if resume_offset > 0 {
        use tokio::io::AsyncSeekExt;
        if file.seek(io::SeekFrom::Start(resume_offset)).await.is_err() {
            return TransferOutcome {
                reason: TransferEndReason::TransferFailureCritical,
                bytes_transferred: 0,
                listing_entries: None,
                tls_resumed: None,
            };
        }
    }
    let mut buf = [0u8; DOWNLOAD_UPLOAD_CHUNK];
    let mut total = 0u64;
    let mut iterations = 0;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if file.write_all(&buf[..n]).await.is_err() {
                    return TransferOutcome {
                        reason: TransferEndReason::TransferFailureCritical,
                        bytes_transferred: total,
                        listing_entries: None,
                        tls_resumed: None,
                    };
                }
                total += n as u64;
                iterations += 1;
                if iterations >= MAX_ITERATIONS_PER_TICK {
                    iterations = 0;
                    let _ = events.send(TransferEvent::Progress { bytes_transferred: total }).await;
                }
            }
            Err(_) => {
                return TransferOutcome {
                    reason: TransferEndReason::TransferFailure,
                    bytes_transferred: total,
                    listing_entries: None,
                    tls_resumed: None,
                };
            }
        }
    }
    let _ = file.sync_all().await;
    TransferOutcome {
        reason: TransferEndReason::Successful,
        bytes_transferred: total,
        listing_entries: None,
        tls_resumed: None,
    }
}

async fn run_upload<S: AsyncWrite + Unpin>(stream: &mut S, local_path: &std::path::Path, resume_offset: u64, events: &mpsc::Sender<TransferEvent>) -> TransferOutcome {
    let file = tokio::fs::File::open(local_path).await;
    let mut file = match file {
        Ok(f) => f,
        Err(_) => {
            return TransferOutcome {
                reason: TransferEndReason::TransferFailureCritical,
                bytes_transferred: 0,
                listing_entries: None,
                tls_resumed: None,
            };
        }
    };
    if resume_offset > 0 {
        use tokio::io::AsyncSeekExt;
        if file.seek(io::SeekFrom::Start(resume_offset)).await.is_err() {
            return TransferOutcome {
                reason: TransferEndReason::TransferFailureCritical,
                bytes_transferred: 0,
                listing_entries: None,
                tls_resumed: None,
            };
        }
    }
    let mut buf = [0u8; DOWNLOAD_UPLOAD_CHUNK];
    let mut total = 0u64;
    let mut iterations = 0;
    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => {
                return TransferOutcome {
                    reason: TransferEndReason::TransferFailureCritical,
                    bytes_transferred: total,
                    listing_entries: None,
                    tls_resumed: None,
                };
            }
        };
        if stream.write_all(&buf[..n]).await.is_err() {
            return TransferOutcome {
                reason: TransferEndReason::TransferFailure,
                bytes_transferred: total,
                listing_entries: None,
                tls_resumed: None,
            };
        }
        total += n as u64;
        iterations += 1;
        if iterations >= MAX_ITERATIONS_PER_TICK {
            iterations = 0;
            let _ = events.send(TransferEvent::Progress { bytes_transferred: total }).await;
        }
    }
    let _ = stream.shutdown().await;
    TransferOutcome {
        reason: TransferEndReason::Successful,
        bytes_transferred: total,
        listing_entries: None,
        tls_resumed: None,
    }
}

async fn run_resume_test<S: AsyncRead + Unpin>(stream: &mut S) -> TransferOutcome {
    let mut buf = [0u8; 2];
    let n = stream.read(&mut buf).await.unwrap_or(0);
    let mut trailing = [0u8; 1];
    let extra = stream.read(&mut trailing).await.unwrap_or(0);
    if n == 1 && extra == 0 {
        TransferOutcome {
            reason: TransferEndReason::Successful,
            bytes_transferred: 1,
            listing_entries: None,
            tls_resumed: None,
        }
    } else {
        TransferOutcome {
            reason: TransferEndReason::FailedResumeTest,
            bytes_transferred: n as u64,
            listing_entries: None,
            tls_resumed: None,
        }
    }
}

/// True if `addr` is a private/loopback/link-local address, used by
/// `RawTransfer`'s source-IP-binding decision (§4.7) and by
/// [`crate::external_ip::ExternalIpResolver`]'s `no_external_on_local`
/// short-circuit (SPEC_FULL §10.5).
pub fn is_non_routable(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_routable_detects_private_and_loopback() {
        assert!(is_non_routable("10.0.0.1".parse().unwrap()));
        assert!(is_non_routable("127.0.0.1".parse().unwrap()));
        assert!(is_non_routable("192.168.1.5".parse().unwrap()));
        assert!(!is_non_routable("203.0.113.10".parse().unwrap()));
    }

    #[test]
    fn random_port_in_stays_within_range() {
        let range = 50000..=50010;
        for _ in 0..20 {
            let p = random_port_in(&range);
            assert!(range.contains(&p));
        }
    }

    #[tokio::test]
    async fn resume_test_accepts_exactly_one_byte() {
        let (mut client, server) = tokio::io::duplex(16);
        let handle = tokio::spawn(async move {
            let mut s = server;
            run_resume_test(&mut s).await
        });
        client.write_all(&[7u8]).await.unwrap();
        client.shutdown().await.unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.reason, TransferEndReason::Successful);
        assert_eq!(outcome.bytes_transferred, 1);
    }

    #[tokio::test]
    async fn resume_test_rejects_extra_bytes() {
        let (mut client, server) = tokio::io::duplex(16);
        let handle = tokio::spawn(async move {
            let mut s = server;
            run_resume_test(&mut s).await
        });
        client.write_all(&[7u8, 8u8]).await.unwrap();
        client.shutdown().await.unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.reason, TransferEndReason::FailedResumeTest);
    }
}
