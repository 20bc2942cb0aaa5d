//! The `RawTransfer` operation (§4.6), grounded on `CFtpRawTransferOpData`
//! (`rawtransfer.cpp`): negotiates `TYPE`, the data channel (`PASV`/`EPSV` or
//! `PORT`/`EPRT`), an optional `REST`, then the transfer command itself, and
//! reconciles the control-channel reply against the asynchronous outcome of
//! the spawned [`crate::transfer_socket`] task.
//!
//! `List`, `FileTransfer`, and the resume-test probe all push this as a child
//! rather than driving a data channel themselves, the same way every
//! directory operation pushes [`super::change_dir::ChangeDirOp`].

use std::net::{IpAddr, SocketAddr};

use crate::caches::capabilities::Tri;
use crate::control::context::ListenerBindRequest;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::options::PasvReplyFallbackMode;
use crate::reply::Reply;
use crate::status::OpStatus;
use crate::transfer_socket::{DataChannelMode, TransferEndReason, TransferMode, TransferRequest, TransferResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Type,
    PortPasv,
    Rest,
    TransferCmd,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortPasvPhase {
    SendPasvOrEpsv,
    WaitPasvEpsvReply,
    ResolveExternalIp,
    BindListener,
    SendPortCmd,
    WaitPortReply,
}

/// Negotiates the data channel and drives a single transfer command
/// (`RETR`/`STOR`/`STOU`/`LIST`/`NLST`/`MLSD`) to completion.
pub struct RawTransferOp {
    state: State,
    binary: bool,
    command: String,
    resume_offset: u64,
    mode: Option<TransferMode>,

    use_passive: bool,
    mode_fallback_tried: bool,
    epsv_tried: bool,
    port_pasv_phase: PortPasvPhase,
    epsv_in_flight: bool,
    listener_bind_addr: Option<IpAddr>,
    bound_listener: Option<tokio::net::TcpListener>,
    advertised_port: u16,
    data_channel: Option<DataChannelMode>,

    socket_requested: bool,
    got_preliminary: bool,
    final_class: Option<u8>,
    transfer_end: Option<TransferEndReason>,
    bytes_transferred: u64,
    listing_entries: Option<Vec<crate::directory_listing::DirEntry>>,
}

impl RawTransferOp {
    /// Builds a `RawTransfer` targeting `command` (e.g. `"RETR foo"`),
    /// carrying out `mode` over whichever data channel PortPasv negotiates.
    /// `binary` selects `TYPE I` vs `TYPE A`; `resume_offset` issues `REST`
    /// first when nonzero.
    pub fn new(command: impl Into<String>, mode: TransferMode, binary: bool, resume_offset: u64) -> Self {
        RawTransferOp {
            state: State::Init,
            binary,
            command: command.into(),
            resume_offset,
            mode: Some(mode),
            use_passive: true,
            mode_fallback_tried: false,
            epsv_tried: false,
            port_pasv_phase: PortPasvPhase::SendPasvOrEpsv,
            epsv_in_flight: false,
            listener_bind_addr: None,
            bound_listener: None,
            advertised_port: 0,
            data_channel: None,
            socket_requested: false,
            got_preliminary: false,
            final_class: None,
            transfer_end: None,
            bytes_transferred: 0,
            listing_entries: None,
        }
    }

    fn finish_if_ready(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match (self.final_class, self.transfer_end) {
            (Some(class), Some(reason)) => {
                ctx.last_transfer_result = Some(TransferResult {
                    bytes_transferred: self.bytes_transferred,
                    listing_entries: self.listing_entries.take(),
                });
                OpOutcome::Done(compute_status(class, reason))
            }
            _ => OpOutcome::Continue,
        }
    }

    fn send_port_pasv(&mut self, ctx: &mut OpContext) -> OpOutcome {
        if self.use_passive {
            self.send_passive(ctx)
        } else {
            self.send_active(ctx)
        }
    }

    fn send_passive(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.port_pasv_phase {
            PortPasvPhase::SendPasvOrEpsv => {
                self.port_pasv_phase = PortPasvPhase::WaitPasvEpsvReply;
                let peer_is_v6 = matches!(ctx.control_peer_addr, Some(SocketAddr::V6(_)));
                let epsv_preferred = peer_is_v6 || ctx.shared.capabilities.snapshot(&ctx.server).epsv.is_yes();
                self.epsv_in_flight = !self.epsv_tried && epsv_preferred;
                if self.epsv_in_flight {
                    OpOutcome::SendCommand("EPSV".to_string())
                } else {
                    OpOutcome::SendCommand("PASV".to_string())
                }
            }
            _ => OpOutcome::Suspend,
        }
    }

    fn send_active(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.port_pasv_phase {
            PortPasvPhase::ResolveExternalIp => {
                if let Some(resolved) = ctx.external_ip_result.take() {
                    self.listener_bind_addr = Some(match resolved {
                        crate::external_ip::ResolvedAddress::Use(ip) => ip,
                        crate::external_ip::ResolvedAddress::UseLocal => {
                            ctx.control_local_addr.map(|a| a.ip()).unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
                        }
                    });
                    self.port_pasv_phase = PortPasvPhase::BindListener;
                    OpOutcome::Continue
                } else {
                    ctx.pending_external_ip = true;
                    OpOutcome::Suspend
                }
            }
            PortPasvPhase::BindListener => {
                if let Some((listener, port)) = ctx.bound_listener.take() {
                    self.bound_listener = Some(listener);
                    self.advertised_port = port;
                    self.port_pasv_phase = PortPasvPhase::SendPortCmd;
                    OpOutcome::Continue
                } else {
                    let bind_addr = self.listener_bind_addr.expect("ResolveExternalIp ran before BindListener");
                    ctx.pending_listener_bind = Some(ListenerBindRequest {
                        bind_addr,
                        port_range: ctx.options.limit_ports.clone(),
                    });
                    OpOutcome::Suspend
                }
            }
            PortPasvPhase::SendPortCmd => {
                let bind_addr = self.listener_bind_addr.expect("SendPortCmd implies a bind address");
                self.port_pasv_phase = PortPasvPhase::WaitPortReply;
                OpOutcome::SendCommand(format_port_command(bind_addr, self.advertised_port))
            }
            _ => OpOutcome::Suspend,
        }
    }
}

impl OpData for RawTransferOp {
    fn name(&self) -> &'static str {
        "raw_transfer"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Init => {
                self.use_passive = ctx.options.use_passive;
                if ctx.last_type_binary == self.binary {
                    self.state = State::PortPasv;
                    return OpOutcome::Continue;
                }
                self.state = State::Type;
                OpOutcome::SendCommand(format!("TYPE {}", if self.binary { "I" } else { "A" }))
            }
            State::Type => OpOutcome::Suspend,
            State::PortPasv => {
                if self.port_pasv_phase == PortPasvPhase::SendPasvOrEpsv && !self.use_passive {
                    self.port_pasv_phase = PortPasvPhase::ResolveExternalIp;
                }
                self.send_port_pasv(ctx)
            }
            State::Rest => OpOutcome::SendCommand(format!("REST {}", self.resume_offset)),
            State::TransferCmd => {
                if !self.socket_requested {
                    let channel = self.data_channel.take().expect("TransferCmd implies a negotiated data channel");
                    let mode = self.mode.take().expect("TransferCmd implies a transfer mode");
                    ctx.pending_transfer_request = Some(TransferRequest {
                        mode,
                        channel,
                        protect: ctx.protect_data_channel,
                        attempt_tls_resumption: ctx.protect_data_channel,
                    });
                    self.socket_requested = true;
                    return OpOutcome::Suspend;
                }
                self.state = State::Waiting;
                OpOutcome::SendCommand(self.command.clone())
            }
            State::Waiting => {
                if self.transfer_end.is_none() {
                    if let Some(outcome) = ctx.transfer_outcome.take() {
                        self.transfer_end = Some(outcome.reason);
                        self.bytes_transferred = outcome.bytes_transferred;
                        self.listing_entries = outcome.listing_entries;
                        if let Some(resumed) = outcome.tls_resumed {
                            ctx.shared.capabilities.with(&ctx.server, |c| {
                                c.tls_resume = if resumed { Tri::Yes } else { Tri::No };
                            });
                        }
                        return self.finish_if_ready(ctx);
                    }
                }
                OpOutcome::Suspend
            }
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        match self.state {
            State::Type => {
                if reply.class() == 2 {
                    ctx.last_type_binary = self.binary;
                    self.state = State::PortPasv;
                    OpOutcome::Continue
                } else {
                    OpOutcome::Done(OpStatus::ERROR)
                }
            }
            State::PortPasv => self.parse_port_pasv_reply(ctx, reply),
            State::Rest => {
                if matches!(reply.class(), 2 | 3) {
                    self.state = State::TransferCmd;
                    OpOutcome::Continue
                } else {
                    OpOutcome::Done(OpStatus::ERROR)
                }
            }
            State::Waiting => {
                if reply.is_preliminary() {
                    self.got_preliminary = true;
                    return OpOutcome::Continue;
                }
                if matches!(reply.class(), 4 | 5) && !self.got_preliminary {
                    // Server rejected the transfer command before any data
                    // flowed; don't wait for the spawned transfer task (it
                    // will fail or time out on its own and its eventual
                    // TransferEnd is dropped once this op has been popped).
                    return OpOutcome::Done(OpStatus::ERROR);
                }
                self.final_class = Some(reply.class());
                self.finish_if_ready(ctx)
            }
            State::Init | State::TransferCmd => OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL),
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        OpOutcome::Done(result)
    }
}

impl RawTransferOp {
    fn parse_port_pasv_reply(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        if self.use_passive {
            self.parse_passive_reply(ctx, reply)
        } else {
            self.parse_active_reply(ctx, reply)
        }
    }

    fn parse_passive_reply(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        if reply.class() != 2 {
            if self.epsv_in_flight {
                // Many servers that lack EPSV answer with a 5xx; fall back
                // to PASV once before giving up on passive mode entirely.
                self.epsv_tried = true;
                self.port_pasv_phase = PortPasvPhase::SendPasvOrEpsv;
                return OpOutcome::Continue;
            }
            return self.try_mode_fallback(ctx);
        }

        let peer_ip = ctx.control_peer_addr.map(|a| a.ip());
        let addr = if self.epsv_in_flight {
            let Some(port) = parse_epsv_port(reply.full_text().as_str()) else {
                return OpOutcome::Done(OpStatus::ERROR);
            };
            let Some(ip) = peer_ip else {
                return OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL);
            };
            SocketAddr::new(ip, port)
        } else {
            let Some(mut addr) = parse_pasv_reply(reply.full_text().as_str()) else {
                return OpOutcome::Done(OpStatus::ERROR);
            };
            if let Some(peer_ip) = peer_ip {
                if crate::transfer_socket::is_non_routable(addr.ip()) && addr.ip() != peer_ip {
                    match ctx.options.pasv_reply_fallback_mode {
                        PasvReplyFallbackMode::UseAsIs => {}
                        PasvReplyFallbackMode::AlwaysUsePeer => addr.set_ip(peer_ip),
                        PasvReplyFallbackMode::FailOnUnroutable => return OpOutcome::Done(OpStatus::ERROR),
                    }
                }
            }
            addr
        };

        let bind_source = match (ctx.control_peer_addr.map(|a| a.ip()), ctx.control_local_addr.map(|a| a.ip())) {
            (Some(peer), Some(local)) if peer == addr.ip() => Some(local),
            _ => None,
        };
        self.data_channel = Some(DataChannelMode::Passive { addr, bind_source });
        self.advance_past_port_pasv()
    }

    fn parse_active_reply(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        if reply.class() == 2 {
            let listener = self.bound_listener.take().expect("active PORT/EPRT reply implies a bound listener");
            self.data_channel = Some(DataChannelMode::Active { listener });
            return self.advance_past_port_pasv();
        }
        self.try_mode_fallback(ctx)
    }

    fn try_mode_fallback(&mut self, ctx: &mut OpContext) -> OpOutcome {
        if self.mode_fallback_tried || !ctx.options.allow_transfer_mode_fallback {
            return OpOutcome::Done(OpStatus::ERROR);
        }
        self.mode_fallback_tried = true;
        self.use_passive = !self.use_passive;
        self.bound_listener = None;
        self.port_pasv_phase = PortPasvPhase::SendPasvOrEpsv;
        OpOutcome::Continue
    }

    fn advance_past_port_pasv(&mut self) -> OpOutcome {
        self.state = if self.resume_offset > 0 { State::Rest } else { State::TransferCmd };
        OpOutcome::Continue
    }
}

fn compute_status(class: u8, reason: TransferEndReason) -> OpStatus {
    let reply_ok = matches!(class, 2 | 3);
    match reason {
        TransferEndReason::Successful if reply_ok => OpStatus::OK,
        TransferEndReason::TransferFailureCritical => OpStatus::ERROR | OpStatus::CRITICAL_ERROR | OpStatus::WRITE_FAILED,
        TransferEndReason::Timeout => OpStatus::ERROR | OpStatus::TIMEOUT,
        _ => OpStatus::ERROR,
    }
}

/// Builds the `PORT`/`EPRT` command text for `addr:port`, per §4.6 (EPRT for
/// IPv6, PORT's comma-separated octet form for IPv4).
fn format_port_command(addr: IpAddr, port: u16) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("PORT {},{},{},{},{},{}", o[0], o[1], o[2], o[3], port >> 8, port & 0xff)
        }
        IpAddr::V6(v6) => format!("EPRT |2|{v6}|{port}|"),
    }
}

/// Hand-parses a `229 Entering Extended Passive Mode (|||port|)` reply,
/// extracting the port between the last pair of `|` delimiters. Fixes the
/// original engine's `port_ = port;` self-assignment bug: the parsed value
/// is what gets assigned here.
fn parse_epsv_port(text: &str) -> Option<u16> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let inner = &text[open + 1..close];
    let port_str = inner.trim_matches('|');
    port_str.parse().ok()
}

/// Hand-parses a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv_reply(text: &str) -> Option<SocketAddr> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let inner = &text[open + 1..close];
    let parts: Vec<&str> = inner.split(',').map(|s| s.trim()).collect();
    if parts.len() != 6 {
        return None;
    }
    let octet = |i: usize| parts[i].parse::<u8>().ok();
    let (h1, h2, h3, h4) = (octet(0)?, octet(1)?, octet(2)?, octet(3)?);
    let p1 = parts[4].parse::<u16>().ok()?;
    let p2 = parts[5].parse::<u16>().ok()?;
    let port = p1.checked_mul(256)?.checked_add(p2)?;
    Some(SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(h1, h2, h3, h4)), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pasv_reply_address() {
        let addr = parse_pasv_reply("227 Entering Passive Mode (10,0,0,5,195,80)").unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 5)), 195 * 256 + 80));
    }

    #[test]
    fn parses_epsv_reply_port() {
        let port = parse_epsv_port("229 Entering Extended Passive Mode (|||12345|)").unwrap();
        assert_eq!(port, 12345);
    }

    #[test]
    fn rejects_malformed_pasv_reply() {
        assert!(parse_pasv_reply("227 nope").is_none());
        assert!(parse_pasv_reply("227 (1,2,3,4,5)").is_none());
    }

    #[test]
    fn formats_port_and_eprt_commands() {
        assert_eq!(format_port_command(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 5)), 1234), "PORT 10,0,0,5,4,210");
        assert_eq!(format_port_command(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), 1234), "EPRT |2|::1|1234|");
    }

    #[test]
    fn compute_status_maps_success_and_failure() {
        assert!(compute_status(2, TransferEndReason::Successful).is_ok());
        assert!(compute_status(5, TransferEndReason::TransferFailure).is_error());
        assert!(compute_status(2, TransferEndReason::TransferFailureCritical).contains(OpStatus::WRITE_FAILED));
    }
}
