//! Typed engine configuration (§6 "Configuration inputs").
//!
//! Grounded on `server::ftpserver::options` in the teacher crate: small
//! enums with `From` impls rather than a stringly-typed option bag, and a
//! builder carrying documented defaults. The teacher's surface is a
//! server-accept policy; this module is the client-dial equivalent.

use std::ops::RangeInclusive;
use std::time::Duration;

bitflags::bitflags! {
    /// Which TLS protocol versions and session-resumption mechanisms the
    /// engine will offer, generalized from the teacher's own `TlsFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlsFlags: u32 {
        /// Offer TLS 1.2.
        const V1_2 = 0b0000_0001;
        /// Offer TLS 1.3.
        const V1_3 = 0b0000_0010;
        /// Attempt session-ID based resumption on the data channel.
        const RESUMPTION_SESSION_ID = 0b0000_0100;
        /// Attempt session-ticket based resumption on the data channel.
        const RESUMPTION_TICKETS = 0b0000_1000;
        /// Convenience union of the latest version and both resumption
        /// mechanisms; the engine default.
        const LATEST_VERSIONS_AND_RESUMPTION = Self::V1_3.bits() | Self::RESUMPTION_SESSION_ID.bits() | Self::RESUMPTION_TICKETS.bits();
    }
}

impl Default for TlsFlags {
    fn default() -> Self {
        TlsFlags::LATEST_VERSIONS_AND_RESUMPTION
    }
}

/// Whether the engine insists on TLS for a given server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FtpsRequired {
    /// Refuse to connect at all without successful TLS negotiation.
    Required,
    /// Require TLS only for non-anonymous accounts.
    #[default]
    Accounts,
    /// Accept a plaintext connection if TLS negotiation fails.
    None,
}

impl From<bool> for FtpsRequired {
    fn from(required: bool) -> Self {
        if required {
            FtpsRequired::Required
        } else {
            FtpsRequired::None
        }
    }
}

/// `pasv_reply_fallback_mode` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasvReplyFallbackMode {
    /// Use the server-reported address as-is, even if unroutable.
    #[default]
    UseAsIs,
    /// Fail the passive attempt outright if the reported address is
    /// unroutable relative to the control peer.
    FailOnUnroutable,
    /// Always substitute the control connection's peer address.
    AlwaysUsePeer,
}

impl From<u8> for PasvReplyFallbackMode {
    fn from(v: u8) -> Self {
        match v {
            1 => PasvReplyFallbackMode::FailOnUnroutable,
            2 => PasvReplyFallbackMode::AlwaysUsePeer,
            _ => PasvReplyFallbackMode::UseAsIs,
        }
    }
}

/// `external_ip_mode` (§6).
#[derive(Debug, Clone, Default)]
pub enum ExternalIpMode {
    /// Do not attempt external IP discovery; use the local interface
    /// address for `PORT`/`EPRT`.
    #[default]
    None,
    /// Use a configured literal address.
    Literal(std::net::IpAddr),
    /// Resolve via an HTTP GET to a configured URL.
    Resolver(String),
}

/// Full set of engine-recognized configuration options (§6), with the
/// defaults the original engine ships.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// `tcp_keepalive_interval_minutes`: `None` disables `SO_KEEPALIVE`.
    pub tcp_keepalive_interval: Option<Duration>,
    /// `use_passive`: default transfer mode when the server has no
    /// per-connection preference.
    pub use_passive: bool,
    /// `allow_transfer_mode_fallback`.
    pub allow_transfer_mode_fallback: bool,
    /// `pasv_reply_fallback_mode`.
    pub pasv_reply_fallback_mode: PasvReplyFallbackMode,
    /// `external_ip_mode` / `external_ip` / `external_ip_resolver_url`.
    pub external_ip_mode: ExternalIpMode,
    /// `no_external_on_local`.
    pub no_external_on_local: bool,
    /// `limit_ports`: `None` disables port-range limiting for active mode.
    pub limit_ports: Option<RangeInclusive<u16>>,
    /// `limit_ports_offset`.
    pub limit_ports_offset: i32,
    /// `ftp_send_keepalive`.
    pub ftp_send_keepalive: bool,
    /// `socket_buffer_recv` in bytes, `None` leaves the OS default.
    pub socket_buffer_recv: Option<u32>,
    /// `socket_buffer_send` in bytes, `None` leaves the OS default.
    pub socket_buffer_send: Option<u32>,
    /// TLS policy for servers that declare `FTPS`/`FTPES`.
    pub ftps_required: FtpsRequired,
    /// TLS protocol/resumption flags.
    pub tls_flags: TlsFlags,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            tcp_keepalive_interval: None,
            use_passive: true,
            allow_transfer_mode_fallback: true,
            pasv_reply_fallback_mode: PasvReplyFallbackMode::default(),
            external_ip_mode: ExternalIpMode::default(),
            no_external_on_local: true,
            limit_ports: None,
            limit_ports_offset: 0,
            ftp_send_keepalive: true,
            socket_buffer_recv: None,
            socket_buffer_send: None,
            ftps_required: FtpsRequired::default(),
            tls_flags: TlsFlags::default(),
        }
    }
}

impl EngineOptions {
    /// Starts a builder at engine defaults.
    pub fn builder() -> EngineOptionsBuilder {
        EngineOptionsBuilder(EngineOptions::default())
    }
}

/// Fluent builder for [`EngineOptions`].
#[derive(Debug, Clone, Default)]
pub struct EngineOptionsBuilder(EngineOptions);

impl EngineOptionsBuilder {
    /// Sets `tcp_keepalive_interval_minutes`.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.0.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Sets `use_passive`.
    pub fn use_passive(mut self, passive: bool) -> Self {
        self.0.use_passive = passive;
        self
    }

    /// Sets `allow_transfer_mode_fallback`.
    pub fn allow_transfer_mode_fallback(mut self, allow: bool) -> Self {
        self.0.allow_transfer_mode_fallback = allow;
        self
    }

    /// Sets `pasv_reply_fallback_mode`.
    pub fn pasv_reply_fallback_mode(mut self, mode: PasvReplyFallbackMode) -> Self {
        self.0.pasv_reply_fallback_mode = mode;
        self
    }

    /// Sets the external IP discovery mode.
    pub fn external_ip_mode(mut self, mode: ExternalIpMode) -> Self {
        self.0.external_ip_mode = mode;
        self
    }

    /// Sets `no_external_on_local`.
    pub fn no_external_on_local(mut self, skip: bool) -> Self {
        self.0.no_external_on_local = skip;
        self
    }

    /// Sets `limit_ports_low..=limit_ports_high`.
    pub fn limit_ports(mut self, range: RangeInclusive<u16>) -> Self {
        self.0.limit_ports = Some(range);
        self
    }

    /// Sets `limit_ports_offset`.
    pub fn limit_ports_offset(mut self, offset: i32) -> Self {
        self.0.limit_ports_offset = offset;
        self
    }

    /// Sets `ftp_send_keepalive`.
    pub fn ftp_send_keepalive(mut self, enabled: bool) -> Self {
        self.0.ftp_send_keepalive = enabled;
        self
    }

    /// Sets `ftps_required`.
    pub fn ftps_required(mut self, required: FtpsRequired) -> Self {
        self.0.ftps_required = required;
        self
    }

    /// Sets `tls_flags`.
    pub fn tls_flags(mut self, flags: TlsFlags) -> Self {
        self.0.tls_flags = flags;
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> EngineOptions {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let o = EngineOptions::default();
        assert!(o.use_passive);
        assert!(o.allow_transfer_mode_fallback);
        assert_eq!(o.pasv_reply_fallback_mode, PasvReplyFallbackMode::UseAsIs);
        assert!(o.ftp_send_keepalive);
    }

    #[test]
    fn builder_overrides_defaults() {
        let o = EngineOptions::builder()
            .use_passive(false)
            .pasv_reply_fallback_mode(PasvReplyFallbackMode::AlwaysUsePeer)
            .limit_ports(50000..=50100)
            .build();
        assert!(!o.use_passive);
        assert_eq!(o.pasv_reply_fallback_mode, PasvReplyFallbackMode::AlwaysUsePeer);
        assert_eq!(o.limit_ports, Some(50000..=50100));
    }

    #[test]
    fn ftps_required_from_bool() {
        assert_eq!(FtpsRequired::from(true), FtpsRequired::Required);
        assert_eq!(FtpsRequired::from(false), FtpsRequired::None);
    }
}
