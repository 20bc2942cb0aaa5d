//! The remote-endpoint identity and path model (§3): [`Server`],
//! [`Credentials`], [`ServerType`], and [`ServerPath`].

use std::fmt;

/// The wire protocol used to talk to a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain FTP, no TLS.
    Ftp,
    /// Implicit TLS: the handshake happens before any FTP traffic.
    Ftps,
    /// Explicit TLS: `AUTH TLS`/`AUTH SSL` upgrades a plaintext connection.
    Ftpes,
    /// Plain FTP, with TLS explicitly disallowed even if offered.
    InsecureFtp,
}

/// Server-type hint controlling path syntax and a handful of quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerType {
    /// Unix-style forward-slash paths; the default when unspecified.
    #[default]
    Default,
    /// Explicit Unix hint (same path style as `Default`).
    Unix,
    /// VMS bracketed path notation.
    Vms,
    /// DOS-style backslash/drive-letter paths.
    Dos,
    /// MVS quoted partitioned dataset notation.
    Mvs,
    /// VxWorks.
    VxWorks,
    /// z/VM.
    Zvm,
    /// HP NonStop (Guardian) paths.
    HpNonStop,
    /// DOS paths reported over a non-DOS transport.
    DosVirtual,
    /// Cygwin-flavored Unix paths on Windows.
    Cygwin,
}

/// How the client should present its identity to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogonType {
    /// `USER anonymous` with an email-like password.
    Anonymous,
    /// Plain username/password.
    Normal,
    /// Prompt the host for a password just before logon.
    Ask,
    /// Fully interactive: server challenges are forwarded to the host.
    Interactive,
    /// Username/password plus an `ACCT` account string.
    Account,
    /// Public-key based logon (e.g. for SFTP-adjacent gateways); the core
    /// only threads the key path through, it never reads key material.
    Key,
}

/// Decrypted credentials the engine uses to authenticate. The core never
/// persists these; encryption-at-rest is an out-of-scope host concern.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Which logon flow to use.
    pub logon_type: LogonType,
    /// Username, if applicable.
    pub user: Option<String>,
    /// Password, if applicable.
    pub password: Option<String>,
    /// `ACCT` account string, if applicable.
    pub account: Option<String>,
    /// Path to a private key file, for [`LogonType::Key`].
    pub key_file: Option<std::path::PathBuf>,
}

impl Credentials {
    /// The common case: anonymous login with the conventional email-style
    /// password.
    pub fn anonymous() -> Self {
        Credentials {
            logon_type: LogonType::Anonymous,
            user: Some("anonymous".to_string()),
            password: Some("anonymous@".to_string()),
            account: None,
            key_file: None,
        }
    }

    /// Plain username/password credentials.
    pub fn normal(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            logon_type: LogonType::Normal,
            user: Some(user.into()),
            password: Some(password.into()),
            account: None,
            key_file: None,
        }
    }
}

/// The immutable identity of a remote endpoint (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Server {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port, 1..=65535.
    pub port: u16,
    /// Wire protocol.
    pub protocol: ProtocolKey,
    /// Path/quirk hint.
    pub server_type: ServerType,
    /// Optional human-readable display name.
    pub name: Option<String>,
    /// Timezone offset in minutes, learned or configured.
    pub timezone_offset_minutes: i32,
    /// Whether to prefer passive mode by default.
    pub passive_mode: PassiveModePreference,
    /// Maximum concurrent connections the host permits to this server.
    pub max_connections: u32,
    /// Character encoding policy.
    pub encoding: Encoding,
    /// If true, never route this server's connections through a proxy.
    pub bypass_proxy: bool,
    /// Commands to issue, in order, immediately after a successful logon.
    pub post_login_commands: Vec<String>,
}

/// `Server` is used as a cache key throughout §5, hence `Protocol` above
/// already derives `Eq`/`Hash`.
pub type ProtocolKey = Protocol;

/// Passive- vs. active-mode preference recorded on a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PassiveModePreference {
    /// Use the engine-wide default (`EngineOptions::use_passive`).
    #[default]
    Default,
    /// Always attempt passive first.
    Passive,
    /// Always attempt active first.
    Active,
}

/// Character-encoding policy for outgoing/incoming command text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Negotiate `UTF8` via `FEAT`/`OPTS UTF8 ON` when advertised, otherwise
    /// fall back to the host locale.
    #[default]
    Auto,
    /// Force UTF-8 regardless of negotiation.
    Utf8,
    /// Use a named legacy encoding (e.g. `"ISO-8859-1"`, `"CP437"`).
    Custom(String),
}

impl Server {
    /// Builds a server identity with engine defaults for everything but
    /// host/port/protocol.
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Server {
            host: host.into(),
            port,
            protocol,
            server_type: ServerType::default(),
            name: None,
            timezone_offset_minutes: 0,
            passive_mode: PassiveModePreference::default(),
            max_connections: 1,
            encoding: Encoding::default(),
            bypass_proxy: false,
            post_login_commands: Vec::new(),
        }
    }
}

/// The path-element separator style derived from [`ServerType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PathStyle {
    Unix,
    Dos,
    Vms,
    Mvs,
}

impl From<ServerType> for PathStyle {
    fn from(t: ServerType) -> Self {
        match t {
            ServerType::Dos | ServerType::DosVirtual => PathStyle::Dos,
            ServerType::Vms => PathStyle::Vms,
            ServerType::Mvs => PathStyle::Mvs,
            _ => PathStyle::Unix,
        }
    }
}

/// An absolute path on a remote server, formatted according to the
/// server's [`ServerType`] (§3).
///
/// Invariant: a non-empty `ServerPath` is always absolute in its style;
/// the default-constructed path is the unique empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerPath {
    style: PathStyleKey,
    segments: Vec<String>,
}

type PathStyleKey = PathStyle;

impl ServerPath {
    /// The canonical empty path (equivalent to a default-constructed path
    /// in the original engine).
    pub fn empty() -> Self {
        ServerPath {
            style: PathStyle::Unix,
            segments: Vec::new(),
        }
    }

    /// True iff this is the empty path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Parses a path string under the given server type. Round-trips with
    /// [`ServerPath::to_string_for`] for all legal paths (§8 round-trip
    /// law).
    pub fn parse(path: &str, server_type: ServerType) -> Option<Self> {
        let style = PathStyle::from(server_type);
        if path.is_empty() {
            return Some(ServerPath::empty());
        }
        match style {
            PathStyle::Unix => {
                if !path.starts_with('/') {
                    return None;
                }
                let segments = path
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                Some(ServerPath { style, segments })
            }
            PathStyle::Dos => {
                let rest = path.strip_prefix(|c: char| c.is_ascii_alphabetic()).and_then(|r| r.strip_prefix(':'))?;
                let rest = rest.strip_prefix('\\').or_else(|| rest.strip_prefix('/'))?;
                let drive = &path[..2];
                let mut segments = vec![drive.to_string()];
                segments.extend(rest.split(['\\', '/']).filter(|s| !s.is_empty()).map(str::to_string));
                Some(ServerPath { style, segments })
            }
            PathStyle::Vms => {
                // [FOO.BAR.BAZ] style.
                let inner = path.strip_prefix('[')?.strip_suffix(']')?;
                let segments = inner.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect();
                Some(ServerPath { style, segments })
            }
            PathStyle::Mvs => {
                // 'HLQ.MLQ.LLQ' quoted dataset style.
                let inner = path.strip_prefix('\'').and_then(|p| p.strip_suffix('\'')).unwrap_or(path);
                let segments = inner.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect();
                Some(ServerPath { style, segments })
            }
        }
    }

    /// Renders the path back to its server-native string form.
    pub fn to_string_for_server(&self) -> String {
        if self.segments.is_empty() {
            return match self.style {
                PathStyle::Unix => "/".to_string(),
                PathStyle::Dos => String::new(),
                PathStyle::Vms => "[]".to_string(),
                PathStyle::Mvs => String::new(),
            };
        }
        match self.style {
            PathStyle::Unix => format!("/{}", self.segments.join("/")),
            PathStyle::Dos => {
                let (drive, rest) = self.segments.split_first().unwrap();
                if rest.is_empty() {
                    format!("{drive}\\")
                } else {
                    format!("{}\\{}", drive, rest.join("\\"))
                }
            }
            PathStyle::Vms => format!("[{}]", self.segments.join(".")),
            PathStyle::Mvs => format!("'{}'", self.segments.join(".")),
        }
    }

    /// The final path segment, if any.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path, or `None` if this path has no parent (root or
    /// empty).
    pub fn parent(&self) -> Option<ServerPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(ServerPath {
            style: self.style,
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True if this path has a parent (i.e. is not root/empty).
    pub fn has_parent(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Returns a new path with `segment` appended.
    pub fn add_segment(&self, segment: &str) -> ServerPath {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        ServerPath { style: self.style, segments }
    }

    /// True if `self` is a (possibly indirect) subdirectory of `other`.
    pub fn is_subdir_of(&self, other: &ServerPath) -> bool {
        other.is_parent_of(self)
    }

    /// True if `self` is a (possibly indirect) ancestor of `other`.
    pub fn is_parent_of(&self, other: &ServerPath) -> bool {
        self.segments.len() < other.segments.len() && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// The deepest path that is an ancestor of both `self` and `other`.
    pub fn common_parent(&self, other: &ServerPath) -> ServerPath {
        let mut common = Vec::new();
        for (a, b) in self.segments.iter().zip(other.segments.iter()) {
            if a == b {
                common.push(a.clone());
            } else {
                break;
            }
        }
        ServerPath { style: self.style, segments: common }
    }

    /// Formats `name` as a server command argument: either the bare name
    /// (relative to the current directory) or the fully-qualified path,
    /// matching `CServerPath::FormatFilename`.
    pub fn format_filename(&self, name: &str, relative: bool) -> String {
        if relative {
            name.to_string()
        } else {
            self.add_segment(name).to_string_for_server()
        }
    }

    /// Formats `name` as a subdirectory argument for `CWD`.
    pub fn format_subdir(&self, name: &str) -> String {
        name.to_string()
    }
}

impl fmt::Display for ServerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_for_server())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_round_trip() {
        let p = ServerPath::parse("/pub/incoming", ServerType::Default).unwrap();
        assert_eq!(p.to_string_for_server(), "/pub/incoming");
        assert_eq!(ServerPath::parse(&p.to_string_for_server(), ServerType::Default).unwrap(), p);
    }

    #[test]
    fn parent_and_last_segment() {
        let p = ServerPath::parse("/a/b/c", ServerType::Default).unwrap();
        assert_eq!(p.last_segment(), Some("c"));
        let parent = p.parent().unwrap();
        assert_eq!(parent.to_string_for_server(), "/a/b");
    }

    #[test]
    fn format_filename_parent_matches_self_when_has_parent() {
        let p = ServerPath::parse("/a/b", ServerType::Default).unwrap();
        let full = p.format_filename("c", false);
        let full_path = ServerPath::parse(&full, ServerType::Default).unwrap();
        assert_eq!(full_path.parent().unwrap(), p);
    }

    #[test]
    fn is_parent_of_and_common_parent() {
        let a = ServerPath::parse("/a", ServerType::Default).unwrap();
        let abc = ServerPath::parse("/a/b/c", ServerType::Default).unwrap();
        assert!(a.is_parent_of(&abc));
        assert!(abc.is_subdir_of(&a));
        let other = ServerPath::parse("/a/x/y", ServerType::Default).unwrap();
        assert_eq!(abc.common_parent(&other), a);
    }

    #[test]
    fn dos_style_round_trip() {
        let p = ServerPath::parse("C:\\foo\\bar", ServerType::Dos).unwrap();
        assert_eq!(p.to_string_for_server(), "C:\\foo\\bar");
    }

    #[test]
    fn vms_style_round_trip() {
        let p = ServerPath::parse("[FOO.BAR]", ServerType::Vms).unwrap();
        assert_eq!(p.to_string_for_server(), "[FOO.BAR]");
    }

    #[test]
    fn empty_path_is_unique() {
        let a = ServerPath::empty();
        let b = ServerPath::parse("", ServerType::Dos).unwrap();
        assert!(a.is_empty());
        assert_eq!(a, b);
    }
}
