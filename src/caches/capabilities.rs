//! Per-server capability discovery store (§4.2 `Feat`, §9).

use moka::sync::Cache;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::server_info::Server;

/// Tri-state record of whether a server supports a given feature: the
/// engine starts `Unknown` and commits to `Yes`/`No` once observed, rather
/// than re-probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tri {
    /// Not yet probed.
    #[default]
    Unknown,
    /// Confirmed supported.
    Yes,
    /// Confirmed unsupported.
    No,
}

impl Tri {
    /// True only if confirmed supported.
    pub fn is_yes(&self) -> bool {
        matches!(self, Tri::Yes)
    }
}

/// The set of capabilities the `Logon`/`List`/`RawTransfer` operations
/// consult, as parsed from `FEAT` (§4.2) plus a couple learned at runtime
/// (`tls_resume`, `epsv_command` degrading after a failed attempt).
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// `UTF8` feature line present.
    pub utf8: Tri,
    /// `CLNT` feature line present.
    pub clnt: Tri,
    /// `MLSD` feature line present, with the advertised fact list.
    pub mlsd: Tri,
    /// Facts advertised for `MLSD`/`MLST` (MLST overrides MLSD's list per
    /// §4.2).
    pub mlsd_facts: Vec<String>,
    /// `MLST` feature line present.
    pub mlst: Tri,
    /// `MODE Z` feature line present.
    pub mode_z: Tri,
    /// `MFMT` feature line present.
    pub mfmt: Tri,
    /// `MDTM` feature line present.
    pub mdtm: Tri,
    /// `SIZE` feature line present.
    pub size: Tri,
    /// `TVFS` feature line present.
    pub tvfs: Tri,
    /// `REST STREAM` feature line present.
    pub rest_stream: Tri,
    /// `EPSV` feature line present (and not since downgraded after a
    /// runtime failure).
    pub epsv: Tri,
    /// Whether the data channel successfully resumed the control channel's
    /// TLS session last time it was attempted.
    pub tls_resume: Tri,
    /// Whether `LIST -a` was answered with something other than a listing
    /// (some servers treat `-a` as a literal filename argument); once `No`,
    /// `List` degrades to plain `LIST` for the rest of the connection.
    pub list_dash_a: Tri,
    /// Server timezone offset in minutes, once learned (forced to `0`/UTC
    /// the moment `MLSD`/`MLST` is observed, per §4.2).
    pub timezone_offset_minutes: Option<i32>,
}

impl Capabilities {
    /// Applies one trimmed, uppercased `FEAT` response line.
    pub fn observe_feat_line(&mut self, line: &str) {
        let upper = line.trim().to_ascii_uppercase();
        if upper == "UTF8" {
            self.utf8 = Tri::Yes;
        } else if upper == "CLNT" {
            self.clnt = Tri::Yes;
        } else if let Some(facts) = upper.strip_prefix("MLSD") {
            self.mlsd = Tri::Yes;
            self.timezone_offset_minutes.get_or_insert(0);
            if matches!(self.mlst, Tri::Unknown | Tri::No) {
                self.mlsd_facts = split_facts(facts);
            }
        } else if let Some(facts) = upper.strip_prefix("MLST") {
            self.mlst = Tri::Yes;
            self.timezone_offset_minutes = Some(0);
            self.mlsd_facts = split_facts(facts); // MLST overrides MLSD's list.
        } else if upper == "MODE Z" {
            self.mode_z = Tri::Yes;
        } else if upper == "MFMT" {
            self.mfmt = Tri::Yes;
        } else if upper == "MDTM" {
            self.mdtm = Tri::Yes;
        } else if upper == "SIZE" {
            self.size = Tri::Yes;
        } else if upper == "TVFS" {
            self.tvfs = Tri::Yes;
        } else if upper == "REST STREAM" {
            self.rest_stream = Tri::Yes;
        } else if upper == "EPSV" {
            self.epsv = Tri::Yes;
        }
    }
}

fn split_facts(rest: &str) -> Vec<String> {
    rest.trim()
        .split(';')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Process-wide, thread-safe store of [`Capabilities`] keyed by [`Server`].
///
/// Grounded on the `moka::sync::Cache` pattern used for the teacher's
/// `TlsSessionCache`; generalized here to key by the full `Server` identity
/// rather than a session-ticket blob.
#[derive(Clone)]
pub struct ServerCapabilities {
    inner: Cache<Server, Arc<RwLock<Capabilities>>>,
}

impl ServerCapabilities {
    /// Builds a store retaining up to `max_servers` entries, evicting the
    /// least-recently-used once full.
    pub fn new(max_servers: u64) -> Self {
        ServerCapabilities {
            inner: Cache::builder()
                .max_capacity(max_servers)
                .time_to_idle(Duration::from_secs(60 * 60))
                .build(),
        }
    }

    /// Runs `f` against the capabilities recorded for `server`, inserting a
    /// fresh `Unknown`-everywhere record if this is the first time it's
    /// been seen.
    pub fn with<R>(&self, server: &Server, f: impl FnOnce(&mut Capabilities) -> R) -> R {
        let entry = self
            .inner
            .get_with(server.clone(), || Arc::new(RwLock::new(Capabilities::default())));
        let mut guard = entry.write().expect("capabilities lock poisoned");
        f(&mut guard)
    }

    /// Reads a snapshot of the capabilities recorded for `server`.
    pub fn snapshot(&self, server: &Server) -> Capabilities {
        self.with(server, |c| c.clone())
    }
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        ServerCapabilities::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_info::Protocol;

    fn server() -> Server {
        Server::new("example.com", 21, Protocol::Ftp)
    }

    #[test]
    fn feat_lines_set_capabilities() {
        let store = ServerCapabilities::default();
        store.with(&server(), |c| {
            c.observe_feat_line(" UTF8");
            c.observe_feat_line(" EPSV");
            c.observe_feat_line(" MLSD type;size;modify;perm;");
        });
        let snap = store.snapshot(&server());
        assert!(snap.utf8.is_yes());
        assert!(snap.epsv.is_yes());
        assert!(snap.mlsd.is_yes());
        assert_eq!(snap.timezone_offset_minutes, Some(0));
        assert_eq!(snap.mlsd_facts, vec!["type", "size", "modify", "perm"]);
    }

    #[test]
    fn mlst_overrides_mlsd_facts() {
        let store = ServerCapabilities::default();
        store.with(&server(), |c| {
            c.observe_feat_line(" MLSD type;size;");
            c.observe_feat_line(" MLST type;size;modify;perm;unique;");
        });
        let snap = store.snapshot(&server());
        assert_eq!(snap.mlsd_facts, vec!["type", "size", "modify", "perm", "unique"]);
    }

    #[test]
    fn unknown_capability_defaults_to_unknown() {
        let store = ServerCapabilities::default();
        let snap = store.snapshot(&server());
        assert_eq!(snap.tls_resume, Tri::Unknown);
    }
}
