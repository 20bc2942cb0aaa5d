//! Directory listing data model and the pluggable listing parser boundary.
//!
//! Parsing raw `LIST`/`MLSD` bytes into entries is explicitly out of scope
//! for the core (spec.md §1 calls it out as an external collaborator: "the
//! core only feeds bytes and receives the parsed result"). What the core
//! *does* own is the shape of the parsed result and the narrow interface by
//! which bytes are fed in. [`UnixListingParser`] is provided as the default
//! implementation so the engine is runnable without a host-supplied parser,
//! the same way the teacher ships a default filesystem storage backend
//! alongside the storage trait it defines.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::server_info::ServerPath;

bitflags::bitflags! {
    /// Flags on a [`DirectoryListing`] indicating which aspects of the
    /// cached entries might be stale due to a mutation observed since the
    /// listing was captured.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnsureFlags: u32 {
        /// At least one entry's existence is unconfirmed (e.g. a `DELE`
        /// raced the listing).
        const EXISTENCE = 0b0000_0001;
        /// At least one entry's size or mtime may be stale.
        const ATTRIBUTES = 0b0000_0010;
        /// The full set of entries might no longer be complete (e.g. a
        /// concurrent upload/mkdir was observed).
        const MEMBERSHIP = 0b0000_0100;
    }
}

/// A single entry in a [`DirectoryListing`].
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// Bare file/directory name (no path).
    pub name: String,
    /// Size in bytes; `0` for directories on most servers.
    pub size: u64,
    /// Modification time, if the listing format carried one.
    pub mtime: Option<DateTime<Utc>>,
    /// Raw permission string as reported by the server (e.g. `"rwxr-xr-x"`),
    /// if any.
    pub permissions: Option<String>,
    /// Owning user, if reported.
    pub owner: Option<String>,
    /// Owning group, if reported.
    pub group: Option<String>,
    /// True if this entry is a directory.
    pub is_dir: bool,
    /// True if this entry is a symlink.
    pub is_link: bool,
    /// Symlink target, if `is_link` and the format reports it.
    pub link_target: Option<String>,
}

/// A parsed directory listing: an ordered sequence of entries plus the
/// bookkeeping the cache layer needs (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryListing {
    /// The path this listing is for.
    pub path: ServerPath,
    /// The entries, in server-reported order.
    pub entries: Vec<DirEntry>,
    /// When this listing was first captured.
    pub first_list_time: DateTime<Utc>,
    /// Which aspects of the listing might now be stale.
    pub unsure_flags: UnsureFlags,
}

impl DirectoryListing {
    /// An empty listing for `path`, captured "now" (caller-supplied so the
    /// type stays independent of a wall-clock source, per the no-`Date.now`
    /// style constraint this crate is authored under).
    pub fn empty(path: ServerPath, now: DateTime<Utc>) -> Self {
        DirectoryListing {
            path,
            entries: Vec::new(),
            first_list_time: now,
            unsure_flags: UnsureFlags::empty(),
        }
    }

    /// Looks up an entry by bare name.
    pub fn find(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// True if the set of entries or any entry's attributes might be stale.
    pub fn is_unsure(&self) -> bool {
        !self.unsure_flags.is_empty()
    }
}

/// Streaming interface the `TransferSocket` feeds raw listing bytes into.
/// Implementors accumulate bytes across possibly many `feed` calls and
/// produce a [`DirectoryListing`] once `finish` is called at end-of-transfer.
pub trait ListingParser: Send {
    /// Consumes another chunk of raw bytes from the data channel.
    fn feed(&mut self, chunk: &[u8]);

    /// Finalizes parsing once the data channel has signaled EOF, producing
    /// the parsed entries (without path/timing metadata, which the caller
    /// attaches).
    fn finish(self: Box<Self>) -> Vec<DirEntry>;
}

/// Default listing parser for Unix-style `LIST -a` / `ls -l` output.
///
/// This is a best-effort implementation of the common case; servers using
/// MLSD supply machine-parsable facts and are handled by
/// [`MlsdListingParser`] instead, selected by the `List` operation once the
/// server's capability (`mlsd_command`) is known.
#[derive(Debug, Default)]
pub struct UnixListingParser {
    buf: Vec<u8>,
}

impl UnixListingParser {
    /// Builds an empty parser.
    pub fn new() -> Self {
        UnixListingParser::default()
    }
}

impl ListingParser for UnixListingParser {
    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn finish(self: Box<Self>) -> Vec<DirEntry> {
        let text = String::from_utf8_lossy(&self.buf);
        text.lines().filter_map(parse_unix_list_line).collect()
    }
}

fn parse_unix_list_line(line: &str) -> Option<DirEntry> {
    let line = line.trim_end_matches(['\r']);
    if line.is_empty() || line.starts_with("total ") {
        return None;
    }
    // `drwxr-xr-x  2 owner group  4096 Jan  1 00:00 name`
    let mut parts = line.splitn(9, char::is_whitespace).filter(|s| !s.is_empty());
    let perms = parts.next()?;
    let is_dir = perms.starts_with('d');
    let is_link = perms.starts_with('l');
    let perms_str = perms.get(1..).unwrap_or("").to_string();
    let _link_count = parts.next()?;
    let owner = parts.next()?.to_string();
    let group = parts.next()?.to_string();
    let size: u64 = parts.next()?.parse().ok()?;
    let month = parts.next()?;
    let day = parts.next()?;
    let time_or_year = parts.next()?;
    let rest = parts.next().unwrap_or("").to_string();
    let (name, link_target) = if is_link {
        match rest.split_once(" -> ") {
            Some((n, t)) => (n.to_string(), Some(t.to_string())),
            None => (rest, None),
        }
    } else {
        (rest, None)
    };
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(DirEntry {
        name,
        size,
        mtime: parse_unix_mtime(month, day, time_or_year),
        permissions: Some(perms_str),
        owner: Some(owner),
        group: Some(group),
        is_dir,
        is_link,
        link_target,
    })
}

fn parse_unix_mtime(month: &str, day: &str, time_or_year: &str) -> Option<DateTime<Utc>> {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    let month_num = MONTHS.iter().position(|m| m.eq_ignore_ascii_case(month))? as u32 + 1;
    let day_num: u32 = day.trim().parse().ok()?;
    if let Some((h, m)) = time_or_year.split_once(':') {
        let hour: u32 = h.parse().ok()?;
        let minute: u32 = m.parse().ok()?;
        let year = Utc::now().date_naive().year_for_recent_mtime(month_num, day_num);
        let date = NaiveDate::from_ymd_opt(year, month_num, day_num)?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        Some(DateTime::from_naive_utc_and_offset(NaiveDateTime::new(date, time), Utc))
    } else {
        let year: i32 = time_or_year.parse().ok()?;
        let date = NaiveDate::from_ymd_opt(year, month_num, day_num)?;
        let time = NaiveTime::from_hms_opt(0, 0, 0)?;
        Some(DateTime::from_naive_utc_and_offset(NaiveDateTime::new(date, time), Utc))
    }
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

trait RecentYearHeuristic {
    fn year_for_recent_mtime(&self, month: u32, day: u32) -> i32;
}

impl RecentYearHeuristic for chrono::NaiveDate {
    fn year_for_recent_mtime(&self, month: u32, day: u32) -> i32 {
        // `ls -l`'s minute-precision entries omit the year and are assumed
        // recent; if the month/day would be in the future relative to now,
        // the entry must be from last year.
        use chrono::Datelike;
        if month > self.month() || (month == self.month() && day > self.day()) {
            self.year() - 1
        } else {
            self.year()
        }
    }
}

/// Parses `MLSD` machine-readable listing output (`RFC 3659`):
/// `fact=value;fact=value; name`.
#[derive(Debug, Default)]
pub struct MlsdListingParser {
    buf: Vec<u8>,
}

impl MlsdListingParser {
    /// Builds an empty parser.
    pub fn new() -> Self {
        MlsdListingParser::default()
    }
}

impl ListingParser for MlsdListingParser {
    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn finish(self: Box<Self>) -> Vec<DirEntry> {
        let text = String::from_utf8_lossy(&self.buf);
        text.lines().filter_map(parse_mlsd_line).collect()
    }
}

fn parse_mlsd_line(line: &str) -> Option<DirEntry> {
    let line = line.trim_end_matches(['\r']);
    let (facts_str, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }
    let mut facts = std::collections::HashMap::new();
    for fact in facts_str.split(';') {
        if let Some((k, v)) = fact.split_once('=') {
            facts.insert(k.to_ascii_lowercase(), v.to_string());
        }
    }
    let type_fact = facts.get("type").map(String::as_str).unwrap_or("file");
    let is_dir = type_fact.eq_ignore_ascii_case("dir") || type_fact.eq_ignore_ascii_case("cdir") || type_fact.eq_ignore_ascii_case("pdir");
    if type_fact.eq_ignore_ascii_case("cdir") || type_fact.eq_ignore_ascii_case("pdir") {
        return None; // "." and ".." equivalents, never surfaced.
    }
    let size = facts.get("size").and_then(|s| s.parse().ok()).unwrap_or(0);
    let mtime = facts.get("modify").and_then(|m| parse_mlsd_modify(m));
    let perm = facts.get("perm").cloned();
    let unix_mode = facts.get("unix.mode").cloned();
    Some(DirEntry {
        name: name.to_string(),
        size,
        mtime,
        permissions: unix_mode.or(perm),
        owner: facts.get("unix.owner").cloned(),
        group: facts.get("unix.group").cloned(),
        is_dir,
        is_link: type_fact.eq_ignore_ascii_case("os.unix=symlink") || facts.contains_key("unix.slink"),
        link_target: facts.get("unix.slink").cloned(),
    })
}

fn parse_mlsd_modify(s: &str) -> Option<DateTime<Utc>> {
    // YYYYMMDDHHMMSS[.sss]
    let s = s.split('.').next().unwrap_or(s);
    if s.len() < 14 {
        return None;
    }
    chrono::NaiveDateTime::parse_from_str(&s[..14], "%Y%m%d%H%M%S")
        .ok()
        .map(|ndt| DateTime::from_naive_utc_and_offset(ndt, Utc))
}

/// Convenience: the set of entry names a listing contains, for cheap
/// membership checks from the `Mkdir`/`Delete` cache-update paths.
pub fn entry_names(listing: &DirectoryListing) -> HashSet<&str> {
    listing.entries.iter().map(|e| e.name.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_list_line_parses() {
        let line = "drwxr-xr-x  2 owner group  4096 Jan  1 2023 subdir";
        let e = parse_unix_list_line(line).unwrap();
        assert_eq!(e.name, "subdir");
        assert!(e.is_dir);
        assert_eq!(e.size, 4096);
    }

    #[test]
    fn unix_list_symlink_parses_target() {
        let line = "lrwxrwxrwx  1 owner group  7 Jan  1 2023 link -> target";
        let e = parse_unix_list_line(line).unwrap();
        assert!(e.is_link);
        assert_eq!(e.name, "link");
        assert_eq!(e.link_target.as_deref(), Some("target"));
    }

    #[test]
    fn unix_list_skips_total_line() {
        assert!(parse_unix_list_line("total 12").is_none());
    }

    #[test]
    fn mlsd_line_parses_dir_and_file() {
        let dir = parse_mlsd_line("type=dir;modify=20230101120000; pub").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.name, "pub");
        let file = parse_mlsd_line("type=file;size=1234;modify=20230101120000; f.bin").unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.size, 1234);
    }

    #[test]
    fn mlsd_cdir_pdir_are_skipped() {
        assert!(parse_mlsd_line("type=cdir;modify=20230101120000; .").is_none());
        assert!(parse_mlsd_line("type=pdir;modify=20230101120000; ..").is_none());
    }
}
