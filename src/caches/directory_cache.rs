//! In-memory directory listing cache keyed by `(Server, ServerPath)` (§3, §9).

use moka::sync::Cache;
use std::time::Duration;

use crate::directory_listing::{DirectoryListing, UnsureFlags};
use crate::server_info::{Server, ServerPath};

/// What kind of cached state a single file/directory entry carries, used by
/// `Mkdir`/`Chmod`/`Delete` to mark entries for refresh without forcing a
/// full listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Known to be a regular file.
    File,
    /// Known to be a directory.
    Dir,
    /// State invalidated; next listing must refresh it.
    Unknown,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    server: Server,
    path: ServerPath,
}

/// Process-wide directory listing cache.
///
/// Grounded on the same `moka::sync::Cache` pattern as
/// [`crate::caches::ServerCapabilities`]; invalidation here models
/// `CDirectoryCache::InvalidateFile`/`UpdateFile` from the original engine.
#[derive(Clone)]
pub struct DirectoryCache {
    inner: Cache<Key, DirectoryListing>,
}

impl DirectoryCache {
    /// Builds a cache retaining up to `max_entries` listings, each expiring
    /// `ttl` after capture if not refreshed.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        DirectoryCache {
            inner: Cache::builder().max_capacity(max_entries).time_to_live(ttl).build(),
        }
    }

    /// Stores a freshly-captured listing, replacing any prior entry for the
    /// same `(server, path)`.
    pub fn store(&self, server: &Server, listing: DirectoryListing) {
        let key = Key {
            server: server.clone(),
            path: listing.path.clone(),
        };
        self.inner.insert(key, listing);
    }

    /// Looks up the cached listing for `(server, path)`, if present.
    pub fn lookup(&self, server: &Server, path: &ServerPath) -> Option<DirectoryListing> {
        self.inner.get(&Key {
            server: server.clone(),
            path: path.clone(),
        })
    }

    /// Marks a single file's cached state unknown (forcing a refresh on
    /// next listing) without discarding the rest of the listing, mirroring
    /// `CDirectoryCache::UpdateFile(..., CDirectoryCache::unknown)` as used
    /// by `Chmod`.
    pub fn mark_unknown(&self, server: &Server, dir: &ServerPath, name: &str) {
        let key = Key {
            server: server.clone(),
            path: dir.clone(),
        };
        if let Some(mut listing) = self.inner.get(&key) {
            if listing.entries.iter().any(|e| e.name == name) {
                listing.unsure_flags |= UnsureFlags::ATTRIBUTES;
                self.inner.insert(key, listing);
            }
        }
    }

    /// Records that `name` under `dir` is now known to have `state`,
    /// inserting it into the cached listing if one exists and the entry is
    /// absent (e.g. a freshly created directory), mirroring
    /// `UpdateFile(..., true, CDirectoryCache::dir)` as used by `Mkdir`.
    pub fn record_created(&self, server: &Server, dir: &ServerPath, name: &str, state: FileState, now: chrono::DateTime<chrono::Utc>) {
        let key = Key {
            server: server.clone(),
            path: dir.clone(),
        };
        let mut listing = self
            .inner
            .get(&key)
            .unwrap_or_else(|| DirectoryListing::empty(dir.clone(), now));
        if !listing.entries.iter().any(|e| e.name == name) {
            listing.entries.push(crate::directory_listing::DirEntry {
                name: name.to_string(),
                size: 0,
                mtime: None,
                permissions: None,
                owner: None,
                group: None,
                is_dir: state == FileState::Dir,
                is_link: false,
                link_target: None,
            });
        }
        self.inner.insert(key, listing);
    }

    /// Removes a single entry from the cached listing (e.g. after `DELE`),
    /// mirroring `CDirectoryCache::RemoveFile`.
    pub fn remove_entry(&self, server: &Server, dir: &ServerPath, name: &str) {
        let key = Key {
            server: server.clone(),
            path: dir.clone(),
        };
        if let Some(mut listing) = self.inner.get(&key) {
            listing.entries.retain(|e| e.name != name);
            self.inner.insert(key, listing);
        }
    }

    /// Applies a rename within the cache, moving an entry from
    /// `(from_dir, from_name)` to `(to_dir, to_name)`; both directories'
    /// listings are invalidated if the move crosses directories, mirroring
    /// `CDirectoryCache::Rename`.
    pub fn rename(&self, server: &Server, from_dir: &ServerPath, from_name: &str, to_dir: &ServerPath, to_name: &str) {
        self.remove_entry(server, from_dir, from_name);
        self.invalidate(server, to_dir);
        self.invalidate(server, from_dir);
        let _ = to_name;
    }

    /// Drops the cached listing for `(server, path)` entirely.
    pub fn invalidate(&self, server: &Server, path: &ServerPath) {
        self.inner.invalidate(&Key {
            server: server.clone(),
            path: path.clone(),
        });
    }
}

impl Default for DirectoryCache {
    fn default() -> Self {
        DirectoryCache::new(1024, Duration::from_secs(5 * 60))
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
    fn store_then_lookup_round_trips() {
        let cache = DirectoryCache::default();
        let path = ServerPath::parse("/pub", crate::server_info::ServerType::Default).unwrap();
        let now = chrono::Utc::now();
        let listing = DirectoryListing::empty(path.clone(), now);
        cache.store(&server(), listing.clone());
        assert_eq!(cache.lookup(&server(), &path), Some(listing));
    }

    #[test]
    fn record_created_reflects_as_directory() {
        let cache = DirectoryCache::default();
        let path = ServerPath::parse("/a", crate::server_info::ServerType::Default).unwrap();
        let now = chrono::Utc::now();
        cache.record_created(&server(), &path, "b", FileState::Dir, now);
        let listing = cache.lookup(&server(), &path).unwrap();
        let entry = listing.find("b").unwrap();
        assert!(entry.is_dir);
    }

    #[test]
    fn mark_unknown_sets_attributes_unsure() {
        let cache = DirectoryCache::default();
        let path = ServerPath::parse("/a", crate::server_info::ServerType::Default).unwrap();
        let now = chrono::Utc::now();
        cache.record_created(&server(), &path, "f", FileState::File, now);
        cache.mark_unknown(&server(), &path, "f");
        let listing = cache.lookup(&server(), &path).unwrap();
        assert!(listing.unsure_flags.contains(UnsureFlags::ATTRIBUTES));
    }
}
