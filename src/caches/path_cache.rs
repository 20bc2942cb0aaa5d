//! `(current_path, subdir) -> canonical_path` memoization learned from
//! `PWD` responses (§4.3, §9).

use moka::sync::Cache;
use std::time::Duration;

use crate::server_info::{Server, ServerPath};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    server: Server,
    current: ServerPath,
    subdir: String,
}

/// Process-wide path cache, so repeated `ChangeDir` calls into a previously
/// visited subdirectory can skip the confirming `PWD` round-trip.
#[derive(Clone)]
pub struct PathCache {
    inner: Cache<Key, ServerPath>,
}

impl PathCache {
    /// Builds a cache retaining up to `max_entries`, expiring `ttl` after
    /// insertion.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        PathCache {
            inner: Cache::builder().max_capacity(max_entries).time_to_live(ttl).build(),
        }
    }

    /// Records that changing from `current` into `subdir` (empty string
    /// means "just `current`") resolved to `canonical`.
    pub fn store(&self, server: &Server, current: &ServerPath, subdir: &str, canonical: ServerPath) {
        self.inner.insert(
            Key {
                server: server.clone(),
                current: current.clone(),
                subdir: subdir.to_string(),
            },
            canonical,
        );
    }

    /// Looks up a previously learned resolution.
    pub fn lookup(&self, server: &Server, current: &ServerPath, subdir: &str) -> Option<ServerPath> {
        self.inner.get(&Key {
            server: server.clone(),
            current: current.clone(),
            subdir: subdir.to_string(),
        })
    }

    /// Drops every entry whose resolved path equals or is nested under
    /// `path`, used by `Rename`/`RemoveDir` to prevent stale navigation
    /// shortcuts into a path that no longer exists under that name.
    pub fn invalidate_under(&self, server: &Server, path: &ServerPath) {
        let doomed: Vec<std::sync::Arc<Key>> = self
            .inner
            .iter()
            .filter(|(k, v)| &k.server == server && (v == path || path.is_parent_of(v)))
            .map(|(k, _)| k)
            .collect();
        for key in doomed {
            self.inner.invalidate(&key);
        }
    }
}

impl Default for PathCache {
    fn default() -> Self {
        PathCache::new(2048, Duration::from_secs(10 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_info::{Protocol, ServerType};

    fn server() -> Server {
        Server::new("example.com", 21, Protocol::Ftp)
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let cache = PathCache::default();
        let current = ServerPath::parse("/a", ServerType::Default).unwrap();
        let canonical = ServerPath::parse("/a/b", ServerType::Default).unwrap();
        cache.store(&server(), &current, "b", canonical.clone());
        assert_eq!(cache.lookup(&server(), &current, "b"), Some(canonical));
    }

    #[test]
    fn invalidate_under_removes_nested_entries() {
        let cache = PathCache::default();
        let root = ServerPath::parse("/a", ServerType::Default).unwrap();
        let nested = ServerPath::parse("/a/b/c", ServerType::Default).unwrap();
        cache.store(&server(), &root, "b/c", nested);
        cache.invalidate_under(&server(), &root);
        assert_eq!(cache.lookup(&server(), &root, "b/c"), None);
    }
}
