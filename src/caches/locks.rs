//! Advisory, per-path, cooperative locks (§5): operations that must
//! serialize against one another on the same `(Server, ServerPath)` (the
//! `List` operation's listing lock, `Mkdir`'s walk) register here instead of
//! blocking a thread.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::server_info::{Server, ServerPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Serializes concurrent `List` operations on the same path.
    List,
    /// Serializes concurrent `Mkdir` walks on the same path.
    Mkdir,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    server: Server,
    path: ServerPath,
    kind: LockKind,
}

/// A held advisory lock; dropping it releases the next waiter, if any.
///
/// Owns an `Arc` back to the table rather than borrowing it, so it can be
/// stored inside [`crate::control::OpContext`] across the `&mut self` calls
/// of the (synchronous) [`crate::control::OpData`] trait without threading a
/// lifetime parameter through every operation.
pub struct LockGuard {
    table: Arc<PathLockTable>,
    key: Key,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

/// The table of currently-held and waiting locks.
///
/// Grounded on §5's "Cache locks are advisory, per-path, cooperative:
/// operations acquire `list`/`mkdir` locks by inserting into a waiting map;
/// contention parks the operation until release." `dashmap` gives us a
/// concurrent map without a global mutex, matching its role as the
/// teacher's concurrent-map dependency for the same kind of bookkeeping.
#[derive(Default)]
pub struct PathLockTable {
    // Presence of a key means the lock is currently held. The queue holds
    // senders for tasks parked waiting to become the next holder.
    held: DashMap<Key, VecDeque<oneshot::Sender<()>>>,
}

impl PathLockTable {
    /// Builds an empty table.
    pub fn new() -> Self {
        PathLockTable::default()
    }

    /// Acquires the lock for `(server, path, kind)`, parking (asynchronously)
    /// behind any current holder. Takes `self` by `Arc` so the returned
    /// guard can outlive the borrow that produced it.
    pub async fn acquire(self: &Arc<Self>, server: &Server, path: &ServerPath, kind: LockKind) -> LockGuard {
        let key = Key {
            server: server.clone(),
            path: path.clone(),
            kind,
        };
        let rx = match self.held.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(VecDeque::new());
                None
            }
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                let (tx, rx) = oneshot::channel();
                o.get_mut().push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        LockGuard {
            table: Arc::clone(self),
            key,
        }
    }

    fn release(&self, key: &Key) {
        if let Some(mut entry) = self.held.get_mut(key) {
            if let Some(next) = entry.pop_front() {
                drop(entry);
                let _ = next.send(());
                return;
            }
        }
        self.held.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_info::{Protocol, ServerType};

    fn server() -> Server {
        Server::new("example.com", 21, Protocol::Ftp)
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let table = std::sync::Arc::new(PathLockTable::new());
        let path = ServerPath::parse("/a", ServerType::Default).unwrap();
        let guard = table.acquire(&server(), &path, LockKind::List).await;

        let table2 = table.clone();
        let server2 = server();
        let path2 = path.clone();
        let second = tokio::spawn(async move {
            // This would hang forever if `acquire` didn't hand off on
            // release; bound it with a timeout so a regression fails
            // instead of hanging the test suite.
            tokio::time::timeout(std::time::Duration::from_secs(2), async {
                let _g = table2.acquire(&server2, &path2, LockKind::List).await;
            })
            .await
        });

        drop(guard);
        assert!(second.await.unwrap().is_ok());
    }
}
