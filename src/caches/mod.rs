//! Process-global, thread-safe caches keyed by [`crate::server_info::Server`]
//! (§2, §5, §9 "Global singletons").
//!
//! The source engine holds these as C++ singletons; we hold them as
//! `moka::sync::Cache` instances (the same crate and pattern the teacher
//! uses for its own `TlsSessionCache`) owned by a top-level [`crate::Engine`]
//! context rather than as statics, so tests can instantiate a fresh set per
//! case (per the redesign note in spec.md §9).

pub mod capabilities;
pub mod directory_cache;
pub mod locks;
pub mod path_cache;

pub use capabilities::ServerCapabilities;
pub use directory_cache::DirectoryCache;
pub use locks::PathLockTable;
pub use path_cache::PathCache;
