#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! A client-side FTP/FTPS protocol engine, async and cloud-orientated like
//! the server library it grew out of.
//!
//! The engine dials one server at a time, drives the logon handshake and
//! whatever directory/transfer operations the host requests, and reports
//! everything it observes — log lines, status changes, transfer progress,
//! prompts that need a host decision — as [`notification::Notification`]s
//! rather than return values, so a GUI or automation host can stay fully
//! asynchronous too.
//!
//! It runs on top of the Tokio asynchronous run-time and tries to make use
//! of async IO as much as possible.
//!
//! # Quick Start
//!
//! Add the crate and tokio to your project's dependencies in Cargo.toml:
//!
//! ```toml
//! [dependencies]
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let server = ftpc_engine::Server::new("ftp.example.com".to_string(), 21, ftpc_engine::Protocol::Ftp);
//!     let credentials = ftpc_engine::Credentials::anonymous();
//!     let engine = ftpc_engine::Engine::new();
//!     let listener: Arc<dyn ftpc_engine::NotificationListener> = Arc::new(ftpc_engine::NopListener::default());
//!     let (socket, status) = engine
//!         .connect(server, credentials, ftpc_engine::EngineOptions::default(), listener)
//!         .await
//!         .expect("connect failed");
//!     if status.is_error() {
//!         return;
//!     }
//!     socket.list(ftpc_engine::ServerPath::empty()).await.ok();
//! }
//! ```

pub mod caches;
pub mod control;
pub mod directory_listing;
mod engine;
pub mod error;
pub mod external_ip;
pub(crate) mod latency;
pub mod notification;
pub mod options;
pub mod reply;
pub mod server_info;
pub mod status;
pub mod tls;
pub mod transfer_socket;

pub use control::ControlSocket;
pub use engine::Engine;
pub use error::{EngineError, EngineErrorKind};
pub use notification::{NopListener, Notification, NotificationListener};
pub use options::EngineOptions;
pub use server_info::{Credentials, Protocol, Server, ServerPath};
pub use status::OpStatus;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
