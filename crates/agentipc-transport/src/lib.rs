#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]

//! Local request/response IPC over Unix domain sockets.
//!
//! The transport provides:
//! - Named servers, one socket file each, inside a single socket directory
//! - A reactor thread multiplexing every listener and connection
//! - A worker pool running the per-connection callbacks
//!
//! ## Socket directory
//! The directory is created on start with an exact permission mode and must
//! be owned by the current user. It is checked again before every new server
//! and removed, with everything in it, on shutdown.
//!
//! ## Protocol
//! There is no framing. Each readable event drains what the peer has sent
//! and passes it to [`IpcCallbacks::data_received`] once; a returned response
//! is written back on the same connection.

pub mod callbacks;
pub mod client;
pub mod connection;
pub mod fs_ops;
pub mod policy;
pub mod pool;
pub mod reactor;
pub mod selector;
pub mod server;
mod transport;

pub use callbacks::IpcCallbacks;
pub use client::IpcClient;
pub use connection::{ClientConnection, ReadOutcome, WriteOutcome};
pub use fs_ops::{FileKind, FileOps, FileStat, RealFileOps};
pub use policy::{SocketPathPolicy, SOCKET_PREFIX};
pub use pool::WorkerPool;
pub use reactor::{ReactorLoop, ReactorState};
pub use selector::{Attachment, EventSource, ReadinessEvent, SelectionKey, Selector};
pub use server::ServerChannel;
pub use transport::IpcTransport;
