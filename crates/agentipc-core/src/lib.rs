#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::return_self_not_must_use)]

//! Core types for agentipc: errors, configuration, default paths and version.

pub mod config;
pub mod error;
pub mod paths;
pub mod version;

pub use config::{DirMode, IpcConfig, IpcType, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::{Error, ErrorKind, Result};
pub use version::VERSION;
