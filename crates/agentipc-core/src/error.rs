use std::path::PathBuf;
use thiserror::Error;

/// Core error type for agentipc operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Illegal server name {name:?}")]
    InvalidName { name: String },

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Socket path {path} is {len} bytes, limit is {max}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    #[error("Socket directory {path} is insecure: {reason}")]
    InsecureDirectory { path: PathBuf, reason: String },

    #[error("{what} {path} has insecure owner: {reason}")]
    InsecureOwner {
        what: String,
        path: PathBuf,
        reason: String,
    },

    #[error("IPC server with name {name:?} already exists")]
    ServerExists { name: String },

    #[error("IPC server with name {name:?} does not exist")]
    NoSuchServer { name: String },

    #[error("Channel for server {name:?} is closed")]
    ChannelClosed { name: String },

    #[error("IPC transport has not been started")]
    NotStarted,

    #[error("IPC transport is already started")]
    AlreadyStarted,

    #[error("IPC transport has been shut down")]
    ShutDown,

    #[error("Unsupported IPC type: {0}")]
    UnsupportedTransport(String),

    #[error("Response of {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("Request exceeds maximum of {max} bytes")]
    RequestTooLarge { max: usize },

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write config at {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsupported name or path.
    Path,
    /// Ownership or permission mismatch, or failure to query them.
    Security,
    /// Native IO failure or invalid transport/registry state.
    Io,
    /// A peer or callback exceeded a message limit.
    Protocol,
    /// Configuration could not be read, parsed or written.
    Config,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. } | Self::InvalidPath { .. } | Self::PathTooLong { .. } => {
                ErrorKind::Path
            }
            Self::InsecureDirectory { .. } | Self::InsecureOwner { .. } => ErrorKind::Security,
            Self::ResponseTooLarge { .. } | Self::RequestTooLarge { .. } => ErrorKind::Protocol,
            Self::ConfigRead { .. } | Self::ConfigParse { .. } | Self::ConfigWrite { .. } => {
                ErrorKind::Config
            }
            Self::Io(_)
            | Self::ServerExists { .. }
            | Self::NoSuchServer { .. }
            | Self::ChannelClosed { .. }
            | Self::NotStarted
            | Self::AlreadyStarted
            | Self::ShutDown
            | Self::UnsupportedTransport(_) => ErrorKind::Io,
        }
    }

    #[must_use]
    pub fn insecure_directory(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InsecureDirectory {
            path: path.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias using the core [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
