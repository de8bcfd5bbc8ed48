use crate::error::{Error, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default cap on a single request or response, in bytes (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Kind of local transport the agent exposes.
///
/// Only `UnixSocket` is served by this workspace; the other kinds exist so a
/// config written for a different platform is rejected with a clear error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IpcType {
    #[default]
    UnixSocket,
    TcpSocket,
    WindowsPipes,
}

impl IpcType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnixSocket => "unix-socket",
            Self::TcpSocket => "tcp-socket",
            Self::WindowsPipes => "windows-pipes",
        }
    }
}

/// Who may access the socket directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DirMode {
    /// `rwx------`
    #[default]
    Owner,
    /// `rwxrwx---`
    OwnerGroup,
}

impl DirMode {
    /// Permission bits the socket directory must carry.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::Owner => 0o700,
            Self::OwnerGroup => 0o770,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::OwnerGroup => "owner-group",
        }
    }
}

/// Resolved IPC configuration handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpcConfig {
    /// Transport kind in effect.
    #[serde(rename = "type", default)]
    pub ipc_type: IpcType,

    /// Directory holding one socket file per named server.
    #[serde(default = "paths::default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Required permission mode of the socket directory.
    #[serde(default)]
    pub dir_mode: DirMode,

    /// Largest request or response accepted on a connection.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Worker pool size; `None` picks a size from the available cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            ipc_type: IpcType::default(),
            socket_dir: paths::default_socket_dir(),
            dir_mode: DirMode::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            worker_threads: None,
        }
    }
}

impl IpcConfig {
    /// Create a new config using the given socket directory.
    #[must_use]
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            ..Default::default()
        }
    }

    /// Set the directory mode.
    #[must_use]
    pub fn with_dir_mode(mut self, mode: DirMode) -> Self {
        self.dir_mode = mode;
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Set the worker pool size.
    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Set the transport kind.
    #[must_use]
    pub fn with_type(mut self, ipc_type: IpcType) -> Self {
        self.ipc_type = ipc_type;
        self
    }

    /// Load a config file written as JSON.
    ///
    /// Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the config at `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist this config, replacing any previous file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |source: std::io::Error| Error::ConfigWrite {
            path: path.to_path_buf(),
            source,
        };

        let mut json =
            serde_json::to_vec_pretty(self).map_err(|e| write_err(std::io::Error::from(e)))?;
        json.push(b'\n');

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(write_err)?;

        // Temp file in the same directory so the rename stays on one filesystem
        let temp_path = parent.join(format!(
            ".{}.tmp.{}",
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("ipc.json"),
            std::process::id()
        ));

        let written = File::create(&temp_path).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&temp_path, path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(write_err(e));
        }

        Ok(())
    }
}
