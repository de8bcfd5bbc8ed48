//! Socket directory and socket path rules.
//!
//! Every server socket lives in one directory per agent instance. The
//! directory must be a real directory owned by the current user with exactly
//! the configured permission bits. The checks run against live metadata on
//! every call and fail closed when metadata cannot be read.

use crate::fs_ops::{FileKind, FileOps};
use agentipc_core::{DirMode, Error, Result};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Prefix of every server socket file name.
pub const SOCKET_PREFIX: &str = "sock-";

/// Allowed server names: no separators, no leading dot, at most 64 chars.
const NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$";

fn name_regex() -> Option<&'static regex_lite::Regex> {
    static NAME_RE: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    NAME_RE
        .get_or_init(|| regex_lite::Regex::new(NAME_PATTERN).ok())
        .as_ref()
}

/// Returns true if `name` may be used as a server name.
#[must_use]
pub fn validate_name(name: &str) -> bool {
    name_regex().is_some_and(|re| re.is_match(name))
}

/// Longest socket path the platform accepts, NUL terminator included.
#[must_use]
pub fn max_socket_path_len() -> usize {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len()
}

/// Fail if `path` does not fit in `sockaddr_un.sun_path`.
pub fn check_socket_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().as_bytes().len();
    let max = max_socket_path_len();
    if len + 1 > max {
        return Err(Error::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: max - 1,
        });
    }
    Ok(())
}

/// Make `base` absolute and lexically normalised.
///
/// Relative paths are joined onto the current working directory; `.` is
/// dropped and `..` pops one component. Symlinks are not resolved here, the
/// security check rejects them later.
pub fn resolve_directory(base: &Path) -> Result<PathBuf> {
    if base.as_os_str().is_empty() {
        return Err(Error::invalid_path(base, "empty path"));
    }
    if base.as_os_str().as_bytes().contains(&0) {
        return Err(Error::invalid_path(base, "path contains a NUL byte"));
    }

    let absolute = if base.is_absolute() {
        base.to_path_buf()
    } else {
        let cwd = std::env::current_dir().map_err(|e| {
            Error::invalid_path(base, format!("cannot determine working directory: {e}"))
        })?;
        cwd.join(base)
    };

    let mut normalised = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other.as_os_str()),
        }
    }
    Ok(normalised)
}

/// Socket path of server `name` inside `dir`.
pub fn socket_path(dir: &Path, name: &str) -> Result<PathBuf> {
    if !validate_name(name) {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(dir.join(format!("{SOCKET_PREFIX}{name}")))
}

/// Directory rules bound to a configured mode and a filesystem.
#[derive(Debug, Clone)]
pub struct SocketPathPolicy {
    mode: DirMode,
    fs: Arc<dyn FileOps>,
}

impl SocketPathPolicy {
    #[must_use]
    pub fn new(mode: DirMode, fs: Arc<dyn FileOps>) -> Self {
        Self { mode, fs }
    }

    #[must_use]
    pub fn mode(&self) -> DirMode {
        self.mode
    }

    #[must_use]
    pub fn file_ops(&self) -> &Arc<dyn FileOps> {
        &self.fs
    }

    /// Create `dir` if it is absent, then verify it.
    ///
    /// Parents are created with default permissions. The directory itself is
    /// created with the configured mode and chmod-ed afterwards so the umask
    /// has no effect on the final bits. An existing directory is never
    /// chmod-ed; it has to be correct already.
    pub fn prepare_directory(&self, dir: &Path) -> Result<()> {
        if !self.fs.exists(dir) {
            if let Some(parent) = dir.parent() {
                self.fs.create_dir_all(parent)?;
            }
            match self.fs.create_dir(dir, self.mode.bits()) {
                Ok(()) => {
                    self.fs.set_mode(dir, self.mode.bits())?;
                    tracing::info!(
                        path = %dir.display(),
                        mode = %format!("{:o}", self.mode.bits()),
                        "created socket directory"
                    );
                }
                // Another process won the race; it still has to pass the checks
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.verify_directory_security(dir)
    }

    /// Check type, mode and owner of the socket directory.
    pub fn verify_directory_security(&self, dir: &Path) -> Result<()> {
        let stat = self.fs.stat(dir).map_err(|e| {
            Error::insecure_directory(dir, format!("cannot read metadata: {e}"))
        })?;

        match stat.kind {
            FileKind::Directory => {}
            FileKind::Symlink => {
                return Err(Error::insecure_directory(dir, "path is a symlink"));
            }
            _ => return Err(Error::insecure_directory(dir, "not a directory")),
        }

        let expected = self.mode.bits();
        if stat.mode != expected {
            return Err(Error::insecure_directory(
                dir,
                format!("mode is {:o}, expected {expected:o}", stat.mode),
            ));
        }

        self.verify_owner(dir, "Socket directory")
    }

    /// Fail unless `path` is owned by the current user.
    pub fn verify_owner(&self, path: &Path, what: &str) -> Result<()> {
        let stat = self.fs.stat(path).map_err(|e| Error::InsecureOwner {
            what: what.to_string(),
            path: path.to_path_buf(),
            reason: format!("cannot read owner: {e}"),
        })?;

        let uid = self.fs.current_uid();
        if stat.uid != uid {
            return Err(Error::InsecureOwner {
                what: what.to_string(),
                path: path.to_path_buf(),
                reason: format!("owned by uid {}, expected {uid}", stat.uid),
            });
        }
        Ok(())
    }
}
