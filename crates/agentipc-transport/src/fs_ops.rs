//! Filesystem operations behind the socket directory policy.
//!
//! The policy and the transport never touch `std::fs` directly; they go
//! through [`FileOps`] so tests can substitute ownership and permission
//! answers that cannot be produced on a real filesystem without root.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Type of a filesystem entry, without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Socket,
    Symlink,
    File,
    Other,
}

/// Ownership and permission snapshot of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Permission bits only (`mode & 0o7777`).
    pub mode: u32,
    pub uid: u32,
}

/// Filesystem collaborator used by the transport.
pub trait FileOps: Send + Sync + std::fmt::Debug {
    /// Stat `path` without following symlinks.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Create a single directory with the given mode (subject to the umask).
    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// List the entries of a directory.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Effective uid of the running process.
    fn current_uid(&self) -> u32;

    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }
}

/// [`FileOps`] backed by the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFileOps;

impl FileOps for RealFileOps {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = fs::symlink_metadata(path)?;
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_socket() {
            FileKind::Socket
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };

        Ok(FileStat {
            kind,
            mode: metadata.permissions().mode() & 0o7777,
            uid: metadata.uid(),
        })
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(path)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn current_uid(&self) -> u32 {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() }
    }
}
