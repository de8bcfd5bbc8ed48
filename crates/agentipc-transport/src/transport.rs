//! The transport facade.
//!
//! [`IpcTransport`] owns the socket directory, the selector, the reactor
//! thread, the worker pool and the registry of named servers. All registry
//! changes happen under one mutex.

use crate::callbacks::IpcCallbacks;
use crate::fs_ops::{FileKind, FileOps, RealFileOps};
use crate::policy::{self, SocketPathPolicy};
use crate::pool::{default_pool_size, WorkerPool};
use crate::reactor::{ReactorLoop, ReactorState};
use crate::selector::Selector;
use crate::server::ServerChannel;
use agentipc_core::{Error, IpcConfig, IpcType, Result};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

enum Lifecycle {
    Idle,
    Running(Box<Running>),
    ShutDown,
}

struct Running {
    dir: PathBuf,
    policy: SocketPathPolicy,
    max_message_size: usize,
    selector: Arc<Selector>,
    pool: Arc<WorkerPool>,
    reactor: ReactorLoop,
    servers: HashMap<String, Arc<ServerChannel>>,
}

/// Local IPC endpoint exposing named request/response servers.
pub struct IpcTransport {
    fs: Arc<dyn FileOps>,
    inner: Mutex<Lifecycle>,
}

impl Default for IpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_file_ops(Arc::new(RealFileOps))
    }

    /// Use `fs` for every directory and socket file operation.
    #[must_use]
    pub fn with_file_ops(fs: Arc<dyn FileOps>) -> Self {
        Self {
            fs,
            inner: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Prepare the socket directory and start the reactor and workers.
    ///
    /// # Errors
    /// `UnsupportedTransport` for anything but Unix sockets, a path or
    /// security error for the directory, `AlreadyStarted` or `ShutDown` if
    /// the transport is not fresh. On error nothing is left running.
    pub fn start(&self, config: &IpcConfig) -> Result<()> {
        let mut inner = self.lock();
        match &*inner {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(Error::AlreadyStarted),
            Lifecycle::ShutDown => return Err(Error::ShutDown),
        }

        if config.ipc_type != IpcType::UnixSocket {
            return Err(Error::UnsupportedTransport(
                config.ipc_type.as_str().to_string(),
            ));
        }

        let dir = policy::resolve_directory(&config.socket_dir)?;
        let policy = SocketPathPolicy::new(config.dir_mode, Arc::clone(&self.fs));
        policy.prepare_directory(&dir)?;

        let (selector, source) = Selector::open()?;
        let pool = Arc::new(WorkerPool::new(
            config.worker_threads.unwrap_or_else(default_pool_size),
        )?);
        let reactor =
            ReactorLoop::new(Arc::clone(&selector), Arc::clone(&pool), Box::new(source));
        if let Err(e) = reactor.start() {
            let _ = pool.shutdown();
            return Err(e);
        }

        tracing::info!(
            dir = %dir.display(),
            mode = config.dir_mode.as_str(),
            workers = pool.size(),
            "IPC transport started"
        );

        *inner = Lifecycle::Running(Box::new(Running {
            dir,
            policy,
            max_message_size: config.max_message_size,
            selector,
            pool,
            reactor,
            servers: HashMap::new(),
        }));
        Ok(())
    }

    /// Open a named server whose connections are handled by `callbacks`.
    ///
    /// A stale socket file from an earlier run is replaced. On error no
    /// socket file and no registry entry remain. Once the reactor has stopped
    /// on its own nothing would accept on a new socket, so this fails with
    /// `ShutDown`.
    pub fn create_server(&self, name: &str, callbacks: Arc<dyn IpcCallbacks>) -> Result<()> {
        if !policy::validate_name(name) {
            return Err(Error::InvalidName {
                name: name.to_string(),
            });
        }

        let mut inner = self.lock();
        let running = running_mut(&mut inner)?;
        if running.reactor.state() == ReactorState::Stopped {
            return Err(Error::ShutDown);
        }

        if running.servers.contains_key(name) {
            return Err(Error::ServerExists {
                name: name.to_string(),
            });
        }

        running.policy.verify_directory_security(&running.dir)?;
        let path = policy::socket_path(&running.dir, name)?;
        policy::check_socket_path_len(&path)?;
        self.remove_stale_socket(&path)?;

        let channel = match ServerChannel::open(
            name,
            &path,
            callbacks,
            Arc::clone(&running.selector),
            running.max_message_size,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                // Address in use means someone else holds the path; leave it
                let in_use =
                    matches!(&e, Error::Io(source) if source.kind() == io::ErrorKind::AddrInUse);
                if !in_use {
                    let _ = self.remove_if_present(&path);
                }
                return Err(e);
            }
        };

        if let Err(e) = running.policy.verify_owner(&path, "Socket file") {
            let _ = channel.close();
            let _ = self.remove_if_present(&path);
            return Err(e);
        }

        running.servers.insert(name.to_string(), channel);
        tracing::info!(server = %name, path = %path.display(), "IPC server created");
        Ok(())
    }

    /// Close the named server and delete its socket file.
    ///
    /// The file is deleted even if closing fails; the first error wins.
    pub fn destroy_server(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let running = running_mut(&mut inner)?;

        let Some(channel) = running.servers.remove(name) else {
            return Err(Error::NoSuchServer {
                name: name.to_string(),
            });
        };

        let closed = channel.close().map_err(Error::from);
        let removed = self.remove_if_present(channel.socket_path());
        tracing::info!(server = %name, "IPC server destroyed");
        closed.and(removed)
    }

    /// Whether a live server is registered under `name`.
    pub fn server_exists(&self, name: &str) -> bool {
        match &*self.lock() {
            Lifecycle::Running(running) => running.servers.contains_key(name),
            _ => false,
        }
    }

    /// Names of the registered servers, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match &*self.lock() {
            Lifecycle::Running(running) => running.servers.keys().cloned().collect(),
            _ => Vec::new(),
        };
        names.sort();
        names
    }

    /// Resolved socket directory while running.
    pub fn socket_dir(&self) -> Option<PathBuf> {
        match &*self.lock() {
            Lifecycle::Running(running) => Some(running.dir.clone()),
            _ => None,
        }
    }

    /// Path clients connect to for server `name`.
    pub fn socket_path(&self, name: &str) -> Result<PathBuf> {
        let inner = self.lock();
        match &*inner {
            Lifecycle::Running(running) => policy::socket_path(&running.dir, name),
            Lifecycle::Idle => Err(Error::NotStarted),
            Lifecycle::ShutDown => Err(Error::ShutDown),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lock(), Lifecycle::Running(_))
    }

    /// Stop everything and remove the socket directory.
    ///
    /// Order: reactor, channels and connections, worker pool, then every
    /// entry of the directory (including files this process never created)
    /// and the directory itself. Cleanup continues past failures and the
    /// first error is returned. A transport that never started is left as is.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.lock();
        let running = match std::mem::replace(&mut *inner, Lifecycle::ShutDown) {
            Lifecycle::Running(running) => running,
            other => {
                *inner = other;
                return Ok(());
            }
        };
        let Running {
            dir,
            selector,
            pool,
            reactor,
            servers,
            ..
        } = *running;

        let mut first_err: Option<Error> = None;
        let mut record = |result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!(error = %e, "IPC shutdown step failed");
                first_err.get_or_insert(e);
            }
        };

        record(reactor.shutdown());
        for channel in servers.values() {
            record(channel.close().map_err(Error::from));
        }
        record(selector.close_all().map_err(Error::from));
        record(pool.shutdown());
        record(self.remove_directory(&dir));

        tracing::info!(dir = %dir.display(), "IPC transport shut down");
        first_err.map_or(Ok(()), Err)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delete a leftover socket at `path`. Anything other than a socket is
    /// refused.
    fn remove_stale_socket(&self, path: &Path) -> Result<()> {
        match self.fs.stat(path) {
            Ok(stat) if stat.kind == FileKind::Socket => {
                self.fs.remove_file(path)?;
                tracing::info!(path = %path.display(), "removed stale socket file");
                Ok(())
            }
            Ok(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path.display()),
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_if_present(&self, path: &Path) -> Result<()> {
        match self.fs.remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_directory(&self, dir: &Path) -> Result<()> {
        let mut first_err = None;

        match self.fs.list_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let removed = match self.fs.stat(&entry) {
                        Ok(stat) if stat.kind == FileKind::Directory => {
                            self.fs.remove_dir(&entry)
                        }
                        _ => self.fs.remove_file(&entry),
                    };
                    if let Err(e) = removed {
                        tracing::warn!(
                            path = %entry.display(),
                            error = %e,
                            "failed to remove directory entry"
                        );
                        first_err.get_or_insert(Error::from(e));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                first_err.get_or_insert(Error::from(e));
            }
        }

        if let Err(e) = self.fs.remove_dir(dir) {
            if e.kind() != io::ErrorKind::NotFound {
                first_err.get_or_insert(Error::from(e));
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "IPC transport shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for IpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcTransport")
            .field("running", &self.is_running())
            .field("servers", &self.server_names())
            .finish_non_exhaustive()
    }
}

fn running_mut(inner: &mut Lifecycle) -> Result<&mut Running> {
    match inner {
        Lifecycle::Running(running) => Ok(&mut **running),
        Lifecycle::Idle => Err(Error::NotStarted),
        Lifecycle::ShutDown => Err(Error::ShutDown),
    }
}
