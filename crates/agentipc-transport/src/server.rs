use crate::callbacks::IpcCallbacks;
use crate::connection::ClientConnection;
use crate::policy;
use crate::selector::{Attachment, SelectionKey, Selector};
use agentipc_core::{Error, Result};
use mio::net::UnixListener;
use mio::Interest;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A named listening socket registered with the selector.
///
/// Accepting happens on the reactor thread; every accepted connection
/// inherits this server's callbacks and message limit.
pub struct ServerChannel {
    name: String,
    path: PathBuf,
    callbacks: Arc<dyn IpcCallbacks>,
    selector: Arc<Selector>,
    key: SelectionKey,
    max_message_size: usize,
    listener: Mutex<Option<UnixListener>>,
}

impl ServerChannel {
    /// Bind `path` and register the listener for accept readiness.
    ///
    /// # Errors
    /// `PathTooLong` if the path does not fit in a socket address, otherwise
    /// the bind or registration failure (for example address in use).
    pub fn open(
        name: &str,
        path: &Path,
        callbacks: Arc<dyn IpcCallbacks>,
        selector: Arc<Selector>,
        max_message_size: usize,
    ) -> Result<Arc<Self>> {
        policy::check_socket_path_len(path)?;

        let listener = UnixListener::bind(path)?;
        let key = SelectionKey::new(selector.next_token());
        let channel = Arc::new(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            callbacks,
            selector: Arc::clone(&selector),
            key,
            max_message_size,
            listener: Mutex::new(Some(listener)),
        });

        selector.publish(Attachment::Accept(Arc::clone(&channel)));
        let registered = {
            let mut guard = channel.lock_listener();
            match guard.as_mut() {
                Some(listener) => {
                    selector.register(listener, channel.key.token(), Interest::READABLE)
                }
                None => Err(io::Error::other("listener dropped during open")),
            }
        };
        if let Err(e) = registered {
            selector.cancel(channel.key.token());
            channel.key.invalidate();
            channel.lock_listener().take();
            return Err(e.into());
        }

        tracing::debug!(server = %name, path = %path.display(), "server channel open");
        Ok(channel)
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when nothing is pending. A closed channel is an
    /// error rather than a silent `None` since close can race an accept event
    /// that was already dispatched.
    pub fn accept(&self) -> Result<Option<Arc<ClientConnection>>> {
        let guard = self.lock_listener();
        let Some(listener) = guard.as_ref() else {
            return Err(Error::ChannelClosed {
                name: self.name.clone(),
            });
        };

        match listener.accept() {
            Ok((stream, _addr)) => {
                let conn = ClientConnection::open(
                    stream,
                    &self.name,
                    Arc::clone(&self.callbacks),
                    Arc::clone(&self.selector),
                    self.max_message_size,
                )?;
                Ok(Some(conn))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop listening. Idempotent; the socket file stays on disk.
    pub fn close(&self) -> io::Result<()> {
        self.key.invalidate();
        self.selector.cancel(self.key.token());

        let Some(mut listener) = self.lock_listener().take() else {
            return Ok(());
        };
        let result = self.selector.deregister(&mut listener);
        tracing::debug!(server = %self.name, "server channel closed");
        result
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.key.is_valid() && self.lock_listener().is_some()
    }

    pub fn callbacks(&self) -> &Arc<dyn IpcCallbacks> {
        &self.callbacks
    }

    pub fn key(&self) -> &SelectionKey {
        &self.key
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<UnixListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentipc_core::ErrorKind;
    use tempfile::tempdir;

    fn echo() -> Arc<dyn IpcCallbacks> {
        Arc::new(|req: &[u8]| Ok(Some(req.to_vec())))
    }

    #[test]
    fn test_open_accept_close() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sock-svc");
        let (selector, _source) = Selector::open().unwrap();

        let channel =
            ServerChannel::open("svc", &path, echo(), Arc::clone(&selector), 1024).unwrap();
        assert!(channel.is_open());
        assert_eq!(channel.name(), "svc");
        assert_eq!(channel.socket_path(), path);
        assert!(path.exists());
        assert!(matches!(
            selector.attachment(channel.key().token()),
            Some(Attachment::Accept(_))
        ));

        // Nothing pending yet
        assert!(channel.accept().unwrap().is_none());

        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(conn) = channel.accept().unwrap() {
                accepted = Some(conn);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let conn = accepted.expect("connection accepted");
        assert_eq!(conn.server_name(), "svc");
        assert!(conn.key().is_valid());
        assert_eq!(selector.len(), 2);

        channel.close().unwrap();
        channel.close().unwrap();
        assert!(!channel.is_open());
        assert!(selector.attachment(channel.key().token()).is_none());
        // Close leaves the file for the owner of the directory to remove
        assert!(path.exists());

        let err = channel.accept().unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { .. }));
    }

    #[test]
    fn test_open_rejects_long_path() {
        let tmp = tempdir().unwrap();
        let name = "n".repeat(policy::max_socket_path_len());
        let path = tmp.path().join(&name);
        let (selector, _source) = Selector::open().unwrap();

        let err = ServerChannel::open("svc", &path, echo(), selector, 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Path);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_address_in_use() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sock-svc");
        let (selector, _source) = Selector::open().unwrap();

        let _first =
            ServerChannel::open("svc", &path, echo(), Arc::clone(&selector), 1024).unwrap();
        let err = ServerChannel::open("svc", &path, echo(), selector, 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
