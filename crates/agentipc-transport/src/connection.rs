//! One accepted client connection.
//!
//! A connection alternates between two modes. In `Reading` it waits for
//! readable readiness, drains the socket and hands the bytes to the server's
//! callbacks. If the callbacks produce a response it switches to `Writing`
//! until the response is fully flushed, then goes back to `Reading`.
//!
//! Work on a connection runs on a worker thread. The reactor marks the key
//! in flight before submitting; the connection clears the mark right before
//! it re-arms interest, so at most one work item is outstanding and no
//! readiness edge is lost.

use crate::callbacks::IpcCallbacks;
use crate::selector::{Attachment, SelectionKey, Selector};
use agentipc_core::{Error, Result};
use mio::net::UnixStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Size of the chunk buffer each read drains into.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Result of [`ClientConnection::handle_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Peer closed without sending anything; the connection is closed.
    Closed,
    /// Spurious readiness, nothing to read.
    Idle,
    /// Callbacks consumed the request without a response.
    NoResponse,
    /// A response is queued for writing.
    ResponseQueued,
}

/// Result of [`ClientConnection::handle_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Key was no longer valid, nothing written.
    Skipped,
    /// Socket buffer filled up, more to write.
    Partial,
    /// Whole response written, reading again.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Reading,
    Writing,
}

struct ConnState {
    stream: Option<UnixStream>,
    mode: Mode,
    chunk: Box<[u8]>,
    request: Vec<u8>,
    response: Vec<u8>,
    written: usize,
}

pub struct ClientConnection {
    server: String,
    key: SelectionKey,
    selector: Arc<Selector>,
    callbacks: Arc<dyn IpcCallbacks>,
    max_message_size: usize,
    state: Mutex<ConnState>,
}

impl ClientConnection {
    /// Wrap an accepted stream, publish it and register read interest.
    pub(crate) fn open(
        stream: UnixStream,
        server: &str,
        callbacks: Arc<dyn IpcCallbacks>,
        selector: Arc<Selector>,
        max_message_size: usize,
    ) -> Result<Arc<Self>> {
        let key = SelectionKey::new(selector.next_token());
        let conn = Arc::new(Self {
            server: server.to_string(),
            key,
            selector: Arc::clone(&selector),
            callbacks,
            max_message_size,
            state: Mutex::new(ConnState {
                stream: Some(stream),
                mode: Mode::Reading,
                chunk: vec![0; READ_CHUNK_SIZE].into_boxed_slice(),
                request: Vec::new(),
                response: Vec::new(),
                written: 0,
            }),
        });

        selector.publish(Attachment::Connection(Arc::clone(&conn)));
        let registered = {
            let mut state = conn.lock_state();
            match state.stream.as_mut() {
                Some(stream) => selector.register(stream, conn.key.token(), Interest::READABLE),
                None => Err(io::Error::other("stream dropped during open")),
            }
        };
        if let Err(e) = registered {
            conn.key.invalidate();
            selector.cancel(conn.key.token());
            conn.lock_state().stream = None;
            return Err(e.into());
        }

        tracing::debug!(server = %server, token = conn.key.token().0, "accepted connection");
        Ok(conn)
    }

    /// Drain the socket and run the callbacks once on what was read.
    pub fn handle_read(&self) -> Result<ReadOutcome> {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let Some(stream) = state.stream.as_mut() else {
            return Ok(ReadOutcome::Closed);
        };

        state.request.clear();
        let mut eof = false;
        loop {
            match stream.read(&mut state.chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    if state.request.len() + n > self.max_message_size {
                        let _ = self.close_state(state);
                        return Err(Error::RequestTooLarge {
                            max: self.max_message_size,
                        });
                    }
                    state.request.extend_from_slice(&state.chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = self.close_state(state);
                    return Err(e.into());
                }
            }
        }

        if state.request.is_empty() {
            if eof {
                tracing::debug!(server = %self.server, "peer closed connection");
                let _ = self.close_state(state);
                return Ok(ReadOutcome::Closed);
            }
            self.rearm(state, Interest::READABLE)?;
            return Ok(ReadOutcome::Idle);
        }

        // A peer that sent data and then shut down its write half still gets
        // its response; the EOF shows up again on the next read.
        let response = match self.callbacks.data_received(&state.request) {
            Ok(response) => response,
            Err(e) => {
                let _ = self.close_state(state);
                return Err(e.into());
            }
        };
        state.request.clear();

        match response {
            None => {
                self.rearm(state, Interest::READABLE)?;
                Ok(ReadOutcome::NoResponse)
            }
            Some(bytes) if bytes.len() > self.max_message_size => {
                let _ = self.close_state(state);
                Err(Error::ResponseTooLarge {
                    size: bytes.len(),
                    max: self.max_message_size,
                })
            }
            Some(bytes) => {
                state.response = bytes;
                state.written = 0;
                state.mode = Mode::Writing;
                self.rearm(state, Interest::WRITABLE)?;
                Ok(ReadOutcome::ResponseQueued)
            }
        }
    }

    /// Write as much of the queued response as the socket takes.
    pub fn handle_write(&self) -> Result<WriteOutcome> {
        if !self.key.is_valid() {
            return Ok(WriteOutcome::Skipped);
        }

        let mut guard = self.lock_state();
        let state = &mut *guard;

        let Some(stream) = state.stream.as_mut() else {
            return Ok(WriteOutcome::Skipped);
        };

        while state.written < state.response.len() {
            match stream.write(&state.response[state.written..]) {
                Ok(0) => {
                    let _ = self.close_state(state);
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => state.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = self.close_state(state);
                    return Err(e.into());
                }
            }
        }

        if state.written < state.response.len() {
            self.rearm(state, Interest::WRITABLE)?;
            return Ok(WriteOutcome::Partial);
        }

        state.response = Vec::new();
        state.written = 0;
        state.mode = Mode::Reading;
        self.rearm(state, Interest::READABLE)?;
        Ok(WriteOutcome::Complete)
    }

    /// Work item run on the pool for one readiness event.
    pub fn service(&self) {
        let mode = self.lock_state().mode;
        let result = match mode {
            Mode::Reading => self.handle_read().map(|outcome| {
                tracing::trace!(server = %self.server, ?outcome, "read handled");
            }),
            Mode::Writing => self.handle_write().map(|outcome| {
                tracing::trace!(server = %self.server, ?outcome, "write handled");
            }),
        };

        if let Err(e) = result {
            tracing::warn!(
                server = %self.server,
                token = self.key.token().0,
                error = %e,
                "connection closed after error"
            );
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.lock_state();
        self.close_state(&mut state)
    }

    pub fn key(&self) -> &SelectionKey {
        &self.key
    }

    /// Name of the server that accepted this connection.
    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn is_open(&self) -> bool {
        self.lock_state().stream.is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_state(&self, state: &mut ConnState) -> io::Result<()> {
        self.key.invalidate();
        self.selector.cancel(self.key.token());
        state.request = Vec::new();
        state.response = Vec::new();
        state.written = 0;

        match state.stream.take() {
            Some(mut stream) => self.selector.deregister(&mut stream),
            None => Ok(()),
        }
    }

    /// Release the in-flight claim, then switch interest and wake the reactor.
    fn rearm(&self, state: &mut ConnState, interest: Interest) -> Result<()> {
        let Some(stream) = state.stream.as_mut() else {
            return Ok(());
        };

        self.key.finish_work();
        if let Err(e) = self.selector.reregister(stream, self.key.token(), interest) {
            let _ = self.close_state(state);
            return Err(e.into());
        }
        self.selector.notify();
        Ok(())
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("server", &self.server)
            .field("token", &self.key.token())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::Shutdown;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A connected pair: the server half wrapped in a connection, the client
    /// half a plain blocking std stream.
    fn pair(
        callbacks: Arc<dyn IpcCallbacks>,
        max: usize,
    ) -> (Arc<ClientConnection>, std::os::unix::net::UnixStream, Arc<Selector>) {
        let (selector, _source) = Selector::open().unwrap();
        let (server_half, client_half) = std::os::unix::net::UnixStream::pair().unwrap();
        server_half.set_nonblocking(true).unwrap();
        let stream = UnixStream::from_std(server_half);
        let conn =
            ClientConnection::open(stream, "svc", callbacks, Arc::clone(&selector), max).unwrap();
        client_half
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (conn, client_half, selector)
    }

    fn counting_echo(count: Arc<AtomicUsize>) -> Arc<dyn IpcCallbacks> {
        Arc::new(move |req: &[u8]| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(Some(req.to_vec()))
        })
    }

    #[test]
    fn test_request_then_eof_gets_one_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let callbacks: Arc<dyn IpcCallbacks> = Arc::new(move |req: &[u8]| {
            record.lock().unwrap().push(req.to_vec());
            Ok(Some(b"pong".to_vec()))
        });
        let (conn, mut client, _selector) = pair(callbacks, 1024);

        client.write_all(b"ping").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::ResponseQueued);
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"ping".to_vec()]);

        assert_eq!(conn.handle_write().unwrap(), WriteOutcome::Complete);
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");

        // The persisted EOF closes the connection without another callback
        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::Closed);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!conn.is_open());
        assert!(!conn.key().is_valid());
    }

    #[test]
    fn test_eof_without_data_skips_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let (conn, client, selector) = pair(counting_echo(Arc::clone(&count)), 1024);
        assert_eq!(selector.len(), 1);

        client.shutdown(Shutdown::Write).unwrap();
        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::Closed);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(selector.is_empty());
    }

    #[test]
    fn test_spurious_readiness_is_idle() {
        let count = Arc::new(AtomicUsize::new(0));
        let (conn, _client, _selector) = pair(counting_echo(Arc::clone(&count)), 1024);

        conn.key().try_begin_work();
        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::Idle);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!conn.key().is_in_flight());
        assert!(conn.is_open());
    }

    #[test]
    fn test_no_response_keeps_connection_open() {
        let callbacks: Arc<dyn IpcCallbacks> = Arc::new(|_: &[u8]| Ok(None));
        let (conn, mut client, _selector) = pair(callbacks, 1024);

        client.write_all(b"fire-and-forget").unwrap();
        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::NoResponse);
        assert!(conn.is_open());

        client.write_all(b"again").unwrap();
        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::NoResponse);
        assert!(conn.is_open());
    }

    #[test]
    fn test_oversized_response_closes_without_writing() {
        let callbacks: Arc<dyn IpcCallbacks> = Arc::new(|_: &[u8]| Ok(Some(vec![b'x'; 64])));
        let (conn, mut client, _selector) = pair(callbacks, 16);

        client.write_all(b"hi").unwrap();
        let err = conn.handle_read().unwrap_err();
        assert!(matches!(err, Error::ResponseTooLarge { size: 64, max: 16 }));
        assert!(!conn.is_open());

        // Peer sees EOF and no bytes
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_request_closes() {
        let count = Arc::new(AtomicUsize::new(0));
        let (conn, mut client, _selector) = pair(counting_echo(Arc::clone(&count)), 8);

        client.write_all(&[b'a'; 32]).unwrap();
        let err = conn.handle_read().unwrap_err();
        assert!(matches!(err, Error::RequestTooLarge { max: 8 }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!conn.is_open());
    }

    #[test]
    fn test_callback_error_closes() {
        let callbacks: Arc<dyn IpcCallbacks> =
            Arc::new(|_: &[u8]| Err(io::Error::other("bad request")));
        let (conn, mut client, _selector) = pair(callbacks, 1024);

        client.write_all(b"x").unwrap();
        let err = conn.handle_read().unwrap_err();
        assert!(err.to_string().contains("bad request"));
        assert!(!conn.is_open());
    }

    #[test]
    fn test_write_skipped_after_close() {
        let count = Arc::new(AtomicUsize::new(0));
        let (conn, mut client, _selector) = pair(counting_echo(count), 1024);

        client.write_all(b"ping").unwrap();
        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::ResponseQueued);

        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(conn.handle_write().unwrap(), WriteOutcome::Skipped);
    }

    #[test]
    fn test_large_response_flushes_in_parts() {
        let big = vec![b'z'; 1024 * 1024];
        let response = big.clone();
        let callbacks: Arc<dyn IpcCallbacks> = Arc::new(move |_: &[u8]| Ok(Some(response.clone())));
        let (conn, mut client, _selector) = pair(callbacks, 2 * 1024 * 1024);

        client.write_all(b"go").unwrap();
        assert_eq!(conn.handle_read().unwrap(), ReadOutcome::ResponseQueued);

        let reader = std::thread::spawn(move || {
            let mut buf = vec![0u8; 1024 * 1024];
            client.read_exact(&mut buf).unwrap();
            buf
        });

        loop {
            match conn.handle_write().unwrap() {
                WriteOutcome::Complete => break,
                WriteOutcome::Partial => std::thread::sleep(Duration::from_millis(1)),
                WriteOutcome::Skipped => panic!("key invalidated"),
            }
        }
        assert_eq!(reader.join().unwrap(), big);
    }

    #[test]
    fn test_service_follows_mode() {
        let count = Arc::new(AtomicUsize::new(0));
        let (conn, mut client, _selector) = pair(counting_echo(Arc::clone(&count)), 1024);

        client.write_all(b"abc").unwrap();
        conn.service();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        conn.service();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"abc");
    }
}
