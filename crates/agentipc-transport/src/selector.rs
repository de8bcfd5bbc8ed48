//! Readiness multiplexing over mio.
//!
//! The [`Selector`] owns the registration side (a cloned mio `Registry`, the
//! wakeup `Waker` and the table of attachments) and is shared by the reactor,
//! the workers and the facade. The blocking side lives in an [`EventSource`]
//! owned by the reactor thread alone.

use crate::connection::ClientConnection;
use crate::server::ServerChannel;
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Token reserved for [`Selector::notify`].
pub const WAKE_TOKEN: Token = Token(0);

const EVENT_CAPACITY: usize = 256;

/// One readiness notification for a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
}

impl ReadinessEvent {
    #[must_use]
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            readable: true,
            writable: false,
            read_closed: false,
        }
    }
}

/// Blocking source of readiness events for the reactor thread.
pub trait EventSource: Send {
    /// Block until at least one event, a wakeup or the timeout, then append
    /// the events. `None` waits indefinitely.
    fn select(
        &mut self,
        events: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()>;
}

/// [`EventSource`] backed by a mio `Poll`.
pub struct MioEventSource {
    poll: Poll,
    events: Events,
}

impl EventSource for MioEventSource {
    fn select(
        &mut self,
        out: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;
        out.extend(self.events.iter().map(|event| ReadinessEvent {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
        }));
        Ok(())
    }
}

impl std::fmt::Debug for MioEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioEventSource").finish_non_exhaustive()
    }
}

/// Per-registration flags shared between the reactor and a worker.
#[derive(Debug)]
pub struct SelectionKey {
    token: Token,
    valid: AtomicBool,
    in_flight: AtomicBool,
}

impl SelectionKey {
    #[must_use]
    pub fn new(token: Token) -> Self {
        Self {
            token,
            valid: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the key invalid. Returns true if it was valid before.
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Claim the key for one work item. Returns false if one is outstanding.
    pub fn try_begin_work(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the claim. Must happen before interest is re-armed.
    pub fn finish_work(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// What a token refers to.
#[derive(Clone)]
pub enum Attachment {
    Accept(Arc<ServerChannel>),
    Connection(Arc<ClientConnection>),
}

impl Attachment {
    #[must_use]
    pub fn key(&self) -> &SelectionKey {
        match self {
            Self::Accept(server) => server.key(),
            Self::Connection(conn) => conn.key(),
        }
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept(server) => write!(f, "Accept({})", server.name()),
            Self::Connection(conn) => write!(f, "Connection({})", conn.server_name()),
        }
    }
}

/// Shared registration handle.
pub struct Selector {
    registry: Registry,
    waker: Waker,
    keys: RwLock<HashMap<Token, Attachment>>,
    next_token: AtomicUsize,
}

impl Selector {
    /// Open a new poll instance and split it into the shared selector and the
    /// reactor's event source.
    pub fn open() -> io::Result<(Arc<Self>, MioEventSource)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let selector = Arc::new(Self {
            registry,
            waker,
            keys: RwLock::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        });
        let source = MioEventSource {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
        };
        Ok((selector, source))
    }

    /// Interrupt a blocked `select`.
    pub fn notify(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "failed to wake selector");
        }
    }

    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Make `attachment` resolvable by its token. Called once, before the
    /// source is registered with the OS.
    pub fn publish(&self, attachment: Attachment) {
        let token = attachment.key().token();
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, attachment);
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.register(source, token, interest)
    }

    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }

    /// Drop the attachment for `token`; later events for it are ignored.
    pub fn cancel(&self, token: Token) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }

    #[must_use]
    pub fn attachment(&self, token: Token) -> Option<Attachment> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .cloned()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered channel and connection.
    ///
    /// Keeps going past failures and returns the first one.
    pub fn close_all(&self) -> io::Result<()> {
        let attachments: Vec<Attachment> = self
            .keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, attachment)| attachment)
            .collect();

        let mut first_err = None;
        for attachment in attachments {
            let result = match &attachment {
                Attachment::Accept(server) => server.close(),
                Attachment::Connection(conn) => conn.close(),
            };
            if let Err(e) = result {
                tracing::warn!(?attachment, error = %e, "failed to close registration");
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("registrations", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_in_flight_claim() {
        let key = SelectionKey::new(Token(7));
        assert!(key.try_begin_work());
        assert!(!key.try_begin_work());
        assert!(key.is_in_flight());
        key.finish_work();
        assert!(key.try_begin_work());
    }

    #[test]
    fn test_key_invalidate_once() {
        let key = SelectionKey::new(Token(7));
        assert!(key.is_valid());
        assert!(key.invalidate());
        assert!(!key.invalidate());
        assert!(!key.is_valid());
    }

    #[test]
    fn test_tokens_skip_wake_token() {
        let (selector, _source) = Selector::open().unwrap();
        let first = selector.next_token();
        let second = selector.next_token();
        assert_ne!(first, WAKE_TOKEN);
        assert_ne!(first, second);
    }

    #[test]
    fn test_notify_wakes_select() {
        let (selector, mut source) = Selector::open().unwrap();

        let waker = Arc::clone(&selector);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.notify();
        });

        let mut events = Vec::new();
        source.select(&mut events, None).unwrap();
        handle.join().unwrap();
        assert!(events.iter().any(|e| e.token == WAKE_TOKEN));
    }

    #[test]
    fn test_cancel_unknown_token_is_noop() {
        let (selector, _source) = Selector::open().unwrap();
        selector.cancel(Token(42));
        assert!(selector.attachment(Token(42)).is_none());
        assert!(selector.is_empty());
        assert!(selector.close_all().is_ok());
    }
}
