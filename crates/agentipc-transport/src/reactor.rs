//! The selector thread.
//!
//! One thread blocks in [`EventSource::select`] and routes every readiness
//! event by its token: listeners are drained of pending connections right
//! here, connections are handed to the worker pool. The thread never reads
//! or writes client data itself.

use crate::pool::WorkerPool;
use crate::selector::{Attachment, EventSource, ReadinessEvent, Selector, WAKE_TOKEN};
use crate::server::ServerChannel;
use agentipc_core::{Error, Result};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const STOPPED: u8 = 3;

/// Wait before accepting again on a listener that hit descriptor exhaustion.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Consecutive per-connection accept failures tolerated in one drain.
const MAX_ACCEPT_FAILURES: usize = 32;

/// Lifecycle of a [`ReactorLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl ReactorState {
    fn from_u8(value: u8) -> Self {
        match value {
            CREATED => Self::Created,
            RUNNING => Self::Running,
            SHUTTING_DOWN => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

pub struct ReactorLoop {
    state: Arc<AtomicU8>,
    selector: Arc<Selector>,
    pool: Arc<WorkerPool>,
    source: Mutex<Option<Box<dyn EventSource>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReactorLoop {
    pub fn new(
        selector: Arc<Selector>,
        pool: Arc<WorkerPool>,
        source: Box<dyn EventSource>,
    ) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(CREATED)),
            selector,
            pool,
            source: Mutex::new(Some(source)),
            thread: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ReactorState {
        ReactorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Spawn the reactor thread. Only valid once, from `Created`.
    pub fn start(&self) -> Result<()> {
        if let Err(current) =
            self.state
                .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(if current == RUNNING {
                Error::AlreadyStarted
            } else {
                Error::ShutDown
            });
        }

        let Some(source) = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            self.state.store(STOPPED, Ordering::Release);
            return Err(Error::ShutDown);
        };

        let state = Arc::clone(&self.state);
        let selector = Arc::clone(&self.selector);
        let pool = Arc::clone(&self.pool);
        let spawned = thread::Builder::new()
            .name("agentipc-reactor".into())
            .spawn(move || run(&state, &selector, &pool, source));

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                tracing::debug!("reactor started");
                Ok(())
            }
            Err(e) => {
                self.state.store(STOPPED, Ordering::Release);
                Err(Error::Io(io::Error::new(
                    e.kind(),
                    format!("failed to spawn reactor thread: {e}"),
                )))
            }
        }
    }

    /// Stop the loop and join the thread. Idempotent; a loop that never
    /// started just moves to `Stopped`.
    pub fn shutdown(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(CREATED, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(());
        }

        let _ = self.state.compare_exchange(
            RUNNING,
            SHUTTING_DOWN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.selector.notify();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let joined = handle.map_or(Ok(()), JoinHandle::join);
        self.state.store(STOPPED, Ordering::Release);

        joined.map_err(|_| Error::Io(io::Error::other("reactor thread panicked")))
    }
}

impl std::fmt::Debug for ReactorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorLoop")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn run(
    state: &AtomicU8,
    selector: &Selector,
    pool: &Arc<WorkerPool>,
    mut source: Box<dyn EventSource>,
) {
    let mut events = Vec::new();
    // Listeners that still have queued connections but ran out of descriptors
    let mut backlog: Vec<Arc<ServerChannel>> = Vec::new();

    while state.load(Ordering::Acquire) == RUNNING {
        events.clear();
        let timeout = (!backlog.is_empty()).then_some(ACCEPT_RETRY_DELAY);
        match source.select(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "select failed, stopping reactor");
                break;
            }
        }

        if state.load(Ordering::Acquire) != RUNNING {
            break;
        }

        backlog.retain(|server| drain_accepts(server) == Drain::Retry);
        for event in &events {
            if let Some(server) = dispatch(event, selector, pool) {
                if !backlog.iter().any(|queued| Arc::ptr_eq(queued, &server)) {
                    backlog.push(server);
                }
            }
        }
    }

    state.store(STOPPED, Ordering::Release);
    tracing::debug!("reactor stopped");
}

/// Route one event. Returns the listener if its pending connections have to
/// be accepted again later.
fn dispatch(
    event: &ReadinessEvent,
    selector: &Selector,
    pool: &Arc<WorkerPool>,
) -> Option<Arc<ServerChannel>> {
    if event.token == WAKE_TOKEN {
        return None;
    }

    // Cancelled between readiness and dispatch
    let Some(attachment) = selector.attachment(event.token) else {
        tracing::trace!(token = event.token.0, "event for unknown token");
        return None;
    };

    match attachment {
        Attachment::Accept(server) => match drain_accepts(&server) {
            Drain::Empty => None,
            Drain::Retry => Some(server),
        },
        Attachment::Connection(conn) => {
            let key = conn.key();
            if !key.is_valid() || !key.try_begin_work() {
                return None;
            }

            let job = Arc::clone(&conn);
            if let Err(e) = pool.execute(move || job.service()) {
                key.finish_work();
                tracing::warn!(
                    server = %conn.server_name(),
                    error = %e,
                    "could not submit connection work"
                );
            }
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    /// Nothing left to accept, or the listener is closed.
    Empty,
    /// Connections may still be queued; no new edge will announce them.
    Retry,
}

/// Accept until the listener reports nothing pending.
///
/// A failure that concerns one connection (aborted handshake, failed
/// registration) is skipped. Running out of descriptors or kernel memory
/// leaves the rest of the queue for a later retry.
fn drain_accepts(server: &ServerChannel) -> Drain {
    let mut failures = 0;
    loop {
        match server.accept() {
            Ok(Some(_conn)) => failures = 0,
            Ok(None) | Err(Error::ChannelClosed { .. }) => return Drain::Empty,
            Err(e) if is_resource_exhaustion(&e) => {
                tracing::warn!(server = %server.name(), error = %e, "accept deferred");
                return Drain::Retry;
            }
            Err(e) => {
                tracing::warn!(server = %server.name(), error = %e, "accept failed");
                failures += 1;
                if failures >= MAX_ACCEPT_FAILURES {
                    return Drain::Retry;
                }
            }
        }
    }
}

fn is_resource_exhaustion(err: &Error) -> bool {
    let Error::Io(source) = err else {
        return false;
    };
    matches!(
        source.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
