//! Listening sockets and the acceptor reactor.
//!
//! Every plot is served on its own TCP port. One acceptor thread waits for
//! incoming connections on all of them and hands each accepted connection
//! to the worker pool together with the port's plot constructor.
//!
//! ## Removing plots
//!
//! A plot can be removed while the acceptor is in the middle of an event
//! batch that still mentions its socket. Removal therefore only closes the
//! listener and marks the record inactive; the record itself (and its slab
//! key, which doubles as the multiplexer token) is freed by the acceptor
//! once the batch is done.

use crate::plot::PlotConstructor;
use crate::runtime::WorkerPool;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

const LISTEN_BACKLOG: i32 = 1024;

/// Poll timeout while a listener is owed another accept attempt.
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("no plot is served on port {0}")]
    PlotNotFound(u16),

    #[error("server is shut down")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptOutcome {
    /// The backlog was drained.
    Drained,
    /// Accepting failed; the backlog has to be retried.
    Failed,
}

struct PlotSocket {
    listener: Option<TcpListener>,
    port: u16,
    constructor: PlotConstructor,
    active: bool,
}

struct Shared {
    registry: Registry,
    waker: Waker,
    shutdown: AtomicBool,
    sockets: Mutex<Slab<PlotSocket>>,
    retiring: Mutex<Vec<usize>>,
    pool: WorkerPool,
}

/// The challenge server: worker pool plus acceptor.
pub struct Server {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Start the worker pool and the acceptor thread.
    ///
    /// # Arguments
    ///
    /// * `workers` - number of worker reactors, at least one
    /// * `event_capacity` - readiness events fetched per poll, per reactor
    pub fn new(workers: usize, event_capacity: usize) -> Result<Self, ServerError> {
        let pool = WorkerPool::new(workers, event_capacity)?;

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            shutdown: AtomicBool::new(false),
            sockets: Mutex::new(Slab::new()),
            retiring: Mutex::new(Vec::new()),
            pool,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || {
                if let Err(e) = accept_loop(poll, &thread_shared, event_capacity) {
                    error!(error = %e, "Acceptor failed");
                }
            })?;

        info!(workers, "Server started");

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Serve `constructor`'s plot on `port` (0 picks a free port).
    ///
    /// Returns the bound address; its port identifies the plot from now on.
    pub fn add_plot(
        &self,
        constructor: PlotConstructor,
        port: u16,
    ) -> Result<SocketAddr, ServerError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ServerError::Stopped);
        }

        let listener = create_listener(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let mut sockets = self.shared.sockets();
        let key = sockets.vacant_key();
        self.shared
            .registry
            .register(&mut listener, Token(key), Interest::READABLE)?;

        sockets.insert(PlotSocket {
            listener: Some(listener),
            port: addr.port(),
            constructor,
            active: true,
        });

        info!(port = addr.port(), "Plot listening");
        Ok(addr)
    }

    /// Stop serving the plot on `port`.
    ///
    /// The listener is closed right away; no further connections are
    /// accepted on it.
    pub fn remove_plot(&self, port: u16) -> Result<(), ServerError> {
        {
            let mut sockets = self.shared.sockets();
            let key = sockets
                .iter()
                .find(|(_, socket)| socket.active && socket.port == port)
                .map(|(key, _)| key)
                .ok_or(ServerError::PlotNotFound(port))?;

            let socket = &mut sockets[key];
            if let Some(mut listener) = socket.listener.take() {
                let _ = self.shared.registry.deregister(&mut listener);
            }
            socket.active = false;

            self.shared.retiring().push(key);
        }

        // Let the acceptor sweep the record without waiting for traffic
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }

        info!(port, "Plot removed");
        Ok(())
    }

    /// Ports with a plot currently being served.
    pub fn ports(&self) -> Vec<u16> {
        self.shared
            .sockets()
            .iter()
            .filter(|(_, socket)| socket.active)
            .map(|(_, socket)| socket.port)
            .collect()
    }

    /// Client count of every worker.
    pub fn client_counts(&self) -> Vec<usize> {
        self.shared.pool.client_counts()
    }

    /// Stop accepting, stop the workers, then close every remaining socket.
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }
        if handle.join().is_err() {
            error!("Acceptor thread panicked");
        }

        self.shared.pool.shutdown();

        let mut sockets = self.shared.sockets();
        for (_, socket) in sockets.iter_mut() {
            if let Some(mut listener) = socket.listener.take() {
                let _ = self.shared.registry.deregister(&mut listener);
            }
        }
        sockets.clear();
        self.shared.retiring().clear();

        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(mut poll: Poll, shared: &Shared, event_capacity: usize) -> io::Result<()> {
    let mut events = Events::with_capacity(event_capacity);

    // Listeners whose backlog may still hold connections after a failed
    // accept. Edge-triggered readiness will not report them again.
    let mut owed = BTreeSet::new();

    debug!("Acceptor started");

    while !shared.shutdown.load(Ordering::Acquire) {
        let timeout = (!owed.is_empty()).then_some(ACCEPT_RETRY_INTERVAL);
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        let mut retry = std::mem::take(&mut owed);
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let key = event.token().0;
            retry.remove(&key);
            if shared.accept_ready(key) == AcceptOutcome::Failed {
                owed.insert(key);
            }
        }

        for key in retry {
            if shared.accept_ready(key) == AcceptOutcome::Failed {
                owed.insert(key);
            }
        }

        // Every event of the batch has been seen; retired records can go
        shared.sweep_retiring();
    }

    debug!("Acceptor stopped");
    Ok(())
}

impl Shared {
    fn sockets(&self) -> MutexGuard<'_, Slab<PlotSocket>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retiring(&self) -> MutexGuard<'_, Vec<usize>> {
        self.retiring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept everything pending on the listener behind `key` and hand the
    /// connections to the pool.
    ///
    /// Returns [`AcceptOutcome::Failed`] when accepting stopped on an error
    /// (EMFILE, ENFILE, ...) before the backlog was drained.
    fn accept_ready(&self, key: usize) -> AcceptOutcome {
        let (port, constructor, accepted, outcome) = {
            let sockets = self.sockets();
            let Some(socket) = sockets.get(key) else {
                return AcceptOutcome::Drained;
            };
            if !socket.active {
                return AcceptOutcome::Drained;
            }
            let Some(listener) = socket.listener.as_ref() else {
                return AcceptOutcome::Drained;
            };

            // Edge-triggered: drain the backlog until it would block
            let mut accepted = Vec::new();
            let outcome = loop {
                match listener.accept() {
                    Ok(conn) => accepted.push(conn),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break AcceptOutcome::Drained
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(port = socket.port, error = %e, "Accept failed");
                        break AcceptOutcome::Failed;
                    }
                }
            };

            (socket.port, Arc::clone(&socket.constructor), accepted, outcome)
        };

        for (stream, peer) in accepted {
            debug!(port, peer = %peer, "Accepted connection");
            if let Err(e) = self.pool.add_client(stream, &constructor) {
                warn!(port, peer = %peer, error = %e, "Failed to admit client");
            }
        }

        outcome
    }

    fn sweep_retiring(&self) {
        let mut sockets = self.sockets();
        let mut retiring = self.retiring();
        for key in retiring.drain(..) {
            if let Some(socket) = sockets.try_remove(key) {
                debug_assert!(!socket.active);
                debug!(port = socket.port, "Plot socket released");
            }
        }
    }
}

/// Create a non-blocking listening socket.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
