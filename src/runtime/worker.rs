//! Worker reactor.
//!
//! Each worker runs one mio event loop on its own thread and owns a set of
//! clients together with their reply timers. Readiness model: the loop is
//! told when a socket or timer is ready, then performs non-blocking I/O and
//! moves the client along its session.
//!
//! ## Threading
//!
//! The acceptor hands clients over through [`Worker::add_client`] from its
//! own thread. Admission and the event loop both work on the client set
//! with the worker mutex held, so a client's transitions are strictly
//! sequential. The event loop keeps the mutex for a whole event batch.
//!
//! ## Shutdown
//!
//! A stop flag plus a `mio::Waker` interrupts the blocking poll; remaining
//! clients are torn down on the calling thread once the loop has exited.

use crate::plot::{AnswerState, PlotConstructor, TaskError};
use crate::runtime::connection::{Client, ClientError, ClientState};
use crate::runtime::timer::Timer;
use crate::runtime::token::{Source, TokenAllocator};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Why a client could not be admitted.
#[derive(Debug, Error)]
pub enum AdmitError {
    /// The plot constructor failed.
    #[error("plot construction failed: {0}")]
    Plot(#[source] TaskError),

    /// The socket could not be registered with the worker's multiplexer.
    #[error("socket registration failed: {0}")]
    Register(#[source] io::Error),

    /// The first task could not be set up.
    #[error("session setup failed: {0}")]
    Session(#[from] ClientError),

    /// The worker is stopping.
    #[error("worker is shutting down")]
    ShuttingDown,
}

/// What to do with a client after handling an event.
enum Flow {
    Keep,
    Disconnect(&'static str),
}

struct ClientTimer {
    timer: Timer,
    token: Token,
    client_id: usize,
}

struct State {
    tokens: TokenAllocator,
    clients: Slab<Client>,
    timers: Slab<ClientTimer>,
}

struct Shared {
    id: usize,
    registry: Registry,
    waker: Waker,
    state: Mutex<State>,
    clients: AtomicUsize,
    shutdown: AtomicBool,
}

/// A worker thread and its client set.
pub struct Worker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start a worker thread.
    ///
    /// # Arguments
    ///
    /// * `id` - worker index, used for the thread name and in logs
    /// * `event_capacity` - readiness events fetched per poll
    pub fn spawn(id: usize, event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            id,
            registry,
            waker,
            state: Mutex::new(State {
                tokens: TokenAllocator::new(event_capacity),
                clients: Slab::new(),
                timers: Slab::new(),
            }),
            clients: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                if let Err(e) = event_loop(poll, &thread_shared, event_capacity) {
                    error!(worker = id, error = %e, "Worker failed");
                }
            })?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Number of connected clients. A momentary snapshot.
    pub fn clients(&self) -> usize {
        self.shared.clients.load(Ordering::Relaxed)
    }

    /// Take over an accepted connection.
    ///
    /// Builds the client's plot, registers the socket and queues the first
    /// question. A plot without tasks disconnects the client right away and
    /// still counts as a successful admission. On failure everything built
    /// so far is torn down again.
    pub fn add_client(
        &self,
        stream: TcpStream,
        constructor: &PlotConstructor,
    ) -> Result<(), AdmitError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(AdmitError::ShuttingDown);
        }

        let plot = constructor().map_err(AdmitError::Plot)?;

        let mut guard = self.shared.lock();
        let state = &mut *guard;

        // Shutdown may have swept the clients while the plot was being built
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(AdmitError::ShuttingDown);
        }

        let client_id = state.clients.vacant_key();
        let token = state.tokens.alloc(Source::Client { client_id });

        let mut stream = stream;
        if let Err(e) = self
            .shared
            .registry
            .register(&mut stream, token, Interest::READABLE)
        {
            state.tokens.retire(token);
            return Err(AdmitError::Register(e));
        }

        let key = state.clients.insert(Client::new(stream, token, plot));
        debug_assert_eq!(key, client_id);
        self.shared.clients.fetch_add(1, Ordering::Relaxed);

        debug!(
            worker = self.shared.id,
            client = client_id,
            peer = ?state.clients[client_id].peer,
            "Client admitted"
        );

        match self.shared.next_task(state, client_id) {
            Ok(Flow::Keep) => Ok(()),
            Ok(Flow::Disconnect(reason)) => {
                self.shared.disconnect(state, client_id, reason);
                Ok(())
            }
            Err(e) => {
                self.shared.disconnect(state, client_id, "setup failed");
                Err(AdmitError::Session(e))
            }
        }
    }

    /// Stop the event loop and disconnect every remaining client.
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
            warn!(worker = self.shared.id, error = %e, "Failed to wake worker");
        }
        if handle.join().is_err() {
            error!(worker = self.shared.id, "Worker thread panicked");
        }

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let remaining: Vec<usize> = state.clients.iter().map(|(id, _)| id).collect();
        for client_id in remaining {
            self.shared.disconnect(state, client_id, "shutdown");
        }
        state.tokens.release_retired();

        info!(worker = self.shared.id, "Worker stopped");
    }

    #[cfg(test)]
    fn live_sources(&self) -> (usize, usize) {
        let state = self.shared.lock();
        (state.tokens.live(), state.timers.len())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn event_loop(mut poll: Poll, shared: &Shared, event_capacity: usize) -> io::Result<()> {
    let mut events = Events::with_capacity(event_capacity);

    info!(worker = shared.id, "Worker started");

    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        let mut guard = shared.lock();
        let state = &mut *guard;

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }

            // Unknown tokens belong to sources torn down earlier in this batch
            match state.tokens.get(event.token()) {
                Some(Source::Client { client_id }) => shared.client_event(state, client_id, event),
                Some(Source::Timer { timer_id }) => shared.timer_event(state, timer_id),
                None => {}
            }
        }

        state.tokens.release_retired();
    }

    Ok(())
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_event(&self, state: &mut State, client_id: usize, event: &Event) {
        let mut flow = Ok(Flow::Keep);

        if event.is_writable() {
            flow = self.on_writable(state, client_id);
        }

        if event.is_readable() && matches!(flow, Ok(Flow::Keep)) {
            flow = self.on_readable(state, client_id);
        }

        // Handled last so an answer sent right before closing still counts
        if matches!(flow, Ok(Flow::Keep))
            && (event.is_read_closed() || event.is_write_closed() || event.is_error())
        {
            flow = Ok(Flow::Disconnect("hangup"));
        }

        match flow {
            Ok(Flow::Keep) => {}
            Ok(Flow::Disconnect(reason)) => self.disconnect(state, client_id, reason),
            Err(e) => {
                debug!(worker = self.id, client = client_id, error = %e, "Client error");
                self.disconnect(state, client_id, "error");
            }
        }
    }

    fn timer_event(&self, state: &mut State, timer_id: usize) {
        let Some(mut fired) = state.timers.try_remove(timer_id) else {
            return;
        };
        state.tokens.retire(fired.token);
        let _ = self.registry.deregister(&mut fired.timer);
        let client_id = fired.client_id;
        drop(fired);

        let client = &mut state.clients[client_id];
        client.timers.retain(|&id| id != timer_id);
        assert!(client.has_task(), "timer fired for a client without a task");

        let flow = match client.check_answer() {
            AnswerState::Right => self.answered(state, client_id),
            AnswerState::Wrong | AnswerState::More => Ok(Flow::Disconnect("timeout")),
        };

        match flow {
            Ok(Flow::Keep) => {}
            Ok(Flow::Disconnect(reason)) => self.disconnect(state, client_id, reason),
            Err(e) => {
                debug!(worker = self.id, client = client_id, error = %e, "Client error");
                self.disconnect(state, client_id, "error");
            }
        }
    }

    fn on_writable(&self, state: &mut State, client_id: usize) -> Result<Flow, ClientError> {
        let client = &mut state.clients[client_id];
        if client.state() != ClientState::SendingQuestion {
            return Ok(Flow::Keep);
        }
        if !client.flush_question()? {
            return Ok(Flow::Keep);
        }

        self.registry
            .reregister(&mut client.stream, client.token, Interest::READABLE)?;

        if let Some(after) = client.timeout() {
            self.arm_timer(state, client_id, after)?;
        }

        Ok(Flow::Keep)
    }

    fn on_readable(&self, state: &mut State, client_id: usize) -> Result<Flow, ClientError> {
        let client = &mut state.clients[client_id];
        if !client.has_task() {
            return Ok(Flow::Keep);
        }

        match client.check_answer() {
            AnswerState::Wrong => Ok(Flow::Disconnect("wrong answer")),
            AnswerState::More => Ok(Flow::Keep),
            AnswerState::Right => self.answered(state, client_id),
        }
    }

    /// The current task was answered correctly.
    fn answered(&self, state: &mut State, client_id: usize) -> Result<Flow, ClientError> {
        self.cancel_timers(state, client_id);
        self.next_task(state, client_id)
    }

    fn next_task(&self, state: &mut State, client_id: usize) -> Result<Flow, ClientError> {
        let client = &mut state.clients[client_id];
        if !client.start_task()? {
            return Ok(Flow::Disconnect("plot finished"));
        }

        self.registry.reregister(
            &mut client.stream,
            client.token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        Ok(Flow::Keep)
    }

    fn arm_timer(&self, state: &mut State, client_id: usize, after: Duration) -> io::Result<()> {
        let mut timer = Timer::oneshot(after)?;

        let timer_id = state.timers.vacant_key();
        let token = state.tokens.alloc(Source::Timer { timer_id });
        if let Err(e) = self.registry.register(&mut timer, token, Interest::READABLE) {
            state.tokens.retire(token);
            return Err(e);
        }

        state.timers.insert(ClientTimer {
            timer,
            token,
            client_id,
        });
        state.clients[client_id].timers.push(timer_id);

        Ok(())
    }

    fn cancel_timers(&self, state: &mut State, client_id: usize) {
        let timers = std::mem::take(&mut state.clients[client_id].timers);
        for timer_id in timers {
            if let Some(mut entry) = state.timers.try_remove(timer_id) {
                state.tokens.retire(entry.token);
                let _ = self.registry.deregister(&mut entry.timer);
            }
        }
    }

    fn disconnect(&self, state: &mut State, client_id: usize, reason: &'static str) {
        if !state.clients.contains(client_id) {
            return;
        }

        self.cancel_timers(state, client_id);

        let mut client = state.clients.remove(client_id);
        let _ = self.registry.deregister(&mut client.stream);
        state.tokens.retire(client.token);
        client.close();
        self.clients.fetch_sub(1, Ordering::Relaxed);

        debug!(
            worker = self.id,
            client = client_id,
            peer = ?client.peer,
            reason,
            "Client disconnected"
        );
    }
}
