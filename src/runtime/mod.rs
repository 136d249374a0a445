//! Reactor runtime: worker event loops and the pieces they are built from.
//!
//! Readiness-based model on mio (epoll). Each worker thread owns one
//! `Poll`, its clients and their reply timers:
//! - `ByteStream`: outgoing data queue of borrowed and copied buffers
//! - `TokenAllocator`: maps readiness tokens to clients and timers
//! - `Timer`: timerfd-backed reply deadline
//! - `Client`: per-connection session state machine
//! - `Worker` / `WorkerPool`: the reactors and client placement

pub mod buffer;
mod connection;
mod pool;
pub mod timer;
pub mod token;
mod worker;

pub use buffer::{ByteStream, COPIED_BUFFER_SIZE};
pub use connection::{Client, ClientError, ClientState};
pub use pool::WorkerPool;
pub use worker::{AdmitError, Worker};

/// Number of CPUs available to this process.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
