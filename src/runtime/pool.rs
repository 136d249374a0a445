//! Fixed set of workers with least-loaded client placement.

use crate::plot::PlotConstructor;
use crate::runtime::worker::{AdmitError, Worker};
use mio::net::TcpStream;
use std::io;
use tracing::{debug, info};

/// A pool of worker reactors.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Start `count` workers.
    ///
    /// If any worker fails to start, the ones already running are shut
    /// down and the error is returned.
    pub fn new(count: usize, event_capacity: usize) -> io::Result<Self> {
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker",
            ));
        }

        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            match Worker::spawn(id, event_capacity) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &workers {
                        worker.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        info!(workers = count, event_capacity, "Worker pool started");

        Ok(Self { workers })
    }

    /// Hand a connection to the worker with the fewest clients.
    ///
    /// Counts are read one by one without a common lock, so concurrent
    /// admissions may pick the same worker.
    pub fn add_client(
        &self,
        stream: TcpStream,
        constructor: &PlotConstructor,
    ) -> Result<(), AdmitError> {
        let counts = self.client_counts();
        let mut chosen = 0;
        for (idx, &count) in counts.iter().enumerate() {
            if count < counts[chosen] {
                chosen = idx;
            }
        }

        let worker = &self.workers[chosen];
        debug!(worker = worker.id(), clients = counts[chosen], "Placing client");
        worker.add_client(stream, constructor)
    }

    /// Client count of every worker, in worker order.
    pub fn client_counts(&self) -> Vec<usize> {
        self.workers.iter().map(Worker::clients).collect()
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop every worker.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::testing::scripted;
    use std::net::TcpListener;

    fn accepted(listener: &TcpListener) -> (std::net::TcpStream, TcpStream) {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(WorkerPool::new(0, 64).is_err());
    }

    #[test]
    fn test_clients_are_spread_evenly() {
        let pool = WorkerPool::new(3, 64).unwrap();
        assert_eq!(pool.len(), 3);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let plot = scripted(vec![("wait", b"never", 0)]);

        let mut peers = Vec::new();
        for _ in 0..10 {
            let (peer, stream) = accepted(&listener);
            pool.add_client(stream, &plot).unwrap();
            peers.push(peer);
        }

        let counts = pool.client_counts();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
        assert!(spread <= 1, "uneven placement: {counts:?}");

        pool.shutdown();
        assert_eq!(pool.client_counts(), vec![0, 0, 0]);
    }

    #[test]
    fn test_first_least_loaded_worker_wins() {
        let pool = WorkerPool::new(2, 64).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let plot = scripted(vec![("wait", b"never", 0)]);

        let (_a, stream) = accepted(&listener);
        pool.add_client(stream, &plot).unwrap();

        assert_eq!(pool.client_counts(), vec![1, 0]);
    }
}
