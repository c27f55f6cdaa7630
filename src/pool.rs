// src/pool.rs
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::conn::{Connection, ProcessOutcome};
use crate::fs::DocRoot;
use crate::log::Logger;
use crate::metrics::ServerMetrics;
use crate::queue::BoundedQueue;
use crate::syscalls::{EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll};

/// Fixed pool of parser workers over a bounded FIFO of ready connections.
///
/// A connection is present in the queue at most once: the one-shot
/// registration means the reactor cannot see another event for it until a
/// worker has finished and explicitly re-armed, so two workers never touch
/// the same connection.
pub struct WorkerPool {
    queue: Arc<BoundedQueue<Arc<Connection>>>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        capacity: usize,
        epoll: Arc<Epoll>,
        doc_root: Arc<DocRoot>,
        logger: Arc<Logger>,
        metrics: Arc<ServerMetrics>,
    ) -> io::Result<Self> {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let queue = queue.clone();
            let epoll = epoll.clone();
            let doc_root = doc_root.clone();
            let logger = logger.clone();
            let metrics = metrics.clone();

            let handle = thread::Builder::new()
                .name(format!("mazurka-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    worker_loop(&queue, &epoll, &doc_root, &logger, &metrics);
                })?;
            handles.push(handle);
        }

        Ok(Self {
            queue,
            stop,
            handles,
        })
    }

    /// Hand a ready connection to the pool; false when the queue is at
    /// capacity or the pool is stopping. The caller must shed the
    /// connection on refusal, never retry in place.
    pub fn submit(&self, conn: Arc<Connection>) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        self.queue.try_push(conn)
    }

    /// Stop accepting work, drain what is queued and join every worker.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

fn worker_loop(
    queue: &BoundedQueue<Arc<Connection>>,
    epoll: &Epoll,
    doc_root: &DocRoot,
    logger: &Logger,
    metrics: &ServerMetrics,
) {
    while let Some(conn) = queue.pop_blocking() {
        let result =
            panic::catch_unwind(AssertUnwindSafe(|| conn.process(doc_root, logger, metrics)));
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                // Leave the connection disarmed; the idle sweep reclaims it.
                logger.error(&format!("worker panicked while processing {}", conn.peer));
                continue;
            }
        };

        let interest = match outcome {
            ProcessOutcome::NeedMore => EPOLLIN | EPOLLRDHUP | EPOLLONESHOT,
            ProcessOutcome::Respond => EPOLLIN | EPOLLOUT | EPOLLRDHUP | EPOLLONESHOT,
        };
        if let Err(e) = epoll.modify(conn.fd, conn.id as u64, interest) {
            // The reactor may have torn the connection down (timer race).
            logger.warn(&format!("re-arm failed for {}: {}", conn.peer, e));
        }
    }
}
