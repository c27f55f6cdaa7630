// src/reactor.rs
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::conn::{Connection, DrainOutcome, FlushOutcome};
use crate::error::{ServerError, ServerResult};
use crate::log::Logger;
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::slab::ConnectionSlab;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll,
};
use crate::timer::TimerList;

const LISTENER_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 1024;

/// Interval of the periodic alarm tick driving the idle sweep.
const TICK: Duration = Duration::from_secs(1);

/// The event loop: the only thread that accepts, registers interest, owns
/// the connection table and the timer list, and performs socket reads and
/// response flushes. Workers re-enter via explicit one-shot re-arms.
pub struct Reactor {
    epoll: Arc<Epoll>,
    listen_fd: RawFd,
    conns: ConnectionSlab,
    timers: TimerList,
    pool: WorkerPool,
    logger: Arc<Logger>,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<AtomicBool>,
    idle_timeout: Duration,
    stopped: bool,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        epoll: Arc<Epoll>,
        listen_fd: RawFd,
        max_connections: usize,
        idle_timeout: Duration,
        pool: WorkerPool,
        logger: Arc<Logger>,
        metrics: Arc<ServerMetrics>,
        shutdown: Arc<AtomicBool>,
    ) -> ServerResult<Self> {
        epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;
        Ok(Self {
            epoll,
            listen_fd,
            conns: ConnectionSlab::new(max_connections),
            timers: TimerList::new(),
            pool,
            logger,
            metrics,
            shutdown,
            idle_timeout,
            stopped: false,
        })
    }

    /// Block on readiness until the shutdown flag is raised. Multiplexer
    /// failures other than interruption are fatal; every per-connection
    /// error only tears that connection down.
    pub fn run(&mut self) -> ServerResult<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut last_tick = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            let n = self
                .epoll
                .wait(&mut events, TICK.as_millis() as i32)
                .map_err(ServerError::EventLoop)?;

            for i in 0..n {
                let token = events[i].u64;
                let bits = events[i].events;
                if token == LISTENER_TOKEN {
                    self.accept_ready();
                } else {
                    self.client_ready(token as usize, bits);
                }
            }

            let now = Instant::now();
            if now.duration_since(last_tick) >= TICK {
                self.sweep(now);
                last_tick = now;
            }
        }
        Ok(())
    }

    /// Tear down everything and join the pool. Called by the server after
    /// `run` returns, on both the clean and the error path.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        // Join the workers first so nobody re-arms a socket we are about
        // to close.
        self.pool.shutdown();
        for id in self.conns.active_ids() {
            self.teardown(id);
        }
        let _ = self.epoll.delete(self.listen_fd);
        syscalls::close(self.listen_fd);
        self.logger.info("reactor stopped");
    }

    fn accept_ready(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if self.conns.len() >= self.conns.capacity() {
                        self.logger
                            .warn(&format!("connection ceiling reached, refusing {}", peer));
                        syscalls::close(fd);
                        continue;
                    }
                    let id = match self
                        .conns
                        .insert_with(|id| Arc::new(Connection::new(fd, id, peer)))
                    {
                        Some(id) => id,
                        None => {
                            syscalls::close(fd);
                            continue;
                        }
                    };
                    if let Err(e) =
                        self.epoll
                            .add(fd, id as u64, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT)
                    {
                        self.logger
                            .error(&format!("epoll registration failed for {}: {}", peer, e));
                        self.conns.remove(id);
                        syscalls::close(fd);
                        continue;
                    }
                    self.timers.add(id, Instant::now() + self.idle_timeout);
                    self.metrics.inc_conn();
                    self.logger.debug(&format!("accepted {} as conn {}", peer, id));
                }
                Ok(None) => break,
                Err(e) => {
                    // Soft failure (fd exhaustion, aborted handshake):
                    // log and wait for the next readiness.
                    self.logger.warn(&format!("accept failed: {}", e));
                    break;
                }
            }
        }
    }

    fn client_ready(&mut self, id: usize, bits: u32) {
        // A stale token can fire after teardown; nothing to do.
        let Some(conn) = self.conns.get(id).cloned() else {
            return;
        };

        if bits & (EPOLLERR | EPOLLHUP | EPOLLRDHUP) != 0 {
            self.logger.debug(&format!("{} hangup", conn.peer));
            self.teardown(id);
            return;
        }

        if conn.wants_write() {
            self.flush_ready(id, &conn);
        } else {
            self.read_ready(id, &conn);
        }
    }

    fn read_ready(&mut self, id: usize, conn: &Arc<Connection>) {
        match conn.drain() {
            Ok(DrainOutcome::Progress(0)) => {
                // Spurious wake-up; nothing buffered, just re-arm.
                self.rearm(id, conn, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT);
            }
            Ok(DrainOutcome::Progress(_)) => {
                self.timers.adjust(id, Instant::now() + self.idle_timeout);
                if !self.pool.submit(conn.clone()) {
                    self.metrics.inc_queue_rejection();
                    self.logger
                        .warn(&format!("work queue saturated, closing {}", conn.peer));
                    self.teardown(id);
                }
            }
            Ok(DrainOutcome::Eof) => {
                self.logger.debug(&format!("{} closed by peer", conn.peer));
                self.teardown(id);
            }
            Err(e) => {
                self.logger.debug(&format!("{} read error: {}", conn.peer, e));
                self.teardown(id);
            }
        }
    }

    fn flush_ready(&mut self, id: usize, conn: &Arc<Connection>) {
        match conn.flush(&self.metrics) {
            Ok(FlushOutcome::Blocked) => {
                self.rearm(id, conn, EPOLLIN | EPOLLOUT | EPOLLRDHUP | EPOLLONESHOT);
            }
            Ok(FlushOutcome::Done { reuse: true }) => {
                self.rearm(id, conn, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT);
            }
            Ok(FlushOutcome::Done { reuse: false }) => {
                self.logger
                    .debug(&format!("{} response complete, closing", conn.peer));
                self.teardown(id);
            }
            Err(e) => {
                self.logger.debug(&format!("{} write error: {}", conn.peer, e));
                self.teardown(id);
            }
        }
    }

    fn rearm(&mut self, id: usize, conn: &Arc<Connection>, interest: u32) {
        if let Err(e) = self.epoll.modify(conn.fd, id as u64, interest) {
            self.logger
                .warn(&format!("re-arm failed for {}: {}", conn.peer, e));
            self.teardown(id);
        }
    }

    /// Socket close and timer removal are coupled here so the sweep can
    /// never observe a dangling connection id.
    fn teardown(&mut self, id: usize) {
        let Some(conn) = self.conns.remove(id) else {
            return;
        };
        self.timers.remove(id);
        let _ = self.epoll.delete(conn.fd);
        syscalls::close(conn.fd);
        self.metrics.dec_conn();
    }

    fn sweep(&mut self, now: Instant) {
        let mut expired = Vec::new();
        self.timers.tick(now, |id| expired.push(id));
        for id in expired {
            if let Some(conn) = self.conns.get(id) {
                self.logger
                    .info(&format!("{} idle timeout, closing", conn.peer));
            }
            self.metrics.inc_idle_eviction();
            self.teardown(id);
        }
    }
}
