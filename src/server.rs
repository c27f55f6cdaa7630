// src/server.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::{ServerError, ServerResult};
use crate::fs::DocRoot;
use crate::log::Logger;
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::reactor::Reactor;
use crate::syscalls::{self, Epoll};

/// How often the detached reporter writes a metrics summary line.
const REPORT_EVERY_SECS: u64 = 30;

pub struct Server {
    config: Config,
    shutdown: Option<Arc<AtomicBool>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: None,
        }
    }

    /// Builder entry point over defaults: `Server::bind("0.0.0.0:8080")`.
    pub fn bind(addr: &str) -> Self {
        let mut config = Config::default();
        if let Some((host, port)) = addr.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                config.host = host.to_string();
                config.port = port;
            }
        }
        Self::new(config)
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn doc_root(mut self, root: &str) -> Self {
        self.config.doc_root = root.to_string();
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn max_connections(mut self, ceiling: usize) -> Self {
        self.config.max_connections = ceiling;
        self
    }

    /// Supply an external shutdown flag instead of installing the SIGINT
    /// handler (used by embedding code and tests).
    pub fn shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Run until the shutdown flag is raised or the event loop fails.
    pub fn serve(self) -> ServerResult<()> {
        let config = self.config;
        if config.workers == 0 {
            return Err(ServerError::Config("workers must be at least 1".into()));
        }
        if config.queue_capacity == 0 {
            return Err(ServerError::Config("queue_capacity must be at least 1".into()));
        }
        if config.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".into()));
        }

        let logger = Logger::new(&config.log)?;
        let metrics = Arc::new(ServerMetrics::new());

        let shutdown = match self.shutdown {
            Some(flag) => flag,
            None => {
                let flag = Arc::new(AtomicBool::new(false));
                let handler_flag = flag.clone();
                if let Err(e) = ctrlc::set_handler(move || {
                    handler_flag.store(true, Ordering::SeqCst);
                }) {
                    logger.warn(&format!("SIGINT handler not installed: {}", e));
                }
                flag
            }
        };

        let listen_fd = syscalls::create_listen_socket(&config.host, config.port)?;
        let epoll = Arc::new(Epoll::new()?);
        let doc_root = Arc::new(DocRoot::new(&config.doc_root));

        let pool = WorkerPool::start(
            config.workers,
            config.queue_capacity,
            epoll.clone(),
            doc_root,
            logger.clone(),
            metrics.clone(),
        )?;

        spawn_reporter(logger.clone(), metrics.clone(), shutdown.clone());

        logger.info(&format!(
            "listening on {} with {} workers, doc root {}",
            config.server_addr(),
            config.workers,
            config.doc_root
        ));

        let mut reactor = Reactor::new(
            epoll,
            listen_fd,
            config.max_connections,
            Duration::from_secs(config.idle_timeout_secs),
            pool,
            logger.clone(),
            metrics,
            shutdown,
        )?;

        let result = reactor.run();
        reactor.stop();

        logger.info("server shut down");
        logger.flush();
        logger.close();
        result
    }
}

/// Detached metrics reporter, stopping with the shutdown flag.
fn spawn_reporter(logger: Arc<Logger>, metrics: Arc<ServerMetrics>, shutdown: Arc<AtomicBool>) {
    thread::Builder::new()
        .name("mazurka-metrics".to_string())
        .spawn(move || {
            use std::sync::atomic::Ordering::Relaxed;
            let mut elapsed = 0u64;
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_secs(1));
                elapsed += 1;
                if elapsed % REPORT_EVERY_SECS != 0 {
                    continue;
                }
                logger.info(&format!(
                    "active {} | accepted {} | requests {} | bytes {} | queue rejections {} | idle evictions {} | log lines dropped {}",
                    metrics.conns_active.load(Relaxed),
                    metrics.conns_accepted.load(Relaxed),
                    metrics.requests_served.load(Relaxed),
                    metrics.bytes_sent.load(Relaxed),
                    metrics.queue_rejections.load(Relaxed),
                    metrics.idle_evictions.load(Relaxed),
                    logger.dropped(),
                ));
            }
        })
        .ok();
}
