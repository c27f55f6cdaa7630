// src/config.rs
use std::env;
use std::str::FromStr;

use serde::Deserialize;

/// Server configuration, fixed at startup (not hot-reloadable).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    /// Document root served for GET requests (default: ./resources)
    pub doc_root: String,

    /// Number of parser worker threads (default: all cores)
    pub workers: usize,

    /// Work queue bound; the reactor sheds connections instead of queuing
    /// past this (default: 10000)
    pub queue_capacity: usize,

    /// Open-connection ceiling; new sockets are refused above it
    /// (default: 65536)
    pub max_connections: usize,

    /// Idle connections are evicted after this many seconds (default: 60)
    pub idle_timeout_secs: u64,

    pub log: LogConfig,
}

/// Log sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Directory log files are written to, created on startup (default: ./log)
    pub dir: String,

    /// Log file suffix (default: .log)
    pub suffix: String,

    /// Minimum severity: debug, info, warn or error (default: info)
    pub level: String,

    /// Bound of the producer queue; lines are dropped, never blocked on,
    /// when it is full (default: 1024)
    pub queue_capacity: usize,

    /// A new file is started every this many lines within a day
    /// (default: 50000)
    pub max_lines: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: "./resources".to_string(),
            workers: num_cpus::get().max(1),
            queue_capacity: 10_000,
            max_connections: 65_536,
            idle_timeout_secs: 60,
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "./log".to_string(),
            suffix: ".log".to_string(),
            level: "info".to_string(),
            queue_capacity: 1024,
            max_lines: 50_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Config {
            host: env::var("SERVER_HOST").unwrap_or(defaults.host),
            port: env_or("SERVER_PORT", defaults.port),
            doc_root: env::var("DOC_ROOT").unwrap_or(defaults.doc_root),
            workers: env_or("WORKERS", defaults.workers),
            queue_capacity: env_or("QUEUE_CAPACITY", defaults.queue_capacity),
            max_connections: env_or("MAX_CONNECTIONS", defaults.max_connections),
            idle_timeout_secs: env_or("IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            log: LogConfig {
                dir: env::var("LOG_DIR").unwrap_or(defaults.log.dir),
                suffix: env::var("LOG_SUFFIX").unwrap_or(defaults.log.suffix),
                level: env::var("LOG_LEVEL").unwrap_or(defaults.log.level),
                queue_capacity: env_or("LOG_QUEUE_CAPACITY", defaults.log.queue_capacity),
                max_lines: env_or("LOG_MAX_LINES", defaults.log.max_lines),
            },
        }
    }

    /// Get the full listen address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
