// src/error.rs
use std::io;

use thiserror::Error;

/// Central error type for the mazurka engine.
///
/// Only process-fatal conditions live here: everything that can go wrong on
/// a single connection is handled locally and results in that connection's
/// teardown, never in an error bubbling out of the event loop.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Readiness-multiplexer failure other than interruption.
    #[error("event loop failure: {0}")]
    EventLoop(io::Error),

    /// Invalid startup configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
