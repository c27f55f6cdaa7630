// src/conn.rs
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::fs::{DocRoot, FileError, FileMap};
use crate::log::Logger;
use crate::metrics::ServerMetrics;
use crate::parser::{ParseOutcome, RequestMachine};
use crate::response;
use crate::syscalls;

pub const READ_BUF_SIZE: usize = 4096;

/// Hard cap on requests served over one keep-alive connection.
pub const KEEP_ALIVE_MAX_REQUESTS: u32 = 10_000;

/// What a drain pass observed on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Bytes appended to the read buffer (possibly zero on a spurious
    /// wake-up).
    Progress(usize),
    /// Peer-initiated close.
    Eof,
}

/// What a worker pass produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The request is still incomplete; re-arm for read.
    NeedMore,
    /// A response is staged in the write buffer; re-arm for write.
    Respond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The socket would block mid-response; re-arm for write.
    Blocked,
    /// Fully flushed. `reuse` distinguishes a keep-alive reset from a
    /// connection that must now be torn down.
    Done { reuse: bool },
}

/// Per-socket state.
///
/// The identity fields are immutable for the connection's lifetime; all
/// mutable state lives behind one mutex. The one-shot registration
/// discipline guarantees the lock is never contended: at any instant either
/// the reactor or a single worker owns the connection.
pub struct Connection {
    pub fd: RawFd,
    pub id: usize,
    pub peer: SocketAddr,
    core: Mutex<ConnCore>,
}

struct ConnCore {
    read_buf: Box<[u8]>,
    read_pos: usize,
    machine: RequestMachine,
    write_buf: Vec<u8>,
    sent: usize,
    file: Option<FileMap>,
    close_after: bool,
    requests_served: u32,
}

impl Connection {
    pub fn new(fd: RawFd, id: usize, peer: SocketAddr) -> Self {
        Self {
            fd,
            id,
            peer,
            core: Mutex::new(ConnCore {
                read_buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
                read_pos: 0,
                machine: RequestMachine::new(),
                write_buf: Vec::new(),
                sent: 0,
                file: None,
                close_after: false,
                requests_served: 0,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, ConnCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a staged response has unsent bytes; the reactor routes
    /// readiness on such a connection to the flush path, never the parser.
    pub fn wants_write(&self) -> bool {
        let core = self.core();
        let total = core.write_buf.len() + core.file.as_ref().map_or(0, |f| f.len());
        core.sent < total
    }

    /// Non-blocking receive loop: append until the socket would block, the
    /// buffer is full, or the peer hangs up.
    pub fn drain(&self) -> io::Result<DrainOutcome> {
        let mut core = self.core();
        let mut added = 0usize;
        while core.read_pos < READ_BUF_SIZE {
            let pos = core.read_pos;
            match syscalls::read_nonblocking(self.fd, &mut core.read_buf[pos..]) {
                Ok(0) => return Ok(DrainOutcome::Eof),
                Ok(n) => {
                    core.read_pos += n;
                    added += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(DrainOutcome::Progress(added))
    }

    /// Resume the request state machine; on completion resolve the target
    /// and stage the response. Runs on a worker thread.
    pub fn process(
        &self,
        doc_root: &DocRoot,
        logger: &Logger,
        metrics: &ServerMetrics,
    ) -> ProcessOutcome {
        let mut core = self.core();
        let core = &mut *core;

        let outcome = core.machine.advance(&core.read_buf[..core.read_pos], logger);
        match outcome {
            ParseOutcome::NeedMore => {
                if core.read_pos >= READ_BUF_SIZE {
                    logger.warn(&format!(
                        "{} request exceeds {} byte buffer",
                        self.peer, READ_BUF_SIZE
                    ));
                    core.stage_status(400, false);
                    ProcessOutcome::Respond
                } else {
                    ProcessOutcome::NeedMore
                }
            }
            ParseOutcome::BadRequest => {
                logger.info(&format!("{} malformed request -> 400", self.peer));
                core.stage_status(400, false);
                ProcessOutcome::Respond
            }
            ParseOutcome::Complete => {
                metrics.inc_request();
                core.requests_served += 1;
                let keep_alive =
                    core.machine.keep_alive && core.requests_served < KEEP_ALIVE_MAX_REQUESTS;

                match doc_root.resolve(&core.machine.path) {
                    Ok(map) => {
                        logger.info(&format!(
                            "{} GET {} -> 200 ({} bytes)",
                            self.peer, core.machine.path, map.len()
                        ));
                        core.write_buf.clear();
                        response::write_head(&mut core.write_buf, 200, map.len(), keep_alive);
                        core.file = Some(map);
                        core.sent = 0;
                        core.close_after = !keep_alive;
                    }
                    Err(err) => {
                        let status = match err {
                            FileError::NotFound => 404,
                            FileError::Forbidden => 403,
                            FileError::IsDirectory => 400,
                            FileError::Io => 500,
                        };
                        logger.info(&format!(
                            "{} GET {} -> {}",
                            self.peer, core.machine.path, status
                        ));
                        // 400 and 500 always close; 403/404 still honor
                        // keep-alive.
                        let keep = keep_alive && matches!(status, 403 | 404);
                        core.stage_status(status, keep);
                    }
                }
                ProcessOutcome::Respond
            }
        }
    }

    /// Flush the staged response, resuming mid-segment across readiness
    /// events. Runs on the reactor thread.
    pub fn flush(&self, metrics: &ServerMetrics) -> io::Result<FlushOutcome> {
        let mut core = self.core();
        let core = &mut *core;
        loop {
            let head_len = core.write_buf.len();
            let file_len = core.file.as_ref().map_or(0, |f| f.len());
            if core.sent >= head_len + file_len {
                break;
            }

            let mut segments: [&[u8]; 2] = [&[], &[]];
            let mut count = 0;
            if core.sent < head_len {
                segments[count] = &core.write_buf[core.sent..];
                count += 1;
                if let Some(file) = core.file.as_ref() {
                    if !file.is_empty() {
                        segments[count] = file.as_slice();
                        count += 1;
                    }
                }
            } else if let Some(file) = core.file.as_ref() {
                segments[count] = &file.as_slice()[core.sent - head_len..];
                count += 1;
            }

            match syscalls::writev_nonblocking(self.fd, &segments[..count]) {
                Ok(0) => return Ok(FlushOutcome::Blocked),
                Ok(n) => {
                    core.sent += n;
                    metrics.add_bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushOutcome::Blocked);
                }
                Err(e) => {
                    core.file = None;
                    return Err(e);
                }
            }
        }

        core.file = None;
        if core.close_after {
            Ok(FlushOutcome::Done { reuse: false })
        } else {
            core.reset_for_next();
            Ok(FlushOutcome::Done { reuse: true })
        }
    }

    #[cfg(test)]
    pub fn push_bytes(&self, data: &[u8]) {
        let mut core = self.core();
        let pos = core.read_pos;
        core.read_buf[pos..pos + data.len()].copy_from_slice(data);
        core.read_pos += data.len();
    }

    #[cfg(test)]
    pub fn staged_response(&self) -> Vec<u8> {
        self.core().write_buf.clone()
    }

    #[cfg(test)]
    pub fn will_close(&self) -> bool {
        self.core().close_after
    }
}

impl ConnCore {
    fn stage_status(&mut self, status: u16, keep_alive: bool) {
        let body = response::canned_body(status);
        self.write_buf.clear();
        response::write_head(&mut self.write_buf, status, body.len(), keep_alive);
        self.write_buf.extend_from_slice(body);
        self.file = None;
        self.sent = 0;
        self.close_after = !keep_alive;
    }

    /// Keep-alive reset: cursors and parse state zeroed, mapping already
    /// released, socket left open.
    fn reset_for_next(&mut self) {
        self.read_pos = 0;
        self.machine.reset();
        self.write_buf.clear();
        self.sent = 0;
        self.file = None;
        self.close_after = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn test_logger() -> (tempfile::TempDir, Arc<Logger>) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LogConfig {
            dir: dir.path().to_string_lossy().into_owned(),
            suffix: ".log".to_string(),
            level: "error".to_string(),
            queue_capacity: 16,
            max_lines: 1000,
        };
        let logger = Logger::new(&cfg).unwrap();
        (dir, logger)
    }

    fn test_conn() -> Connection {
        Connection::new(-1, 0, "127.0.0.1:9999".parse().unwrap())
    }

    #[test]
    fn complete_request_stages_file_response() {
        let (_ld, logger) = test_logger();
        let docs = tempfile::tempdir().unwrap();
        fs::write(docs.path().join("a.html"), b"payload").unwrap();
        fs::set_permissions(docs.path().join("a.html"), fs::Permissions::from_mode(0o644))
            .unwrap();
        let root = DocRoot::new(docs.path());
        let metrics = ServerMetrics::new();

        let conn = test_conn();
        conn.push_bytes(b"GET /a.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(conn.process(&root, &logger, &metrics), ProcessOutcome::Respond);

        let head = String::from_utf8(conn.staged_response()).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 7\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(!conn.will_close());
        assert!(conn.wants_write());
    }

    #[test]
    fn partial_request_asks_for_more() {
        let (_ld, logger) = test_logger();
        let docs = tempfile::tempdir().unwrap();
        let root = DocRoot::new(docs.path());
        let metrics = ServerMetrics::new();

        let conn = test_conn();
        conn.push_bytes(b"GET /a.html HTT");
        assert_eq!(conn.process(&root, &logger, &metrics), ProcessOutcome::NeedMore);
        assert!(!conn.wants_write());
    }

    #[test]
    fn malformed_request_stages_400_and_closes() {
        let (_ld, logger) = test_logger();
        let docs = tempfile::tempdir().unwrap();
        let root = DocRoot::new(docs.path());
        let metrics = ServerMetrics::new();

        let conn = test_conn();
        conn.push_bytes(b"DELETE /a HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process(&root, &logger, &metrics), ProcessOutcome::Respond);

        let head = String::from_utf8(conn.staged_response()).unwrap();
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(conn.will_close());
    }

    #[test]
    fn missing_file_is_404_and_honors_keep_alive() {
        let (_ld, logger) = test_logger();
        let docs = tempfile::tempdir().unwrap();
        let root = DocRoot::new(docs.path());
        let metrics = ServerMetrics::new();

        let conn = test_conn();
        conn.push_bytes(b"GET /gone.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(conn.process(&root, &logger, &metrics), ProcessOutcome::Respond);

        let head = String::from_utf8(conn.staged_response()).unwrap();
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(!conn.will_close());
    }

    #[test]
    fn directory_target_is_400_not_404() {
        let (_ld, logger) = test_logger();
        let docs = tempfile::tempdir().unwrap();
        fs::create_dir(docs.path().join("sub")).unwrap();
        fs::set_permissions(docs.path().join("sub"), fs::Permissions::from_mode(0o755)).unwrap();
        let root = DocRoot::new(docs.path());
        let metrics = ServerMetrics::new();

        let conn = test_conn();
        conn.push_bytes(b"GET /sub HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process(&root, &logger, &metrics), ProcessOutcome::Respond);

        let head = String::from_utf8(conn.staged_response()).unwrap();
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
