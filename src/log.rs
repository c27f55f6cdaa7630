// src/log.rs
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{Local, NaiveDate};

use crate::config::LogConfig;
use crate::queue::BoundedQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "[debug]: ",
            LogLevel::Info => "[info] : ",
            LogLevel::Warn => "[warn] : ",
            LogLevel::Error => "[error]: ",
        }
    }

    pub fn parse(s: &str) -> LogLevel {
        match s.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Handle to the asynchronous log sink.
///
/// Constructed once at startup and passed to every component that logs.
/// Producers format the full record (timestamp and severity baked in) and
/// hand it to a bounded queue; a single background thread owns the file.
/// A saturated queue drops the line and counts it rather than stalling the
/// caller.
pub struct Logger {
    level: LogLevel,
    queue: Arc<BoundedQueue<String>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicUsize,
}

impl Logger {
    /// Open the log directory and spawn the writer thread.
    pub fn new(cfg: &LogConfig) -> io::Result<Arc<Logger>> {
        let sink = LogSink::open(cfg)?;
        let queue = Arc::new(BoundedQueue::new(cfg.queue_capacity.max(1)));
        let writer_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("mazurka-log".to_string())
            .spawn(move || writer_loop(writer_queue, sink))?;

        Ok(Arc::new(Logger {
            level: LogLevel::parse(&cfg.level),
            queue,
            writer: Mutex::new(Some(handle)),
            dropped: AtomicUsize::new(0),
        }))
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        if level < self.level {
            return;
        }
        let line = format!(
            "{} {}{}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level.tag(),
            msg
        );
        if !self.queue.try_push(line) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log(LogLevel::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }

    /// Lines discarded because the queue was saturated.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wake the writer so pending records hit disk without waiting for its
    /// next natural wake-up. Never blocks the caller.
    pub fn flush(&self) {
        self.queue.wake();
    }

    /// Close the queue, drain what is left and join the writer thread.
    /// Subsequent log calls are dropped.
    pub fn close(&self) {
        self.queue.close();
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn writer_loop(queue: Arc<BoundedQueue<String>>, mut sink: LogSink) {
    loop {
        while let Some(line) = queue.try_pop() {
            sink.write_line(&line);
        }
        // Caught up: write through before going back to sleep.
        sink.flush();
        match queue.pop_blocking() {
            Some(line) => sink.write_line(&line),
            None => break,
        }
    }
    sink.flush();
}

/// The active log file plus the rotation policy: a fresh file on day
/// change, a numbered sibling every `max_lines` lines within a day.
struct LogSink {
    dir: PathBuf,
    suffix: String,
    max_lines: usize,
    day: NaiveDate,
    lines: usize,
    splits: usize,
    out: BufWriter<File>,
}

impl LogSink {
    fn open(cfg: &LogConfig) -> io::Result<Self> {
        fs::create_dir_all(&cfg.dir)?;
        let day = Local::now().date_naive();
        let out = Self::open_file(Path::new(&cfg.dir), &cfg.suffix, day, 0)?;
        Ok(Self {
            dir: PathBuf::from(&cfg.dir),
            suffix: cfg.suffix.clone(),
            max_lines: cfg.max_lines.max(1),
            day,
            lines: 0,
            splits: 0,
            out,
        })
    }

    fn open_file(dir: &Path, suffix: &str, day: NaiveDate, split: usize) -> io::Result<BufWriter<File>> {
        let name = if split == 0 {
            format!("{}{}", day.format("%Y_%m_%d"), suffix)
        } else {
            format!("{}-{}{}", day.format("%Y_%m_%d"), split, suffix)
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))?;
        Ok(BufWriter::new(file))
    }

    fn write_line(&mut self, line: &str) {
        let today = Local::now().date_naive();
        if today != self.day {
            self.day = today;
            self.lines = 0;
            self.splits = 0;
            self.reopen();
        } else if self.lines >= self.max_lines {
            self.splits += 1;
            self.lines = 0;
            self.reopen();
        }
        let _ = self.out.write_all(line.as_bytes());
        let _ = self.out.write_all(b"\n");
        self.lines += 1;
    }

    fn reopen(&mut self) {
        let _ = self.out.flush();
        // Keep writing to the old file if the new one cannot be opened.
        if let Ok(out) = Self::open_file(&self.dir, &self.suffix, self.day, self.splits) {
            self.out = out;
        }
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}
