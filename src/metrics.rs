// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C, align(64))]
pub struct ServerMetrics {
    pub conns_accepted: AtomicUsize,
    pub conns_active: AtomicUsize,
    pub requests_served: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub queue_rejections: AtomicUsize,
    pub idle_evictions: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            conns_accepted: AtomicUsize::new(0),
            conns_active: AtomicUsize::new(0),
            requests_served: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            queue_rejections: AtomicUsize::new(0),
            idle_evictions: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.conns_accepted.fetch_add(1, Ordering::Relaxed);
        self.conns_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.conns_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_queue_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idle_eviction(&self) {
        self.idle_evictions.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
