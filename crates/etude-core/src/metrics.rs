// src/metrics.rs
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide counters shared by the dispatcher and every connection.
///
/// `active_conns` doubles as the live-connection count used for admission
/// control, so it is read with `Acquire` on the accept path.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub req_count: AtomicU64,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicU64::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> u64 {
        self.req_count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
