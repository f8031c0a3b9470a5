//! In-process metrics.
//!
//! Thread-safe counters over atomics; the registry publishes connection
//! counts here and the control plane serves [`MetricsSnapshot`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    total_connections: AtomicU64,
    active_connections: AtomicUsize,

    login_attempts: AtomicU64,
    login_ok: AtomicU64,
    login_failed: AtomicU64,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    uploads_ok: AtomicU64,
    uploads_failed: AtomicU64,
    downloads_ok: AtomicU64,
    downloads_failed: AtomicU64,

    start_time: DateTime<Utc>,
}

/// Serializable snapshot for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: i64,
    pub total_connections: u64,
    pub active_connections: usize,
    pub login_attempts: u64,
    pub login_ok: u64,
    pub login_failed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    pub downloads_ok: u64,
    pub downloads_failed: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                login_attempts: AtomicU64::new(0),
                login_ok: AtomicU64::new(0),
                login_failed: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                uploads_ok: AtomicU64::new(0),
                uploads_failed: AtomicU64::new(0),
                downloads_ok: AtomicU64::new(0),
                downloads_failed: AtomicU64::new(0),
                start_time: Utc::now(),
            }),
        }
    }

    pub fn connection_opened(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_connections(&self, count: usize) {
        self.inner.active_connections.store(count, Ordering::Relaxed);
    }

    pub fn login_attempt(&self) {
        self.inner.login_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_result(&self, ok: bool) {
        if ok {
            self.inner.login_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.login_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.inner.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.inner.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn upload_completed(&self, ok: bool) {
        if ok {
            self.inner.uploads_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.uploads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn download_completed(&self, ok: bool) {
        if ok {
            self.inner.downloads_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.downloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        MetricsSnapshot {
            timestamp: now,
            uptime_secs: (now - self.inner.start_time).num_seconds(),
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            login_attempts: self.inner.login_attempts.load(Ordering::Relaxed),
            login_ok: self.inner.login_ok.load(Ordering::Relaxed),
            login_failed: self.inner.login_failed.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            uploads_ok: self.inner.uploads_ok.load(Ordering::Relaxed),
            uploads_failed: self.inner.uploads_failed.load(Ordering::Relaxed),
            downloads_ok: self.inner.downloads_ok.load(Ordering::Relaxed),
            downloads_failed: self.inner.downloads_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.set_active_connections(2);
        metrics.login_attempt();
        metrics.login_result(true);
        metrics.add_bytes_sent(100);
        metrics.add_bytes_received(50);
        metrics.upload_completed(true);
        metrics.download_completed(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 2);
        assert_eq!(snap.login_ok, 1);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.uploads_ok, 1);
        assert_eq!(snap.downloads_failed, 1);
    }

    #[test]
    fn test_clone_shares_state() {
        let metrics = Metrics::new();
        let other = metrics.clone();
        other.connection_opened();
        assert_eq!(metrics.snapshot().total_connections, 1);
    }
}
