use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counters describing what a server has done since it started.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    decode_failures: AtomicU64,
    pipeline_rejections: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_received(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn response_sent(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pipeline_rejected(&self) {
        self.pipeline_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            pipeline_rejections: self.pipeline_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub requests: u64,
    pub responses: u64,
    pub decode_failures: u64,
    pub pipeline_rejections: u64,
}

/// Bounds the number of connections served at once
#[derive(Debug)]
pub struct ConnectionTracker {
    active_connections: Arc<AtomicUsize>,
    connection_semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize) -> Self {
        Self {
            active_connections: Arc::new(AtomicUsize::new(0)),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Claims a connection slot, or `None` when every slot is taken.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = self.connection_semaphore.clone().try_acquire_owned().ok()?;
        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(active_connections = active, "Connection slot acquired");

        Some(ConnectionGuard {
            _permit: permit,
            active_connections: self.active_connections.clone(),
            start_time: Instant::now(),
        })
    }

    pub fn active(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.connection_semaphore.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// RAII guard for connection tracking
#[derive(Debug)]
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    active_connections: Arc<AtomicUsize>,
    start_time: Instant,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.active_connections.fetch_sub(1, Ordering::SeqCst) - 1;
        let duration = self.start_time.elapsed();

        tracing::debug!(
            active_connections = active,
            connection_duration_ms = duration.as_millis(),
            "Connection slot released"
        );
    }
}
