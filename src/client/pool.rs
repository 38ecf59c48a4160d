use super::connection::{ConnectionId, Destination};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Idle connection bounds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per destination; the oldest is evicted beyond this
    pub max_idle_per_destination: usize,
    /// Idle connections older than this are discarded instead of reused
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_destination: 8,
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// What the pool needs to know about a connection.
pub trait Pooled: Send {
    fn id(&self) -> ConnectionId;
    fn destination(&self) -> &Destination;
    /// No request in flight and no closure signaled.
    fn is_reusable(&self) -> bool;
}

struct Idle<C> {
    connection: C,
    since: Instant,
}

/// Keyed cache of idle, reusable connections.
pub struct ConnectionPool<C: Pooled> {
    config: PoolConfig,
    idle: Mutex<HashMap<Destination, VecDeque<Idle<C>>>>,
}

impl<C: Pooled> ConnectionPool<C> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Takes the most recently released connection for `destination`, discarding
    /// any that went stale while idle.
    pub fn acquire(&self, destination: &Destination) -> Option<C> {
        let mut idle = self.idle.lock();
        let queue = idle.get_mut(destination)?;
        let mut found = None;
        while let Some(entry) = queue.pop_back() {
            let expired = self
                .config
                .idle_timeout
                .is_some_and(|limit| entry.since.elapsed() > limit);
            if expired || !entry.connection.is_reusable() {
                debug!(id = %entry.connection.id(), %destination, "discarding stale connection");
                continue;
            }
            found = Some(entry.connection);
            break;
        }
        if queue.is_empty() {
            idle.remove(destination);
        }
        found
    }

    /// Returns a connection to the pool. Connections that are busy or closed are
    /// dropped and `false` is returned.
    pub fn release(&self, connection: C) -> bool {
        if !connection.is_reusable() || self.config.max_idle_per_destination == 0 {
            debug!(id = %connection.id(), "connection not reusable, dropping");
            return false;
        }

        let mut idle = self.idle.lock();
        let queue = idle.entry(connection.destination().clone()).or_default();
        if queue.len() >= self.config.max_idle_per_destination {
            if let Some(evicted) = queue.pop_front() {
                debug!(id = %evicted.connection.id(), "evicting oldest idle connection");
            }
        }
        debug!(id = %connection.id(), destination = %connection.destination(), "connection pooled");
        queue.push_back(Idle {
            connection,
            since: Instant::now(),
        });
        true
    }

    /// Removes an idle connection unconditionally. Returns whether it was pooled.
    pub fn invalidate(&self, id: ConnectionId) -> bool {
        let mut idle = self.idle.lock();
        let mut removed = false;
        idle.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|entry| entry.connection.id() != id);
            removed |= queue.len() != before;
            !queue.is_empty()
        });
        removed
    }

    /// Drops every idle connection.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(VecDeque::len).sum()
    }

    pub fn idle_count_for(&self, destination: &Destination) -> usize {
        self.idle.lock().get(destination).map_or(0, VecDeque::len)
    }
}

impl<C: Pooled> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
