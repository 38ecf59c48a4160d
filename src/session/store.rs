use super::permit::{PermitState, TimedPermit, TimedPermitIssuer};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info};

/// Session store configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which a session expires
    pub lifetime: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(30 * 60),
        }
    }
}

/// Observer of session lifecycle events. Every method defaults to doing nothing.
pub trait SessionListener: Send + Sync {
    fn session_created(&self, _session: &Session) {}
    fn session_destroyed(&self, _session: &Session) {}
    fn session_expired(&self, _session: &Session) {}
}

/// Identifies the session instance a permit belongs to, so a stale expiry can never
/// remove a newer session bound to the same key.
#[derive(Debug, Clone)]
struct PermitTarget {
    key: String,
    serial: u64,
}

/// A keyed, expiring bag of attributes.
pub struct Session {
    key: String,
    serial: u64,
    attributes: Mutex<HashMap<String, String>>,
    valid: AtomicBool,
    attached: AtomicBool,
    created: SystemTime,
    last_access: Mutex<Instant>,
    permit: TimedPermit<PermitTarget>,
    store: Weak<StoreInner>,
}

impl Session {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.lock().get(name).cloned()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.attributes.lock().insert(name.into(), value.into())
    }

    pub fn remove_attribute(&self, name: &str) -> Option<String> {
        self.attributes.lock().remove(name)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attributes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// False once the session was destroyed, expired, or its store closed.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Whether the session identifier has been sent to the client.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Deadline of the session's permit while the session is live.
    pub fn expires_at(&self) -> Option<Instant> {
        self.permit.deadline()
    }

    pub fn permit_state(&self) -> PermitState {
        self.permit.state()
    }

    /// Removes the session from its store. Returns false if it was already gone.
    pub fn destroy(&self) -> bool {
        match self.store.upgrade() {
            Some(store) => store.remove(&self.key, self.serial, Removal::Destroyed),
            None => false,
        }
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("valid", &self.is_valid())
            .field("attached", &self.is_attached())
            .field("permit", &self.permit)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Destroyed,
    Expired,
}

struct StoreInner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    issuer: TimedPermitIssuer<PermitTarget>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    next_serial: AtomicU64,
    closed: AtomicBool,
}

impl StoreInner {
    fn listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.lock().clone()
    }

    /// Takes a session out of the map exactly once and reports why.
    fn remove(&self, key: &str, serial: u64, removal: Removal) -> bool {
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.get(key) {
                Some(session) if session.serial == serial => sessions.remove(key),
                _ => None,
            }
        };
        let Some(session) = session else {
            return false;
        };

        if removal == Removal::Destroyed {
            session.permit.cancel();
        }
        session.invalidate();
        debug!(key = %session.key, ?removal, "session removed");
        for listener in self.listeners() {
            match removal {
                Removal::Destroyed => listener.session_destroyed(&session),
                Removal::Expired => listener.session_expired(&session),
            }
        }
        true
    }
}

/// Keyed sessions guarded by renewable expiry permits.
///
/// Cloning is cheap; clones share the same sessions. Must be created inside a Tokio
/// runtime.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        let inner = Arc::new_cyclic(|store: &Weak<StoreInner>| {
            let store = store.clone();
            let on_expiry = move |target: PermitTarget| {
                if let Some(store) = store.upgrade() {
                    store.remove(&target.key, target.serial, Removal::Expired);
                }
            };
            StoreInner {
                sessions: Mutex::new(HashMap::new()),
                issuer: TimedPermitIssuer::new(config.lifetime, on_expiry),
                listeners: Mutex::new(Vec::new()),
                next_serial: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Binds a new session to `key`. Returns `None` when the key is already bound or
    /// the store is closed.
    pub fn create_session(&self, key: impl Into<String>) -> Option<Arc<Session>> {
        let key = key.into();
        let session = {
            let mut sessions = self.inner.sessions.lock();
            if self.inner.closed.load(Ordering::Acquire) || sessions.contains_key(&key) {
                return None;
            }
            let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
            let permit = self.inner.issuer.issue(PermitTarget {
                key: key.clone(),
                serial,
            });
            let session = Arc::new(Session {
                key: key.clone(),
                serial,
                attributes: Mutex::new(HashMap::new()),
                valid: AtomicBool::new(true),
                attached: AtomicBool::new(false),
                created: SystemTime::now(),
                last_access: Mutex::new(Instant::now()),
                permit,
                store: Arc::downgrade(&self.inner),
            });
            sessions.insert(key, session.clone());
            session
        };

        debug!(key = %session.key, "session created");
        for listener in self.inner.listeners() {
            listener.session_created(&session);
        }
        Some(session)
    }

    /// Creates a session under a fresh random key.
    pub fn create_session_with_generated_key(&self) -> Option<Arc<Session>> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            let key = format!("{:032x}", rand::rng().random::<u128>());
            if let Some(session) = self.create_session(key) {
                return Some(session);
            }
        }
    }

    /// Looks up a live session and renews its expiry.
    pub fn locate_session(&self, key: &str) -> Option<Arc<Session>> {
        let session = self.inner.sessions.lock().get(key).cloned()?;
        if !session.permit.renew() {
            // Lost the race against expiry; the expiry path removes it.
            return None;
        }
        session.touch();
        Some(session)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops expiry, invalidates every session and reports each as destroyed.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.issuer.close();
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().drain().map(|(_, s)| s).collect();
        info!(sessions = sessions.len(), "session store closed");

        let listeners = self.inner.listeners();
        for session in sessions {
            session.invalidate();
            for listener in &listeners {
                listener.session_destroyed(&session);
            }
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
