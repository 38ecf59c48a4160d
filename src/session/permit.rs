//! Renewable expiry timers.
//!
//! Every permit from one issuer shares the same lifetime, so a renewal always
//! produces the latest deadline of all. The issuer exploits this by keeping permits
//! in a doubly-linked list ordered by deadline: issuing appends, renewing moves the
//! node to the tail, and the single timer task only ever looks at the head. All three
//! are O(1).

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

/// Receives the targets of expired permits.
pub trait PermitListener<T>: Send + Sync + 'static {
    fn on_expiry(&self, target: T);
}

impl<T, F> PermitListener<T> for F
where
    F: Fn(T) + Send + Sync + 'static,
{
    fn on_expiry(&self, target: T) {
        self(target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitState {
    Outstanding,
    Cancelled,
    Expired,
}

impl PermitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PermitState::Outstanding,
            1 => PermitState::Cancelled,
            _ => PermitState::Expired,
        }
    }
}

/// Permit state shared between the permit and its list node. Written only while the
/// list lock is held.
#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> PermitState {
        PermitState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: PermitState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

struct Node<T> {
    target: T,
    deadline: Instant,
    prev: Option<usize>,
    next: Option<usize>,
    state: Arc<StateCell>,
}

/// Deadline-ordered intrusive list over a slab of nodes.
struct DeadlineList<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> DeadlineList<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn node(&self, index: usize) -> Option<&Node<T>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut Node<T>> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    fn push_back(&mut self, target: T, deadline: Instant, state: Arc<StateCell>) -> usize {
        let node = Node {
            target,
            deadline,
            prev: None,
            next: None,
            state,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                index
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.link_back(index);
        self.len += 1;
        index
    }

    fn link_back(&mut self, index: usize) {
        let tail = self.tail;
        if let Some(node) = self.node_mut(index) {
            node.prev = tail;
            node.next = None;
        }
        match tail.and_then(|t| self.node_mut(t)) {
            Some(tail) => tail.next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    fn unlink(&mut self, index: usize) {
        let Some((prev, next)) = self.node(index).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev.and_then(|p| self.node_mut(p)) {
            Some(prev) => prev.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(next) => next.prev = prev,
            None => self.tail = prev,
        }
    }

    fn move_to_back(&mut self, index: usize, deadline: Instant) {
        if self.tail != Some(index) {
            self.unlink(index);
            self.link_back(index);
        }
        if let Some(node) = self.node_mut(index) {
            node.deadline = deadline;
        }
    }

    fn remove(&mut self, index: usize) -> Option<Node<T>> {
        self.node(index)?;
        self.unlink(index);
        let node = self.slots[index].take()?;
        self.free.push(index);
        self.len -= 1;
        Some(node)
    }

    fn front_deadline(&self) -> Option<Instant> {
        self.head.and_then(|h| self.node(h)).map(|n| n.deadline)
    }

    fn drain(&mut self) -> Vec<Node<T>> {
        let mut nodes = Vec::with_capacity(self.len);
        while let Some(head) = self.head {
            match self.remove(head) {
                Some(node) => nodes.push(node),
                None => break,
            }
        }
        nodes
    }
}

struct Shared<T> {
    lifetime: Duration,
    list: Mutex<DeadlineList<T>>,
    closed: AtomicBool,
    wakeup: Notify,
    listener: Box<dyn PermitListener<T>>,
}

/// Issues permits that expire `lifetime` after their last renewal.
///
/// Expiry notifications are delivered on a background task, so the issuer must be
/// created inside a Tokio runtime.
pub struct TimedPermitIssuer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> TimedPermitIssuer<T> {
    pub fn new(lifetime: Duration, listener: impl PermitListener<T>) -> Self {
        let shared = Arc::new(Shared {
            lifetime,
            list: Mutex::new(DeadlineList::new()),
            closed: AtomicBool::new(false),
            wakeup: Notify::new(),
            listener: Box::new(listener),
        });
        let task = tokio::spawn(run_timer(shared.clone()));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.shared.lifetime
    }

    /// Starts a permit for `target`, due one lifetime from now. Once the issuer is
    /// closed the permit is born cancelled.
    pub fn issue(&self, target: T) -> TimedPermit<T> {
        let state = Arc::new(StateCell::default());
        let deadline = Instant::now() + self.shared.lifetime;

        let mut list = self.shared.list.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            state.set(PermitState::Cancelled);
            return TimedPermit {
                shared: self.shared.clone(),
                index: usize::MAX,
                state,
            };
        }
        let was_empty = list.head.is_none();
        let index = list.push_back(target, deadline, state.clone());
        drop(list);

        if was_empty {
            self.shared.wakeup.notify_one();
        }
        TimedPermit {
            shared: self.shared.clone(),
            index,
            state,
        }
    }

    /// Number of permits neither cancelled nor expired.
    pub fn outstanding(&self) -> usize {
        self.shared.list.lock().len
    }

    /// Cancels every outstanding permit without notification and stops the timer.
    pub fn close(&self) {
        let drained = {
            let mut list = self.shared.list.lock();
            self.shared.closed.store(true, Ordering::Release);
            let nodes = list.drain();
            for node in &nodes {
                node.state.set(PermitState::Cancelled);
            }
            nodes
        };
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!(cancelled = drained.len(), "permit issuer closed");
    }
}

impl<T: Send + 'static> Drop for TimedPermitIssuer<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// A renewable, cancellable expiry timer for one target.
pub struct TimedPermit<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    index: usize,
    state: Arc<StateCell>,
}

impl<T: Send + 'static> TimedPermit<T> {
    pub fn state(&self) -> PermitState {
        self.state.get()
    }

    /// Pushes the deadline to one lifetime from now. Fails once the permit was
    /// cancelled or has expired.
    pub fn renew(&self) -> bool {
        let mut list = self.shared.list.lock();
        if self.state.get() != PermitState::Outstanding {
            return false;
        }
        list.move_to_back(self.index, Instant::now() + self.shared.lifetime);
        true
    }

    /// Withdraws the permit. Only the call that moves it out of the outstanding state
    /// returns `true`; no expiry is delivered afterwards.
    pub fn cancel(&self) -> bool {
        let mut list = self.shared.list.lock();
        if self.state.get() != PermitState::Outstanding {
            return false;
        }
        list.remove(self.index);
        self.state.set(PermitState::Cancelled);
        true
    }

    /// Current deadline while outstanding.
    pub fn deadline(&self) -> Option<Instant> {
        let list = self.shared.list.lock();
        if self.state.get() != PermitState::Outstanding {
            return None;
        }
        list.node(self.index).map(|n| n.deadline)
    }
}

impl<T: Send + 'static> std::fmt::Debug for TimedPermit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedPermit")
            .field("state", &self.state())
            .finish()
    }
}

async fn run_timer<T: Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        let (expired, next) = {
            let mut list = shared.list.lock();
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let mut expired = Vec::new();
            while let Some(head) = list.head {
                if list.node(head).is_none_or(|n| n.deadline > now) {
                    break;
                }
                if let Some(node) = list.remove(head) {
                    node.state.set(PermitState::Expired);
                    expired.push(node.target);
                }
            }
            (expired, list.front_deadline())
        };

        if !expired.is_empty() {
            trace!(count = expired.len(), "permits expired");
        }
        for target in expired {
            shared.listener.on_expiry(target);
        }

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = shared.wakeup.notified() => {}
                }
            }
            None => shared.wakeup.notified().await,
        }
    }
}
