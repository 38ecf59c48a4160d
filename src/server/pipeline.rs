//! In-order release of pipelined responses.
//!
//! HTTP/1.1 lets a client send several requests before reading any response, and
//! requires the responses in request order. Handlers may finish in any order, so each
//! finished response waits in its entry until every earlier entry has been released.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{Notify, mpsc};
use tracing::trace;

/// Position of a request within its connection.
pub type RequestId = u64;

/// Receives released items, in admission order.
///
/// Called with the pipeline lock held; implementations must not call back into the
/// pipeline.
pub trait PipelineListener<T>: Send + Sync {
    fn released(&self, id: RequestId, item: T);
}

impl<T: Send> PipelineListener<T> for mpsc::UnboundedSender<(RequestId, T)> {
    fn released(&self, id: RequestId, item: T) {
        // The receiver only goes away once the connection is finished with.
        let _ = self.send((id, item));
    }
}

struct Entry<T> {
    id: RequestId,
    item: Option<T>,
}

type EmptyTask = Box<dyn FnOnce() + Send>;

struct Queue<T> {
    entries: VecDeque<Entry<T>>,
    on_empty: Vec<EmptyTask>,
}

/// Per-connection queue of admitted requests.
pub struct RequestPipeline<T> {
    max_depth: usize,
    queue: Mutex<Queue<T>>,
    listener: Box<dyn PipelineListener<T>>,
    capacity: Notify,
}

impl<T: Send> RequestPipeline<T> {
    pub fn new(max_depth: usize, listener: impl PipelineListener<T> + 'static) -> Self {
        Self {
            max_depth,
            queue: Mutex::new(Queue {
                entries: VecDeque::new(),
                on_empty: Vec::new(),
            }),
            listener: Box::new(listener),
            capacity: Notify::new(),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Appends `id` unless the pipeline is full.
    pub fn admit(&self, id: RequestId) -> bool {
        let mut queue = self.queue.lock();
        if queue.entries.len() >= self.max_depth {
            return false;
        }
        queue.entries.push_back(Entry { id, item: None });
        true
    }

    /// Records the item for `id` and releases every finished entry at the front.
    ///
    /// An unknown `id` is admitted at the back first, regardless of depth. Returns
    /// false if `id` already had an item.
    pub fn complete(&self, id: RequestId, item: T) -> bool {
        let tasks = {
            let mut queue = self.queue.lock();
            let position = match queue.entries.iter().position(|e| e.id == id) {
                Some(position) => position,
                None => {
                    queue.entries.push_back(Entry { id, item: None });
                    queue.entries.len() - 1
                }
            };
            let entry = &mut queue.entries[position];
            if entry.item.is_some() {
                return false;
            }
            entry.item = Some(item);

            let mut released = 0;
            while queue.entries.front().is_some_and(|e| e.item.is_some()) {
                if let Some(Entry { id, item: Some(item) }) = queue.entries.pop_front() {
                    self.listener.released(id, item);
                    released += 1;
                }
            }
            if released > 0 {
                trace!(released, depth = queue.entries.len(), "pipeline released");
                self.capacity.notify_waiters();
            }
            if queue.entries.is_empty() {
                std::mem::take(&mut queue.on_empty)
            } else {
                Vec::new()
            }
        };

        for task in tasks {
            task();
        }
        true
    }

    /// Runs `task` now if nothing is queued, otherwise once the queue next drains.
    pub fn run_when_empty(&self, task: impl FnOnce() + Send + 'static) {
        let mut queue = self.queue.lock();
        if queue.entries.is_empty() {
            drop(queue);
            task();
        } else {
            queue.on_empty.push(Box::new(task));
        }
    }

    /// Drops every entry and pending empty-task without notifying anyone.
    pub fn dispose_all(&self) {
        let mut queue = self.queue.lock();
        queue.entries.clear();
        queue.on_empty.clear();
        drop(queue);
        self.capacity.notify_waiters();
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Resolves once another request can be admitted.
    pub async fn wait_for_capacity(&self) {
        loop {
            let released = self.capacity.notified();
            if self.depth() < self.max_depth {
                return;
            }
            released.await;
        }
    }
}

impl<T> std::fmt::Debug for RequestPipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("max_depth", &self.max_depth)
            .field("depth", &self.queue.lock().entries.len())
            .finish()
    }
}
