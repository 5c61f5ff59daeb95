//! Hand-off pool between the task that produces invocations and the task that consumes them.
//!
//! Two matching disciplines share one lock:
//! - FIFO: [`InvocationPool::pop_next`] takes the oldest queued item or waits for the next push.
//! - keyed: [`InvocationPool::pop_next_for`] waits for an item pushed with a specific key (a
//!   request id). At most one waiter per key.
//!
//! Cancellation is dropping the pop future. Every registration carries its own [`WaiterId`], and
//! the drop guard removes exactly that registration, so cancelling one waiter never resolves or
//! disturbs another one.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("duplicate waiter for key {0}")]
    DuplicateWaiter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WaiterId(u64);

struct Entry<T> {
    key: Option<String>,
    item: T,
}

struct Inner<T> {
    queue: VecDeque<Entry<T>>,
    fifo_waiters: VecDeque<(WaiterId, oneshot::Sender<Entry<T>>)>,
    keyed_waiters: HashMap<String, (WaiterId, oneshot::Sender<Entry<T>>)>,
    next_waiter_id: u64,
    closed: bool,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            fifo_waiters: VecDeque::new(),
            keyed_waiters: HashMap::new(),
            next_waiter_id: 0,
            closed: false,
        }
    }
}

impl<T> Inner<T> {
    fn register(&mut self) -> (WaiterId, oneshot::Sender<Entry<T>>, oneshot::Receiver<Entry<T>>) {
        let id = WaiterId(self.next_waiter_id);
        self.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        (id, tx, rx)
    }

    /// Hands `entry` to a matching waiter. Keyed waiters win over FIFO waiters. Returns the entry
    /// when nobody is waiting for it.
    fn deliver(&mut self, mut entry: Entry<T>) -> Result<(), Entry<T>> {
        let keyed = match entry.key.as_deref() {
            Some(key) => self.keyed_waiters.remove(key),
            None => None,
        };
        if let Some((_, tx)) = keyed {
            match tx.send(entry) {
                Ok(()) => return Ok(()),
                Err(back) => entry = back,
            }
        }

        while let Some((_, tx)) = self.fifo_waiters.pop_front() {
            match tx.send(entry) {
                Ok(()) => return Ok(()),
                Err(back) => entry = back,
            }
        }

        Err(entry)
    }

    fn enqueue(&mut self, entry: Entry<T>) {
        if let Err(entry) = self.deliver(entry) {
            self.queue.push_back(entry);
        }
    }
}

/// Concurrent, unbounded hand-off structure. See the module docs.
pub struct InvocationPool<T> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
}

impl<T> std::fmt::Debug for InvocationPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InvocationPool")
            .field("name", &self.name)
            .field("queued", &inner.queue.len())
            .field("fifo_waiters", &inner.fifo_waiters.len())
            .field("keyed_waiters", &inner.keyed_waiters.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> Default for InvocationPool<T> {
    fn default() -> Self {
        Self::new("pool")
    }
}

impl<T> InvocationPool<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolves the oldest FIFO waiter with `item`, or queues it. Items pushed after
    /// [`close`](Self::close) are dropped.
    pub fn push(&self, item: T) {
        self.push_entry(Entry { key: None, item });
    }

    /// Resolves the waiter registered for `key` (or else the oldest FIFO waiter), or queues the
    /// item under `key`.
    pub fn push_keyed(&self, key: impl Into<String>, item: T) {
        self.push_entry(Entry {
            key: Some(key.into()),
            item,
        });
    }

    fn push_entry(&self, entry: Entry<T>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            tracing::debug!(pool = self.name, "push after close, dropping item");
            return;
        }
        inner.enqueue(entry);
    }

    /// Takes the oldest item, waiting for one if the queue is empty.
    ///
    /// Returns `None` once the pool is closed. Dropping the returned future cancels only this
    /// waiter.
    pub async fn pop_next(&self) -> Option<T> {
        let waiter = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return None;
            }
            if let Some(entry) = inner.queue.pop_front() {
                return Some(entry.item);
            }
            let (id, tx, rx) = inner.register();
            inner.fifo_waiters.push_back((id, tx));
            Waiter::new(self, id, None, rx)
        };

        waiter.wait().await
    }

    /// Takes the oldest item pushed under `key`, waiting for one if none is queued.
    ///
    /// Only one waiter may be registered per key at a time; a second concurrent call fails with
    /// [`PoolError::DuplicateWaiter`]. Returns `Ok(None)` once the pool is closed.
    pub async fn pop_next_for(&self, key: &str) -> Result<Option<T>, PoolError> {
        let waiter = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(None);
            }
            if inner.keyed_waiters.contains_key(key) {
                return Err(PoolError::DuplicateWaiter(key.to_string()));
            }
            if let Some(pos) = inner
                .queue
                .iter()
                .position(|e| e.key.as_deref() == Some(key))
            {
                return Ok(inner.queue.remove(pos).map(|e| e.item));
            }
            let (id, tx, rx) = inner.register();
            inner.keyed_waiters.insert(key.to_string(), (id, tx));
            Waiter::new(self, id, Some(key.to_string()), rx)
        };

        Ok(waiter.wait().await)
    }

    /// Closes the pool: every pending waiter resolves with `None`, queued items are dropped and
    /// later pops return `None` immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let dropped = inner.queue.len();
        inner.queue.clear();
        // Dropping the senders wakes every receiver with a closed error.
        inner.fifo_waiters.clear();
        inner.keyed_waiters.clear();
        tracing::debug!(pool = self.name, dropped_items = dropped, "pool closed");
    }

    /// Drops every queued item pushed under `key`. Registered waiters are left alone.
    pub fn discard_keyed(&self, key: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.queue.len();
        inner.queue.retain(|e| e.key.as_deref() != Some(key));
        before - inner.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registered FIFO and keyed waiters.
    pub fn waiter_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.fifo_waiters.len() + inner.keyed_waiters.len()
    }
}

/// One registration. Dropping it before it resolves removes exactly this registration.
struct Waiter<'a, T> {
    pool: &'a InvocationPool<T>,
    id: WaiterId,
    key: Option<String>,
    rx: oneshot::Receiver<Entry<T>>,
    resolved: bool,
}

impl<'a, T> Waiter<'a, T> {
    fn new(
        pool: &'a InvocationPool<T>,
        id: WaiterId,
        key: Option<String>,
        rx: oneshot::Receiver<Entry<T>>,
    ) -> Self {
        Self {
            pool,
            id,
            key,
            rx,
            resolved: false,
        }
    }

    async fn wait(mut self) -> Option<T> {
        let outcome = (&mut self.rx).await;
        self.resolved = true;
        outcome.ok().map(|entry| entry.item)
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }

        let mut inner = self.pool.inner.lock();
        let id = self.id;
        let removed = match self.key.as_deref() {
            Some(key) => {
                let owned = inner
                    .keyed_waiters
                    .get(key)
                    .is_some_and(|(registered, _)| *registered == id);
                owned && inner.keyed_waiters.remove(key).is_some()
            }
            None => {
                let pos = inner.fifo_waiters.iter().position(|(w, _)| *w == id);
                match pos {
                    Some(pos) => inner.fifo_waiters.remove(pos).is_some(),
                    None => false,
                }
            }
        };

        if removed {
            tracing::trace!(pool = self.pool.name, key = ?self.key, "waiter cancelled");
            return;
        }

        // A push resolved this waiter but the caller went away before observing it. Hand the
        // item to the next waiter, or put it back at the head of the queue.
        if let Ok(entry) = self.rx.try_recv() {
            if inner.closed {
                return;
            }
            if let Err(entry) = inner.deliver(entry) {
                inner.queue.push_front(entry);
            }
        }
    }
}
