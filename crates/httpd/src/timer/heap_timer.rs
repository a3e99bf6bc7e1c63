//! Indexed binary min-heap of idle timeouts.
//!
//! Every node carries the id of the connection it belongs to, its expiry instant and a
//! one-shot callback. A side table maps `id -> heap index` and is rewritten on every
//! swap, so any node (not only the root) can be found and moved in `O(log n)`. That is
//! what lets activity on a connection push its deadline back.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::trace;

/// Identifier of a timer, the connection's socket descriptor
pub type TimerId = i32;

/// Continuation run once when a timer expires.
///
/// It must not own the connection it closes; capture a weak handle and check that
/// the connection still holds the same socket when the callback runs.
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// Initial heap capacity
const INIT_CAPACITY: usize = 64;

struct TimerNode {
    id: TimerId,
    expires: Instant,
    callback: TimeoutCallback,
}

/// Idle timers keyed by connection, earliest expiry at the root.
///
/// Callbacks run on the thread calling [`HeapTimer::tick`], outside of any lock.
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    refs: HashMap<TimerId, usize>,
}

impl HeapTimer {
    /// An empty timer with room for 64 nodes.
    pub fn new() -> Self {
        Self { heap: Vec::with_capacity(INIT_CAPACITY), refs: HashMap::with_capacity(INIT_CAPACITY) }
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether `id` has a pending timer.
    pub fn contains(&self, id: TimerId) -> bool {
        self.refs.contains_key(&id)
    }

    /// Expiry of the earliest timer.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.first().map(|node| node.expires)
    }

    /// Schedules `callback` to run `timeout` from now.
    ///
    /// A known `id` gets its expiry and callback replaced in place; the node then moves
    /// down, or up when it does not need to move down.
    pub fn add(&mut self, id: TimerId, timeout: Duration, callback: TimeoutCallback) {
        self.add_at(id, Instant::now(), timeout, callback);
    }

    /// [`HeapTimer::add`] against an explicit clock.
    pub fn add_at(&mut self, id: TimerId, now: Instant, timeout: Duration, callback: TimeoutCallback) {
        let expires = now + timeout;
        if let Some(&i) = self.refs.get(&id) {
            let node = &mut self.heap[i];
            node.expires = expires;
            node.callback = callback;
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        } else {
            let i = self.heap.len();
            self.refs.insert(id, i);
            self.heap.push(TimerNode { id, expires, callback });
            self.sift_up(i);
        }
    }

    /// Moves the expiry of `id` to `timeout` from now. Returns `false` for an unknown id.
    ///
    /// Callers only ever extend a deadline, so the node only needs to move down.
    pub fn adjust(&mut self, id: TimerId, timeout: Duration) -> bool {
        self.adjust_at(id, Instant::now(), timeout)
    }

    /// [`HeapTimer::adjust`] against an explicit clock.
    pub fn adjust_at(&mut self, id: TimerId, now: Instant, timeout: Duration) -> bool {
        let Some(&i) = self.refs.get(&id) else {
            return false;
        };
        self.heap[i].expires = now + timeout;
        self.sift_down(i, self.heap.len());
        true
    }

    /// Runs the callback of `id` right away and removes its node.
    pub fn do_work(&mut self, id: TimerId) {
        if let Some(&i) = self.refs.get(&id) {
            let node = self.del(i);
            (node.callback)();
        }
    }

    /// Removes `id` without running its callback.
    pub fn remove(&mut self, id: TimerId) -> bool {
        match self.refs.get(&id) {
            Some(&i) => {
                self.del(i);
                true
            }
            None => false,
        }
    }

    /// Runs and removes every timer whose expiry has been reached, returning how many fired.
    pub fn tick(&mut self) -> usize {
        self.tick_at(Instant::now())
    }

    /// [`HeapTimer::tick`] against an explicit clock.
    pub fn tick_at(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.del(0);
            trace!(id = node.id, "timer expired");
            (node.callback)();
            fired += 1;
        }
        fired
    }

    /// Removes the root node without running it.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.del(0);
        }
    }

    /// Fires expired timers, then returns the time left until the next one.
    ///
    /// `None` means no timer is pending and the caller may block indefinitely.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.next_tick_at(Instant::now())
    }

    /// [`HeapTimer::next_tick`] against an explicit clock.
    pub fn next_tick_at(&mut self, now: Instant) -> Option<Duration> {
        self.tick_at(now);
        self.heap.first().map(|root| root.expires.saturating_duration_since(now))
    }

    /// Drops every pending timer without running it.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.refs.clear();
    }

    fn del(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_node(i, last);
            if !self.sift_down(i, last) {
                self.sift_up(i);
            }
        }
        // the node to remove is now the last one
        let node = self.heap.pop().expect("heap is not empty");
        self.refs.remove(&node.id);
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_node(i, parent);
            i = parent;
        }
    }

    /// Sifts the node at `index` down within the first `n` nodes, reporting whether it moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = 2 * i + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_node(i, child);
            i = child;
            child = 2 * i + 1;
        }
        i > index
    }

    fn swap_node(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.refs.insert(self.heap[i].id, i);
        self.refs.insert(self.heap[j].id, j);
    }
}

impl Default for HeapTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapTimer").field("len", &self.heap.len()).field("next_expiry", &self.next_expiry()).finish()
    }
}
