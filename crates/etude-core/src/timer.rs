// src/timer.rs
//! Indexed binary min-heap of expiry deadlines.
//!
//! Each node carries the id it was registered under, its deadline and the
//! callback to run when it expires. A side map `id -> heap index` makes
//! `adjust`/`remove` by id O(log n). Every swap goes through [`TimerHeap::swap`],
//! which rewrites both map entries, so the map can never drift from the array.

use std::collections::HashMap;
use std::hash::Hash;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnMut() + Send>;

const INITIAL_RESERVE: usize = 64;

struct TimerNode<K> {
    id: K,
    expires: Instant,
    on_expire: TimeoutCallback,
}

pub struct TimerHeap<K = RawFd> {
    heap: Vec<TimerNode<K>>,
    index: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> TimerHeap<K> {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(INITIAL_RESERVE),
            index: HashMap::with_capacity(INITIAL_RESERVE),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Registers `id` to expire `timeout` from now. An id that is already
    /// tracked gets its deadline and callback replaced in place.
    pub fn add(&mut self, id: K, timeout: Duration, on_expire: TimeoutCallback) {
        self.add_at(Instant::now(), id, timeout, on_expire);
    }

    /// Slides the deadline of `id` to `timeout` from now.
    /// Returns `false` if `id` is not tracked.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> bool {
        self.adjust_at(Instant::now(), id, timeout)
    }

    /// Runs and removes every node whose deadline has passed.
    pub fn pop_expired(&mut self) {
        self.pop_expired_at(Instant::now());
    }

    /// Time until the nearest deadline after evicting everything already due,
    /// or `None` when nothing is tracked.
    pub fn next_expiry(&mut self) -> Option<Duration> {
        self.next_expiry_at(Instant::now())
    }

    /// Expires `id` immediately: its callback runs and the node is removed.
    /// Returns `false` if `id` is not tracked.
    pub fn force_expire(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                let mut node = self.delete(i);
                (node.on_expire)();
                true
            }
            None => false,
        }
    }

    /// Removes `id` without running its callback.
    pub fn remove(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.delete(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn add_at(&mut self, now: Instant, id: K, timeout: Duration, on_expire: TimeoutCallback) {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.heap[i].expires = now + timeout;
                self.heap[i].on_expire = on_expire;
                self.resift(i);
            }
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires: now + timeout,
                    on_expire,
                });
                self.sift_up(i);
            }
        }
    }

    fn adjust_at(&mut self, now: Instant, id: K, timeout: Duration) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.heap[i].expires = now + timeout;
                self.resift(i);
                true
            }
            None => false,
        }
    }

    fn pop_expired_at(&mut self, now: Instant) {
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            // Detach first so the callback never observes a half-removed node.
            let mut node = self.delete(0);
            (node.on_expire)();
        }
    }

    fn next_expiry_at(&mut self, now: Instant) -> Option<Duration> {
        self.pop_expired_at(now);
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(now))
    }

    /// An expiry increase can only require sinking, a decrease only rising.
    fn resift(&mut self, i: usize) {
        let n = self.heap.len();
        if !self.sift_down(i, n) {
            self.sift_up(i);
        }
    }

    fn delete(&mut self, i: usize) -> TimerNode<K> {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap(i, last);
        }
        let node = self.heap.pop().expect("delete on empty timer heap");
        self.index.remove(&node.id);
        if i < self.heap.len() {
            self.resift(i);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].expires >= self.heap[parent].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Sinks node `i` within `heap[..n]`. Returns whether it moved.
    fn sift_down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > start
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

impl<K: Copy + Eq + Hash> Default for TimerHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}
