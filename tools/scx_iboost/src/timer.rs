// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: delayed work items on a shared worker pool
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cancelable one-shot timers.
//!
//! A [`TimerService`] owns one dispatcher thread, which keeps armed deadlines
//! in a min-heap, and a small pool of worker threads that run expired
//! callbacks. Callbacks never run on the thread that armed them.
//!
//! Timers are modelled as reusable [`DelayedWork`] items, each bound to a
//! fixed callback:
//! * [`DelayedWork::queue`] is a no-op while the item is already pending.
//! * [`DelayedWork::cancel_sync`] disarms the item and waits for an in-flight
//!   callback to return.
//! * An item never runs concurrently with itself.

use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use log::{trace, warn};

use crate::lock;

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct WorkState {
    pending: bool,
    running: bool,
    // Bumped on every successful queue(); stale heap entries carry an older value.
    generation: u64,
}

struct WorkItem {
    name: String,
    callback: Callback,
    state: Mutex<WorkState>,
    idle: Condvar,
}

impl WorkItem {
    fn run(&self, generation: u64) {
        let mut st = lock(&self.state);
        while st.running {
            st = self.idle.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        if !st.pending || st.generation != generation {
            return;
        }
        st.pending = false;
        st.running = true;
        drop(st);

        trace!("timer: running {}", self.name);
        if panic::catch_unwind(AssertUnwindSafe(|| (self.callback)())).is_err() {
            warn!("timer: callback {} panicked", self.name);
        }

        lock(&self.state).running = false;
        self.idle.notify_all();
    }
}

struct Armed {
    deadline: Instant,
    seq: u64,
    generation: u64,
    item: Arc<WorkItem>,
}

impl PartialEq for Armed {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Armed {}

impl PartialOrd for Armed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Armed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

// Longer delays are clamped so deadlines never overflow.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Armed>>,
    seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn arm(&self, item: Arc<WorkItem>, generation: u64, delay: Duration) {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay.min(MAX_DELAY))
            .unwrap_or(now);
        let mut q = lock(&self.queue);
        q.seq = q.seq.wrapping_add(1);
        let seq = q.seq;
        q.heap.push(Reverse(Armed {
            deadline,
            seq,
            generation,
            item,
        }));
        drop(q);
        self.wakeup.notify_one();
    }
}

/// Dispatcher plus worker pool backing a set of [`DelayedWork`] items.
pub struct TimerService {
    name: String,
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(name: &str, nr_workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = channel::unbounded::<(Arc<WorkItem>, u64)>();
        let mut threads = Vec::with_capacity(nr_workers + 1);

        for i in 0..nr_workers.max(1) {
            let rx: Receiver<(Arc<WorkItem>, u64)> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-wq/{i}"))
                .spawn(move || {
                    for (item, generation) in rx.iter() {
                        item.run(generation);
                    }
                })
                .with_context(|| format!("failed to spawn {name} worker {i}"))?;
            threads.push(handle);
        }

        let dispatch_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || dispatch_loop(&dispatch_shared, tx))
            .with_context(|| format!("failed to spawn {name} dispatcher"))?;
        threads.push(handle);

        Ok(Self {
            name: name.to_string(),
            shared,
            threads: Mutex::new(threads),
        })
    }
}

fn dispatch_loop(shared: &Shared, tx: Sender<(Arc<WorkItem>, u64)>) {
    let mut q = lock(&shared.queue);
    loop {
        if q.shutdown {
            break;
        }
        let now = Instant::now();
        let next = q.heap.peek().map(|Reverse(armed)| armed.deadline);
        match next {
            None => {
                q = shared.wakeup.wait(q).unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) if deadline <= now => {
                if let Some(Reverse(armed)) = q.heap.pop() {
                    if tx.send((armed.item, armed.generation)).is_err() {
                        break;
                    }
                }
            }
            Some(deadline) => {
                q = shared
                    .wakeup
                    .wait_timeout(q, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        }
    }
    // Dropping tx here lets the pool drain out.
}

impl Drop for TimerService {
    fn drop(&mut self) {
        {
            let mut q = lock(&self.shared.queue);
            q.shutdown = true;
            q.heap.clear();
        }
        self.shared.wakeup.notify_all();

        let me = thread::current().id();
        for handle in lock(&self.threads).drain(..) {
            // The last engine reference may be released from inside a callback.
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("{}: timer thread panicked", self.name);
            }
        }
    }
}

/// A reusable one-shot timer bound to a fixed callback.
pub struct DelayedWork {
    item: Arc<WorkItem>,
    shared: Arc<Shared>,
}

impl DelayedWork {
    pub fn new<F>(service: &TimerService, name: &str, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            item: Arc::new(WorkItem {
                name: name.to_string(),
                callback: Box::new(callback),
                state: Mutex::new(WorkState::default()),
                idle: Condvar::new(),
            }),
            shared: Arc::clone(&service.shared),
        }
    }

    /// Arm the timer to fire after `delay`. Returns false, leaving the
    /// existing deadline untouched, if it is already pending.
    pub fn queue(&self, delay: Duration) -> bool {
        let generation = {
            let mut st = lock(&self.item.state);
            if st.pending {
                return false;
            }
            st.pending = true;
            st.generation = st.generation.wrapping_add(1);
            st.generation
        };
        self.shared.arm(Arc::clone(&self.item), generation, delay);
        true
    }

    /// Disarm the timer and wait until a callback already in flight has
    /// returned. Returns whether the timer was pending.
    ///
    /// Must not be called from this item's own callback.
    pub fn cancel_sync(&self) -> bool {
        let mut st = lock(&self.item.state);
        let was_pending = st.pending;
        st.pending = false;
        while st.running {
            st = self.item.idle.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.item.state).pending
    }
}
