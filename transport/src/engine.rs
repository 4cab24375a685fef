//! The timer and task source.
//!
//! All timers (keepalive, ping timeout, settings watchdog, tarpit, BDP)
//! and thread handoffs go through an `EventEngine`. The trait keeps the
//! transport free of any particular runtime; `ThreadedEngine` is the
//! stock implementation backed by a single timer thread.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashSet;
use parking_lot::{Condvar, Mutex};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled task for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Timer and task scheduling contract consumed by the transport.
pub trait EventEngine: Send + Sync {
    /// Run a task as soon as possible on another thread.
    fn spawn(&self, task: Task);
    /// Run a task after a delay.
    fn run_after(&self, delay: Duration, task: Task) -> TaskHandle;
    /// Cancel a scheduled task. Returns true when the task had not yet
    /// started running (and now never will).
    fn cancel(&self, handle: TaskHandle) -> bool;
}

struct Entry {
    at: Instant,
    seq: u64,
    id: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct EngineShared {
    queue: Mutex<EngineQueue>,
    wake: Condvar,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

struct EngineQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    pending: AHashSet<u64>,
    seq: u64,
}

/// Timer engine backed by one worker thread.
pub struct ThreadedEngine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Default for ThreadedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedEngine {
    pub fn new() -> Self {
        let shared = Arc::new(EngineShared {
            queue: Mutex::new(EngineQueue {
                heap: BinaryHeap::new(),
                pending: AHashSet::new(),
                seq: 0,
            }),
            wake: Condvar::new(),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("transport-timers".to_string())
            .spawn(move || Self::worker_loop(worker_shared))
            .expect("spawn timer thread");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn worker_loop(shared: Arc<EngineShared>) {
        let mut queue = shared.queue.lock();
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let next_deadline = match queue.heap.peek() {
                Some(Reverse(entry)) => Some(entry.at),
                None => None,
            };
            match next_deadline {
                Some(at) if at <= now => {
                    let Reverse(entry) = queue.heap.pop().expect("peeked");
                    if !queue.pending.remove(&entry.id) {
                        // Cancelled while queued.
                        continue;
                    }
                    drop(queue);
                    (entry.task)();
                    queue = shared.queue.lock();
                }
                Some(at) => {
                    let _ = shared.wake.wait_for(&mut queue, at - now);
                }
                None => {
                    shared.wake.wait(&mut queue);
                }
            }
        }
    }
}

impl EventEngine for ThreadedEngine {
    fn spawn(&self, task: Task) {
        self.run_after(Duration::ZERO, task);
    }

    fn run_after(&self, delay: Duration, task: Task) -> TaskHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.shared.queue.lock();
        queue.seq += 1;
        let seq = queue.seq;
        queue.pending.insert(id);
        queue.heap.push(Reverse(Entry {
            at: Instant::now() + delay,
            seq,
            id,
            task,
        }));
        drop(queue);
        self.shared.wake.notify_one();
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        // Entries stay in the heap; the worker skips ids no longer
        // pending.
        self.shared.queue.lock().pending.remove(&handle.0)
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        if let Some(worker) = self.worker.lock().take() {
            // The final handle may be dropped by a task running on the
            // worker itself; joining would then wait on the current
            // thread. Detach in that case, the shutdown flag stops it.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
