//! Serialized control plane.
//!
//! Every mutation of transport state runs as a task on the combiner: a
//! single-consumer work queue guaranteeing at most one task executes at
//! any moment. Submission never blocks and is legal from inside a
//! running task. Two queues exist: the primary FIFO, and a "finally"
//! queue drained only once the primary is empty for this turn (used to
//! batch writes behind all other pending work).
//!
//! The thread that tips the combiner from idle to active drains it.
//! A task may ask the combiner to yield the thread (`request_yield` via
//! the state hook); draining then continues on the event engine.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::EventEngine;

pub(crate) type Work<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Hooks the combiner needs from the state it guards.
pub(crate) trait CombinerState: Send + 'static {
    /// Callbacks handed back by the finished task, run after the state
    /// lock is released. This is how completion closures reach user code
    /// without holding up the control plane.
    fn take_after_turn(&mut self) -> Vec<Box<dyn FnOnce() + Send + 'static>>;

    /// True when the last task asked to yield the thread before more
    /// queued work runs (bounds contiguous CPU in the parse loop).
    fn take_yield_request(&mut self) -> bool;
}

struct Queues<S> {
    primary: VecDeque<Work<S>>,
    finally: VecDeque<Work<S>>,
    active: bool,
}

pub(crate) struct Combiner<S> {
    engine: Arc<dyn EventEngine>,
    queues: Mutex<Queues<S>>,
    state: Mutex<S>,
}

impl<S: CombinerState> Combiner<S> {
    pub fn new(engine: Arc<dyn EventEngine>, state: S) -> Arc<Self> {
        Arc::new(Self {
            engine,
            queues: Mutex::new(Queues {
                primary: VecDeque::new(),
                finally: VecDeque::new(),
                active: false,
            }),
            state: Mutex::new(state),
        })
    }

    /// Submit work in FIFO order.
    pub fn run(self: &Arc<Self>, work: Work<S>) {
        let should_drain = {
            let mut queues = self.queues.lock();
            queues.primary.push_back(work);
            if queues.active {
                false
            } else {
                queues.active = true;
                true
            }
        };
        if should_drain {
            self.drain();
        }
    }

    /// Submit work that runs only after all currently queued primary
    /// work has drained.
    pub fn run_finally(self: &Arc<Self>, work: Work<S>) {
        let should_drain = {
            let mut queues = self.queues.lock();
            queues.finally.push_back(work);
            if queues.active {
                false
            } else {
                queues.active = true;
                true
            }
        };
        if should_drain {
            self.drain();
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let work = {
                let mut queues = self.queues.lock();
                let next = match queues.primary.pop_front() {
                    Some(work) => Some(work),
                    None => queues.finally.pop_front(),
                };
                match next {
                    Some(work) => work,
                    None => {
                        queues.active = false;
                        return;
                    }
                }
            };
            let (after_turn, yielded) = {
                let mut state = self.state.lock();
                work(&mut state);
                (state.take_after_turn(), state.take_yield_request())
            };
            for callback in after_turn {
                callback();
            }
            if yielded {
                // Hand the remaining queue to another thread; `active`
                // stays set so concurrent submitters only enqueue.
                let combiner = Arc::clone(self);
                self.engine.spawn(Box::new(move || combiner.drain()));
                return;
            }
        }
    }
}
