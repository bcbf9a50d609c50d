//! Per-thread home task queues
//!
//! Every thread that owns connections or exported objects has one
//! [`LoopHandle`]. Other threads reach it only through [`LoopHandle::post`]
//! (and one-shot timers); the owning thread drains it by pumping:
//!
//! ```text
//!   any thread ── post(task) ──▶ [ tasks ][ timers ] ──▶ owning thread
//!                                                        process_events()
//!                                                        run_until(pred, deadline)
//! ```
//!
//! Tasks run in posting order, one at a time, so a nested pump started
//! from inside a task continues with the next queued task rather than
//! skipping ahead. When the owning thread exits, the queue shuts down and
//! queued tasks are dropped without running.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

/// A unit of work posted to a home queue
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

enum Event {
    Run(Task),
    /// Re-check the pump predicate and the timer deadlines
    Wake,
}

#[derive(Default)]
struct Timers {
    /// Min-heap of (deadline, timer id); cancelled ids linger until popped
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
}

impl Timers {
    fn pop_due(&mut self, now: Instant) -> Option<Task> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(task) = self.tasks.remove(&id) {
                return Some(task);
            }
        }
        None
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines
            .iter()
            .filter(|Reverse((_, id))| self.tasks.contains_key(id))
            .map(|Reverse((at, _))| *at)
            .min()
    }
}

struct LoopShared {
    id: u64,
    thread: ThreadId,
    /// Taken when the queue shuts down
    sender: RwLock<Option<Sender<Event>>>,
    receiver: Receiver<Event>,
    timers: Mutex<Timers>,
    next_timer: AtomicU64,
}

/// Handle to one thread's task queue
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

/// Owns the thread's queue; shuts it down when the thread exits
struct LoopOwner(LoopHandle);

impl Drop for LoopOwner {
    fn drop(&mut self) {
        self.0.shut_down();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<LoopOwner>> = const { RefCell::new(None) };
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

impl LoopHandle {
    fn create(alive: bool) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(LoopShared {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                thread: thread::current().id(),
                sender: RwLock::new(alive.then_some(sender)),
                receiver,
                timers: Mutex::new(Timers::default()),
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    /// The calling thread's queue, created on first use
    pub fn current() -> LoopHandle {
        CURRENT
            .try_with(|slot| {
                slot.borrow_mut()
                    .get_or_insert_with(|| LoopOwner(LoopHandle::create(true)))
                    .0
                    .clone()
            })
            // thread is exiting: hand out a queue that accepts nothing
            .unwrap_or_else(|_| LoopHandle::create(false))
    }

    /// The calling thread's queue, if one was ever created
    pub fn existing() -> Option<LoopHandle> {
        CURRENT
            .try_with(|slot| slot.borrow().as_ref().map(|owner| owner.0.clone()))
            .ok()
            .flatten()
    }

    /// Unique id of this queue
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Thread owning this queue
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// False once the owning thread has exited
    pub fn is_alive(&self) -> bool {
        self.shared.sender.read().is_some()
    }

    /// Queue a task. Returns false, dropping the task, if the queue is
    /// shut down.
    pub fn post(&self, task: Task) -> bool {
        let sender = self.shared.sender.read();
        if let Some(sender) = sender.as_ref() {
            // the receiver lives as long as `shared`
            return sender.send(Event::Run(task)).is_ok();
        }
        drop(sender);
        trace!("queue {} is shut down, dropping task", self.shared.id);
        drop(task);
        false
    }

    /// Run `task` once after `delay`
    pub fn post_delayed(&self, delay: Duration, task: Task) -> Option<TimerId> {
        let sender = self.shared.sender.read();
        let Some(wake) = sender.as_ref() else {
            drop(sender);
            drop(task);
            return None;
        };
        let id = self.shared.next_timer.fetch_add(1, Ordering::Relaxed);
        {
            let mut timers = self.shared.timers.lock();
            timers.deadlines.push(Reverse((Instant::now() + delay, id)));
            timers.tasks.insert(id, task);
        }
        // a waiting pump recomputes its deadline
        let _ = wake.send(Event::Wake);
        Some(TimerId(id))
    }

    /// Cancel a timer that has not fired yet. Callable from any thread.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let task = self.shared.timers.lock().tasks.remove(&id.0);
        task.is_some()
    }

    /// Interrupt a waiting [`run_until`](Self::run_until) so it re-checks
    /// its predicate
    pub fn wake(&self) {
        if let Some(sender) = self.shared.sender.read().as_ref() {
            let _ = sender.send(Event::Wake);
        }
    }

    /// Next task to run: a due timer first, then the oldest queued task
    fn next_task(&self) -> Option<Task> {
        let due = self.shared.timers.lock().pop_due(Instant::now());
        if due.is_some() {
            return due;
        }
        self.shared.receiver.try_iter().find_map(|event| match event {
            Event::Run(task) => Some(task),
            Event::Wake => None,
        })
    }

    /// Run everything queued or due right now. Returns the number of tasks
    /// run. Must be called on the owning thread.
    pub fn process_events(&self) -> usize {
        if !self.is_current() {
            warn!("queue {} pumped from a foreign thread", self.shared.id);
            return 0;
        }
        let budget = self.shared.receiver.len() + self.shared.timers.lock().tasks.len();
        let mut ran = 0;
        while ran < budget {
            let Some(task) = self.next_task() else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Pump until `done` returns true or `deadline` passes. Returns the
    /// final value of `done`. Must be called on the owning thread.
    pub fn run_until<F>(&self, mut done: F, deadline: Option<Instant>) -> bool
    where
        F: FnMut() -> bool,
    {
        if !self.is_current() {
            warn!("queue {} pumped from a foreign thread", self.shared.id);
            return done();
        }
        loop {
            if done() {
                return true;
            }
            if self.process_events() > 0 {
                continue;
            }
            if done() {
                return true;
            }

            let now = Instant::now();
            if deadline.map_or(false, |d| now >= d) {
                return done();
            }
            let next_timer = self.shared.timers.lock().next_deadline();
            let wake_at = match (next_timer, deadline) {
                (Some(t), Some(d)) => Some(t.min(d)),
                (t, d) => t.or(d),
            };
            let event = match wake_at {
                Some(at) if at <= now => continue,
                Some(at) => match self.shared.receiver.recv_deadline(at) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return done(),
                },
                None => match self.shared.receiver.recv() {
                    Ok(event) => event,
                    Err(_) => return done(),
                },
            };
            if let Event::Run(task) = event {
                task();
            }
        }
    }

    /// Pump for a fixed duration
    pub fn run_for(&self, duration: Duration) {
        self.run_until(|| false, Some(Instant::now() + duration));
    }

    fn shut_down(&self) {
        // no post can slip in once the sender is gone
        let sender = self.shared.sender.write().take();
        drop(sender);
        let tasks: Vec<Task> = self
            .shared
            .receiver
            .try_iter()
            .filter_map(|event| match event {
                Event::Run(task) => Some(task),
                Event::Wake => None,
            })
            .collect();
        let timers = std::mem::take(&mut *self.shared.timers.lock());
        if !tasks.is_empty() {
            trace!(
                "queue {} shut down with {} pending tasks",
                self.shared.id,
                tasks.len()
            );
        }
        // dropping runs the tasks' cleanup, outside the lock
        drop(tasks);
        drop(timers);
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.shared.id)
            .field("thread", &self.shared.thread)
            .finish()
    }
}
