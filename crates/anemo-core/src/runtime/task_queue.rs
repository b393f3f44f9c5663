//! FIFO run-to-completion task queue.
//!
//! Tasks are boxed futures. A task runs only when its id is popped from the
//! ready list. Wakers push the id back onto the tail, so every resumption
//! (bus completion, timer firing, lock hand-off, pin edge) goes through the
//! queue as a fresh entry and never runs inline inside the code that woke it.
//!
//! The ready list sits behind an `embassy-sync` critical-section mutex
//! because wakers are `Send + Sync` and may be cloned into interrupt
//! context. The task table itself is only touched from the scheduler.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::sync::Arc;
use alloc::task::Wake;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Waker};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u32);

type BoxedTask<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

struct ReadyList {
    queue: Mutex<CriticalSectionRawMutex, RefCell<VecDeque<TaskId>>>,
}

impl ReadyList {
    fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Append `id` unless it is already waiting to run.
    fn push(&self, id: TaskId) {
        self.queue.lock(|queue| {
            let mut queue = queue.borrow_mut();
            if !queue.contains(&id) {
                queue.push_back(id);
            }
        });
    }

    fn pop(&self) -> Option<TaskId> {
        self.queue.lock(|queue| queue.borrow_mut().pop_front())
    }

    fn len(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().len())
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyList>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

struct Inner<'a> {
    tasks: RefCell<BTreeMap<TaskId, BoxedTask<'a>>>,
    ready: Arc<ReadyList>,
    next_id: Cell<u32>,
}

/// Handle to the scheduler's queue. Clones share the same queue.
///
/// The lifetime lets tasks borrow the [`Runtime`](super::Runtime) and the
/// drivers they use instead of requiring `'static` state.
#[derive(Clone)]
pub struct TaskQueue<'a> {
    inner: Rc<Inner<'a>>,
}

impl<'a> TaskQueue<'a> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                tasks: RefCell::new(BTreeMap::new()),
                ready: Arc::new(ReadyList::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// Register `future` as a task and enqueue its first poll.
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'a,
    {
        let id = self.allocate_id();
        self.inner.tasks.borrow_mut().insert(id, Box::pin(future));
        self.inner.ready.push(id);
        trace!("spawned task {:?}", id);
        id
    }

    /// Append a plain continuation. It runs once, in FIFO order with every
    /// other queue entry.
    pub fn enqueue<F>(&self, continuation: F) -> TaskId
    where
        F: FnOnce() + 'a,
    {
        self.spawn(async move { continuation() })
    }

    /// Pop the head entry and poll it. Returns `false` if the queue was empty.
    pub fn run_once(&self) -> bool {
        let Some(id) = self.inner.ready.pop() else {
            return false;
        };

        // A wake for a task that already finished
        let Some(mut task) = self.inner.tasks.borrow_mut().remove(&id) else {
            return true;
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            ready: self.inner.ready.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        if task.as_mut().poll(&mut cx).is_pending() {
            self.inner.tasks.borrow_mut().insert(id, task);
        } else {
            trace!("task {:?} finished", id);
        }
        true
    }

    /// Drain the queue to empty, including entries appended while draining.
    /// Returns the number of entries run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// No entry is waiting to run.
    pub fn is_idle(&self) -> bool {
        self.inner.ready.len() == 0
    }

    /// Number of tasks that have not finished.
    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    pub fn is_finished(&self, id: TaskId) -> bool {
        !self.inner.tasks.borrow().contains_key(&id)
    }

    fn allocate_id(&self) -> TaskId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id.wrapping_add(1));
        TaskId(id)
    }
}

impl Default for TaskQueue<'_> {
    fn default() -> Self {
        Self::new()
    }
}
