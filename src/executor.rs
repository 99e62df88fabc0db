//! Single-threaded deterministic executor
//!
//! Timelines are plain futures polled by a tiny FIFO executor: tasks run in
//! spawn order, and woken tasks rejoin the back of the queue in wake order.
//! The whole engine is cooperative and single-threaded, so the waker is a
//! RawWaker vtable over `Rc` rather than the usual `Arc` machinery.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

struct TaskCell {
    fut: RefCell<Pin<Box<dyn Future<Output = ()>>>>,
    /// True while the task sits in the ready queue, so a burst of wakes
    /// enqueues it once.
    queued: Cell<bool>,
    finished: Cell<bool>,
    queue: Weak<RefCell<ReadyQueue>>,
}

type ReadyQueue = VecDeque<Rc<TaskCell>>;

/// FIFO executor for the engine's cooperative tasks.
pub struct Executor {
    queue: Rc<RefCell<ReadyQueue>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        let task = Rc::new(TaskCell {
            fut: RefCell::new(Box::pin(fut)),
            queued: Cell::new(true),
            finished: Cell::new(false),
            queue: Rc::downgrade(&self.queue),
        });
        self.queue.borrow_mut().push_back(task);
    }

    /// Poll ready tasks until none remain ready. Returns the poll count.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        loop {
            let task = match self.queue.borrow_mut().pop_front() {
                Some(t) => t,
                None => break,
            };
            task.queued.set(false);
            // A stale waker may have re-queued a finished task.
            if task.finished.get() {
                continue;
            }

            polls += 1;
            let waker = raw_waker_for(&task);
            let mut cx = Context::from_waker(&waker);
            if let Poll::Ready(()) = task.fut.borrow_mut().as_mut().poll(&mut cx) {
                task.finished.set(true);
            };
        }
        polls
    }

    pub fn has_ready_tasks(&self) -> bool {
        !self.queue.borrow().is_empty()
    }
}

fn enqueue(task: &Rc<TaskCell>) {
    if task.finished.get() || task.queued.replace(true) {
        return;
    }
    if let Some(queue) = task.queue.upgrade() {
        queue.borrow_mut().push_back(task.clone());
    }
}

fn raw_waker_for(task: &Rc<TaskCell>) -> Waker {
    unsafe fn clone_fn(data: *const ()) -> RawWaker {
        let task = Rc::<TaskCell>::from_raw(data as *const TaskCell);
        let cloned = task.clone();
        std::mem::forget(task);
        RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
    }

    unsafe fn wake_fn(data: *const ()) {
        let task = Rc::<TaskCell>::from_raw(data as *const TaskCell);
        enqueue(&task);
    }

    unsafe fn wake_by_ref_fn(data: *const ()) {
        let task = Rc::<TaskCell>::from_raw(data as *const TaskCell);
        enqueue(&task);
        std::mem::forget(task);
    }

    unsafe fn drop_fn(data: *const ()) {
        drop(Rc::<TaskCell>::from_raw(data as *const TaskCell));
    }

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

    let raw = RawWaker::new(Rc::into_raw(task.clone()) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}
