//! Launch and branch handles
//!
//! Decouple "a timeline is running" from "someone is watching it". A launch
//! returns a full awaitable handle; `branch` returns a deliberately
//! lightweight cancel/on-settled handle (awaiting a fire-and-forget branch
//! would desynchronize logical time from the backend clock, so the type makes
//! it impossible); `branch_wait` returns the awaitable variant that advances
//! the parent's time on settlement.

use crate::arena::ContextArena;
use crate::backend::Backend;
use crate::context::{Ctx, WaitError};
use crate::executor::Executor;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use thiserror::Error;

/// How a launched timeline failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("timeline canceled")]
    Canceled,
    #[error("timeline panicked: {0}")]
    Panicked(String),
}

/// Settlement record shared between a branch task and its handle.
pub(crate) struct Settle {
    done: bool,
    final_time: f64,
    waker: Option<Waker>,
    callbacks: Vec<Box<dyn FnOnce()>>,
}

pub(crate) type SettleRef = Rc<RefCell<Settle>>;

impl Settle {
    pub(crate) fn new_ref() -> SettleRef {
        Rc::new(RefCell::new(Settle {
            done: false,
            final_time: 0.0,
            waker: None,
            callbacks: Vec::new(),
        }))
    }
}

/// Mark a settle record done and notify waker and callbacks exactly once.
pub(crate) fn complete_settle(settle: &SettleRef, final_time: f64) {
    let (waker, callbacks) = {
        let mut s = settle.borrow_mut();
        if s.done {
            return;
        }
        s.done = true;
        s.final_time = final_time;
        (s.waker.take(), std::mem::take(&mut s.callbacks))
    };
    if let Some(w) = waker {
        w.wake();
    }
    for cb in callbacks {
        cb();
    }
}

/// Handle for a fire-and-forget branch: cancelable and observable, but not
/// awaitable. Completion does not touch the parent's time.
pub struct BranchHandle {
    pub(crate) ctx: Ctx,
    pub(crate) settle: SettleRef,
}

impl BranchHandle {
    /// Cancel the branch and its whole subtree. Idempotent.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn is_settled(&self) -> bool {
        self.settle.borrow().done
    }

    /// Run `cb` once the branch settles (completed, panicked, or canceled).
    /// Fires immediately if it already has; fires exactly once.
    pub fn on_settled(&self, cb: impl FnOnce() + 'static) {
        let mut s = self.settle.borrow_mut();
        if s.done {
            drop(s);
            cb();
        } else {
            s.callbacks.push(Box::new(cb));
        }
    }
}

/// Awaitable handle for `branch_wait`. On a successful await the parent's
/// logical time advances to `max(parent.time, child.time)`.
pub struct BranchWaitHandle {
    pub(crate) parent: Ctx,
    pub(crate) child: Ctx,
    pub(crate) settle: SettleRef,
}

impl BranchWaitHandle {
    pub fn cancel(&self) {
        self.child.cancel();
    }
}

impl Future for BranchWaitHandle {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.child.is_canceled() {
            return Poll::Ready(Err(WaitError::Canceled));
        }
        let mut s = this.settle.borrow_mut();
        if s.done {
            let final_time = s.final_time;
            drop(s);
            this.parent.advance_time_to(final_time);
            Poll::Ready(Ok(()))
        } else {
            s.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct LaunchShared<T> {
    done: bool,
    result: Option<Result<T, LaunchError>>,
    waker: Option<Waker>,
    callbacks: Vec<Box<dyn FnOnce()>>,
}

/// Awaitable handle for a launched root timeline.
pub struct LaunchHandle<T> {
    ctx: Ctx,
    shared: Rc<RefCell<LaunchShared<T>>>,
}

impl<T> LaunchHandle<T> {
    /// Cancel the root context and its whole tree. Idempotent.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn is_settled(&self) -> bool {
        self.shared.borrow().done
    }

    /// Take the settled result without awaiting. `None` while running or if
    /// the result was already taken.
    pub fn take_result(&self) -> Option<Result<T, LaunchError>> {
        let mut s = self.shared.borrow_mut();
        if s.done {
            s.result.take()
        } else {
            None
        }
    }

    /// Run `cb` once the timeline settles; exactly once, immediately if it
    /// already has.
    pub fn on_settled(&self, cb: impl FnOnce() + 'static) {
        let mut s = self.shared.borrow_mut();
        if s.done {
            drop(s);
            cb();
        } else {
            s.callbacks.push(Box::new(cb));
        }
    }
}

impl<T> Future for LaunchHandle<T> {
    type Output = Result<T, LaunchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut s = this.shared.borrow_mut();
        if s.done {
            let res = s.result.take().expect("LaunchHandle polled after completion");
            return Poll::Ready(res);
        }
        if this.ctx.is_canceled() {
            return Poll::Ready(Err(LaunchError::Canceled));
        }
        s.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Create a root context for `f`, spawn it behind the panic boundary, and
/// hand back the launch handle. Shared by all engine front-ends.
pub(crate) fn spawn_root<T, F, Fut>(
    arena: &Rc<RefCell<ContextArena>>,
    backend: &Rc<dyn Backend>,
    executor: &Rc<Executor>,
    bpm: f64,
    debug_name: Option<String>,
    f: F,
) -> LaunchHandle<T>
where
    T: 'static,
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = T> + 'static,
{
    let (id, cancel) = arena.borrow_mut().alloc_root(bpm, debug_name);
    let ctx = Ctx::from_parts(arena.clone(), backend.clone(), executor.clone(), id, cancel);
    let shared = Rc::new(RefCell::new(LaunchShared {
        done: false,
        result: None,
        waker: None,
        callbacks: Vec::new(),
    }));

    let fut = f(ctx.clone());
    let task_ctx = ctx.clone();
    let task_shared = shared.clone();
    let task_arena = arena.clone();
    executor.spawn(async move {
        let outcome = CatchPanic::new(fut).await;
        let res = match outcome {
            Ok(value) => {
                if task_ctx.is_canceled() {
                    Err(LaunchError::Canceled)
                } else {
                    Ok(value)
                }
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log::error!("timeline '{}' panicked: {}", task_ctx.label(), msg);
                Err(LaunchError::Panicked(msg))
            }
        };
        let (waker, callbacks) = {
            let mut s = task_shared.borrow_mut();
            s.done = true;
            s.result = Some(res);
            (s.waker.take(), std::mem::take(&mut s.callbacks))
        };
        task_arena.borrow_mut().mark_settled(id);
        if let Some(w) = waker {
            w.wake();
        }
        for cb in callbacks {
            cb();
        }
    });

    LaunchHandle { ctx, shared }
}

/// Poll adapter that contains panics from a timeline future. A panicking
/// timeline must not take the executor (or sibling branches) down with it.
pub(crate) struct CatchPanic<F> {
    fut: F,
}

impl<F> CatchPanic<F> {
    pub(crate) fn new(fut: F) -> Self {
        Self { fut }
    }
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, Box<dyn std::any::Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let fut = unsafe { self.map_unchecked_mut(|s| &mut s.fut) };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fut.poll(cx))) {
            Ok(Poll::Ready(v)) => Poll::Ready(Ok(v)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
