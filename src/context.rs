//! Time context
//!
//! The user-facing handle for one node of a timeline tree: wait primitives,
//! branching, cancellation, and the logical-time getters. A context's own
//! execution has exactly one suspension point, the wait futures defined here;
//! everything between waits runs to completion without interleaving.
//!
//! The central correctness property lives in `wait_sec`: a wait's target time
//! is based on `max(root.most_recent_desc_time, self.time)`, so even when a
//! sibling's timer fires early in wall-clock terms, no branch ever observes
//! the tree's logical time moving backward.

use crate::arena::{ContextArena, CtxId};
use crate::backend::{Backend, WaitRequest, WaitState};
use crate::executor::Executor;
use crate::handle::{
    complete_settle, panic_message, BranchHandle, BranchWaitHandle, CatchPanic, Settle, SettleRef,
};
use crate::signal::CancelToken;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use thiserror::Error;

/// Error returned from a suspended wait. Cancellation is expected control
/// flow, not a bug: treat it as the signal to unwind the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("context canceled")]
    Canceled,
}

/// A handle to one time context. Cloning is cheap and clones refer to the
/// same node.
#[derive(Clone)]
pub struct Ctx {
    pub(crate) arena: Rc<RefCell<ContextArena>>,
    pub(crate) backend: Rc<dyn Backend>,
    pub(crate) executor: Rc<Executor>,
    pub(crate) id: CtxId,
    pub(crate) cancel: CancelToken,
}

impl Ctx {
    pub(crate) fn from_parts(
        arena: Rc<RefCell<ContextArena>>,
        backend: Rc<dyn Backend>,
        executor: Rc<Executor>,
        id: CtxId,
        cancel: CancelToken,
    ) -> Self {
        Self {
            arena,
            backend,
            executor,
            id,
            cancel,
        }
    }

    pub fn id(&self) -> CtxId {
        self.id
    }

    /// Current logical time (seconds, or beats on a beat-clocked backend).
    pub fn time(&self) -> f64 {
        self.arena
            .borrow()
            .get(self.id)
            .map(|s| s.time)
            .unwrap_or(0.0)
    }

    /// Logical time at which this context was created.
    pub fn start_time(&self) -> f64 {
        self.arena
            .borrow()
            .get(self.id)
            .map(|s| s.start_time)
            .unwrap_or(0.0)
    }

    /// Time elapsed since this context started.
    pub fn prog_time(&self) -> f64 {
        let arena = self.arena.borrow();
        arena
            .get(self.id)
            .map(|s| s.time - s.start_time)
            .unwrap_or(0.0)
    }

    pub fn bpm(&self) -> f64 {
        self.arena
            .borrow()
            .get(self.id)
            .map(|s| s.bpm)
            .unwrap_or(60.0)
    }

    /// Change this context's tempo. Children created afterwards inherit the
    /// new value; existing children keep their own.
    pub fn set_bpm(&self, bpm: f64) {
        if !bpm.is_finite() || bpm <= 0.0 {
            log::warn!("set_bpm({bpm}) ignored; bpm must be finite and positive");
            return;
        }
        if let Some(slot) = self.arena.borrow_mut().get_mut(self.id) {
            slot.bpm = bpm;
        }
    }

    /// Current beat position. On a beat-clocked backend `time` already counts
    /// beats.
    pub fn beats(&self) -> f64 {
        if self.backend.beat_clocked() {
            self.time()
        } else {
            self.time() * self.bpm() / 60.0
        }
    }

    /// Beats elapsed since this context started.
    pub fn prog_beats(&self) -> f64 {
        if self.backend.beat_clocked() {
            self.prog_time()
        } else {
            self.prog_time() * self.bpm() / 60.0
        }
    }

    /// Furthest logical time any context in this tree has reached.
    pub fn most_recent_desc_time(&self) -> f64 {
        self.arena.borrow().most_recent_desc_time(self.id)
    }

    /// `most_recent_desc_time` in beats, using the root's tempo.
    pub fn most_recent_desc_beats(&self) -> f64 {
        if self.backend.beat_clocked() {
            return self.most_recent_desc_time();
        }
        let arena = self.arena.borrow();
        let t = arena.most_recent_desc_time(self.id);
        let root_bpm = arena
            .get(self.id)
            .and_then(|s| arena.get(s.root))
            .map(|r| r.bpm)
            .unwrap_or(60.0);
        t * root_bpm / 60.0
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_fired()
    }

    pub fn debug_name(&self) -> Option<String> {
        self.arena
            .borrow()
            .get(self.id)
            .and_then(|s| s.debug_name.clone())
    }

    pub(crate) fn label(&self) -> String {
        self.debug_name()
            .unwrap_or_else(|| format!("ctx{}", self.id))
    }

    /// Cancel this context and, transitively, every descendant. Never touches
    /// the parent. Suspended waits in the subtree settle as canceled and
    /// never resolve. Idempotent.
    pub fn cancel(&self) {
        let targets = self.arena.borrow().collect_subtree(self.id);
        if targets.is_empty() {
            // Slot already released; the token still matters to handles.
            self.cancel.fire();
            return;
        }
        for tid in targets {
            let pending = {
                let mut arena = self.arena.borrow_mut();
                match arena.get_mut(tid) {
                    Some(slot) => {
                        if !slot.cancel.fire() {
                            continue;
                        }
                        std::mem::take(&mut slot.pending_waits)
                    }
                    None => continue,
                }
            };
            for wait_id in pending {
                self.backend.cancel_wait(wait_id);
            }
        }
    }

    /// Wait for `sec` seconds of logical time (beats on a beat-clocked
    /// backend). The sole suspension primitive: every other wait reduces to
    /// this. Invalid durations are clamped to zero and logged.
    pub fn wait_sec(&self, sec: f64) -> TimeWaitFuture {
        let sec = sanitize_duration(sec, "wait_sec");
        let target = {
            let arena = self.arena.borrow();
            let own = arena.get(self.id).map(|s| s.time).unwrap_or(0.0);
            arena.most_recent_desc_time(self.id).max(own) + sec
        };
        TimeWaitFuture {
            ctx: self.clone(),
            target,
            state: WaitState::new(),
            registered: Cell::new(false),
            wait_id: Cell::new(0),
        }
    }

    /// Wait for `beats` beats at the current tempo. Zero (or negative) beats
    /// resolve immediately without touching the backend.
    pub fn wait(&self, beats: f64) -> WaitFuture {
        let beats = sanitize_duration(beats, "wait");
        if beats <= 0.0 {
            return WaitFuture::Immediate(self.clone());
        }
        let sec = if self.backend.beat_clocked() {
            beats
        } else {
            beats * 60.0 / self.bpm()
        };
        WaitFuture::Timed(self.wait_sec(sec))
    }

    /// Wait until the driver's next frame tick (per-frame backend).
    pub fn wait_frame(&self) -> FrameWaitFuture {
        FrameWaitFuture {
            ctx: self.clone(),
            state: WaitState::new(),
            registered: Cell::new(false),
            wait_id: Cell::new(0),
        }
    }

    /// Start a fire-and-forget child timeline. The child's clock starts at
    /// the furthest point any sibling has already reached
    /// (`root.most_recent_desc_time`), so a late branch can never pull
    /// logical time backward. Completion does not advance the parent's time.
    pub fn branch<F, Fut>(&self, f: F) -> BranchHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.branch_inner(None, f)
    }

    /// `branch` with a debug label for diagnostics.
    pub fn branch_named<F, Fut>(&self, name: &str, f: F) -> BranchHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.branch_inner(Some(name.to_string()), f)
    }

    fn branch_inner<F, Fut>(&self, name: Option<String>, f: F) -> BranchHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let start = self.arena.borrow().most_recent_desc_time(self.id);
        let (ctx, settle) = self.spawn_child(start, name, f);
        BranchHandle { ctx, settle }
    }

    /// Start a child timeline meant to be awaited. The child's clock starts
    /// at this context's current instant, and the successful await advances
    /// this context's time to `max(self.time, child.time)`.
    pub fn branch_wait<F, Fut>(&self, f: F) -> BranchWaitHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.branch_wait_inner(None, f)
    }

    /// `branch_wait` with a debug label for diagnostics.
    pub fn branch_wait_named<F, Fut>(&self, name: &str, f: F) -> BranchWaitHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.branch_wait_inner(Some(name.to_string()), f)
    }

    fn branch_wait_inner<F, Fut>(&self, name: Option<String>, f: F) -> BranchWaitHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let start = self.time();
        let (child, settle) = self.spawn_child(start, name, f);
        BranchWaitHandle {
            parent: self.clone(),
            child,
            settle,
        }
    }

    /// Allocate the child slot, spawn its task behind the panic boundary,
    /// and wire up settlement (final-time capture, arena release).
    ///
    /// Panics if called on a context whose slot has already been released.
    fn spawn_child<F, Fut>(&self, start_time: f64, name: Option<String>, f: F) -> (Ctx, SettleRef)
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let (child_id, token) = self
            .arena
            .borrow_mut()
            .alloc_child(self.id, start_time, name)
            .expect("branch on a settled context");
        let child = Ctx {
            arena: self.arena.clone(),
            backend: self.backend.clone(),
            executor: self.executor.clone(),
            id: child_id,
            cancel: token,
        };
        let settle = Settle::new_ref();

        let fut = f(child.clone());
        let task_ctx = child.clone();
        let task_settle = settle.clone();
        let task_arena = self.arena.clone();
        self.executor.spawn(async move {
            if let Err(payload) = CatchPanic::new(fut).await {
                log::error!(
                    "branch '{}' panicked: {}",
                    task_ctx.label(),
                    panic_message(payload.as_ref())
                );
            }
            // Snapshot before release: the slot may be gone right after.
            let final_time = task_ctx.time();
            task_arena.borrow_mut().mark_settled(child_id);
            complete_settle(&task_settle, final_time);
        });

        (child, settle)
    }

    /// Clamp-forward time update used when an awaited branch settles.
    pub(crate) fn advance_time_to(&self, t: f64) {
        if let Some(slot) = self.arena.borrow_mut().get_mut(self.id) {
            slot.time = slot.time.max(t);
        }
    }

    /// Apply the post-wait update protocol: raise own time to the target,
    /// then raise the root's bookkeeping, both as monotonic maxes.
    fn finish_wait(&self, target: f64, wait_id: u64) {
        let mut arena = self.arena.borrow_mut();
        let new_time = match arena.get_mut(self.id) {
            Some(slot) => {
                slot.time = slot.time.max(target);
                slot.pending_waits.retain(|w| *w != wait_id);
                slot.time
            }
            None => return,
        };
        arena.raise_most_recent_desc_time(self.id, new_time);
    }

    /// Register a wait with the backend and record it for cancellation
    /// cleanup. Returns the allocated wait id.
    fn register_wait(&self, target: f64, state: &WaitState, frame: bool) -> u64 {
        let id = self.backend.alloc_wait_id();
        let root = {
            let mut arena = self.arena.borrow_mut();
            match arena.get_mut(self.id) {
                Some(slot) => {
                    slot.pending_waits.push(id);
                    slot.root
                }
                None => self.id,
            }
        };
        let req = WaitRequest {
            id,
            target: target.max(0.0),
            root,
            state: state.clone(),
        };
        if frame {
            self.backend.schedule_frame(req);
        } else {
            self.backend.schedule(req);
        }
        id
    }
}

fn sanitize_duration(value: f64, op: &str) -> f64 {
    if value.is_nan() {
        log::warn!("{op} received NaN duration; treating as zero");
        0.0
    } else if !value.is_finite() {
        log::warn!("{op} received non-finite duration; treating as zero");
        0.0
    } else if value < 0.0 {
        0.0
    } else {
        value
    }
}

/// Future for `wait` — either an immediate resolution (zero beats) or a
/// timed wait through the backend.
pub enum WaitFuture {
    Immediate(Ctx),
    Timed(TimeWaitFuture),
}

impl Future for WaitFuture {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            WaitFuture::Immediate(ctx) => {
                if ctx.is_canceled() {
                    Poll::Ready(Err(WaitError::Canceled))
                } else {
                    Poll::Ready(Ok(()))
                }
            }
            WaitFuture::Timed(f) => Pin::new(f).poll(cx),
        }
    }
}

/// Future for `wait_sec`. Registers with the backend on first poll; applies
/// the monotonic time update only on successful completion.
pub struct TimeWaitFuture {
    ctx: Ctx,
    target: f64,
    state: WaitState,
    registered: Cell<bool>,
    wait_id: Cell<u64>,
}

impl Future for TimeWaitFuture {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.state.is_canceled() {
            return Poll::Ready(Err(WaitError::Canceled));
        }
        if this.state.is_done() {
            this.ctx.finish_wait(this.target, this.wait_id.get());
            return Poll::Ready(Ok(()));
        }

        this.state.set_waker(cx.waker());
        if !this.registered.replace(true) {
            if this.ctx.is_canceled() {
                this.state.complete_canceled();
                return Poll::Ready(Err(WaitError::Canceled));
            }
            let id = this.ctx.register_wait(this.target, &this.state, false);
            this.wait_id.set(id);
        }
        Poll::Pending
    }
}

/// Future for `wait_frame`. Resolution time comes from the backend clock at
/// the tick, clamped against the tree's logical time.
pub struct FrameWaitFuture {
    ctx: Ctx,
    state: WaitState,
    registered: Cell<bool>,
    wait_id: Cell<u64>,
}

impl Future for FrameWaitFuture {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.state.is_canceled() {
            return Poll::Ready(Err(WaitError::Canceled));
        }
        if this.state.is_done() {
            let tick_time = this.ctx.backend.now();
            this.ctx.finish_wait(tick_time, this.wait_id.get());
            return Poll::Ready(Ok(()));
        }

        this.state.set_waker(cx.waker());
        if !this.registered.replace(true) {
            if this.ctx.is_canceled() {
                this.state.complete_canceled();
                return Poll::Ready(Err(WaitError::Canceled));
            }
            let id = this.ctx.register_wait(this.ctx.backend.now(), &this.state, true);
            this.wait_id.set(id);
        }
        Poll::Pending
    }
}
