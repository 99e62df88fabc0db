//! Wait backend capability
//!
//! Suspension is the one thing a time context cannot do by itself: `wait_sec`
//! builds an explicit request object and hands it to the tree's backend, which
//! owns some notion of a clock (a wall timer, an external sequencer process,
//! or a render-frame tick). The backend resumes the suspended task by
//! completing the request's shared `WaitState`, which wakes the stored waker.
//! Only the requesting future ever advances context time, and only after a
//! successful completion.

use crate::arena::CtxId;
use std::cell::RefCell;
use std::rc::Rc;
use std::task::Waker;

/// Completion state shared between a wait future and the backend driving it.
#[derive(Clone)]
pub struct WaitState {
    inner: Rc<RefCell<WaitStateInner>>,
}

struct WaitStateInner {
    done: bool,
    canceled: bool,
    waker: Option<Waker>,
}

impl WaitState {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(WaitStateInner {
                done: false,
                canceled: false,
                waker: None,
            })),
        }
    }

    pub fn set_waker(&self, w: &Waker) {
        self.inner.borrow_mut().waker = Some(w.clone());
    }

    /// Mark the wait resolved and wake its task. No-op once settled.
    pub fn complete_ok(&self) {
        let mut s = self.inner.borrow_mut();
        if s.done || s.canceled {
            return;
        }
        s.done = true;
        if let Some(w) = s.waker.take() {
            w.wake();
        }
    }

    /// Mark the wait canceled and wake its task. No-op once settled.
    pub fn complete_canceled(&self) {
        let mut s = self.inner.borrow_mut();
        if s.done || s.canceled {
            return;
        }
        s.canceled = true;
        if let Some(w) = s.waker.take() {
            w.wake();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.borrow().done
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.borrow().canceled
    }
}

impl Default for WaitState {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending suspension, queued with a backend until its target time.
pub struct WaitRequest {
    /// Correlation id, allocated by the backend.
    pub id: u64,
    /// Target logical time (seconds, or beats on a beat-clocked backend).
    pub target: f64,
    /// Root context of the requesting tree (external backends carry this on
    /// the wire).
    pub root: CtxId,
    pub state: WaitState,
}

/// The single capability a time context needs from its clock source.
pub trait Backend {
    /// Current logical time of this backend's clock.
    fn now(&self) -> f64;

    /// Allocate a wait id. Ids double as registration sequence numbers, so
    /// same-deadline waits resolve in allocation order.
    fn alloc_wait_id(&self) -> u64;

    /// Queue a timed wait until `req.target`.
    fn schedule(&self, req: WaitRequest);

    /// Queue a wait for the next frame tick. Backends without a frame clock
    /// resolve it immediately.
    fn schedule_frame(&self, req: WaitRequest) {
        log::warn!("backend has no frame clock; wait_frame resolves immediately");
        req.state.complete_ok();
    }

    /// Drop a pending wait and settle it as canceled. Unknown ids are
    /// ignored (the wait may already have resolved).
    fn cancel_wait(&self, id: u64);

    /// True when this backend's clock counts beats rather than seconds, in
    /// which case `wait(beats)` passes beat counts through unconverted.
    fn beat_clocked(&self) -> bool {
        false
    }
}
