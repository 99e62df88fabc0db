//! Timer backend
//!
//! One backend, two clock sources. `Wall` derives logical time from
//! `Instant` (scaled by the playback rate) and is what the realtime engine
//! runs on; `Manual` is a clock the driver moves by hand, used for offline
//! stepping and deterministic tests. The queue and completion protocol are
//! identical in both modes, so timelines behave the same either way.

use crate::backend::{Backend, WaitRequest};
use crate::pq::MinPq;
use std::cell::{Cell, RefCell};
use std::time::Instant;

/// Wall-mode firings later than this past their deadline get a debug log.
const JITTER_WARN_SEC: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    Wall,
    Manual,
}

pub struct TimerBackend {
    mode: ClockMode,
    next_id: Cell<u64>,
    /// Playback rate: logical seconds per wall second. Wall mode only.
    rate: Cell<f64>,
    wall_anchor: Cell<Instant>,
    logical_anchor: Cell<f64>,
    manual_now: Cell<f64>,
    pending: RefCell<MinPq<WaitRequest>>,
    scheduled_total: Cell<u64>,
}

impl TimerBackend {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            next_id: Cell::new(1),
            rate: Cell::new(1.0),
            wall_anchor: Cell::new(Instant::now()),
            logical_anchor: Cell::new(0.0),
            manual_now: Cell::new(0.0),
            pending: RefCell::new(MinPq::new()),
            scheduled_total: Cell::new(0),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn rate(&self) -> f64 {
        self.rate.get()
    }

    /// Change the playback rate. Re-anchors the clock so logical time stays
    /// continuous across the change. Ignored with a warning for invalid
    /// rates and in manual mode.
    pub fn set_rate(&self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            log::warn!("set_rate({rate}) ignored; rate must be finite and positive");
            return;
        }
        if self.mode == ClockMode::Manual {
            log::warn!("set_rate ignored in manual clock mode");
            return;
        }
        self.logical_anchor.set(self.now());
        self.wall_anchor.set(Instant::now());
        self.rate.set(rate);
    }

    /// Move the manual clock forward. Never moves it backward.
    pub fn set_manual_now(&self, t: f64) {
        if !t.is_finite() {
            return;
        }
        self.manual_now.set(self.manual_now.get().max(t));
    }

    /// Deadline of the earliest pending wait, if any.
    pub fn next_due(&self) -> Option<f64> {
        self.pending.borrow_mut().peek_due()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Total waits ever scheduled. Useful for asserting that zero-duration
    /// waits never reach the backend.
    pub fn scheduled_total(&self) -> u64 {
        self.scheduled_total.get()
    }

    /// Complete every wait sharing the earliest deadline, in registration
    /// order. Returns the number completed.
    pub fn fire_slice(&self) -> usize {
        let batch = {
            let mut pending = self.pending.borrow_mut();
            let due = match pending.peek_due() {
                Some(d) => d,
                None => return 0,
            };
            let mut batch = Vec::new();
            while let Some(d) = pending.peek_due() {
                if d.to_bits() != due.to_bits() {
                    break;
                }
                if let Some((_, _, _, req)) = pending.pop() {
                    batch.push((due, req));
                }
            }
            batch
        };
        let n = batch.len();
        for (due, req) in batch {
            if self.mode == ClockMode::Wall {
                let late = self.now() - due;
                if late > JITTER_WARN_SEC {
                    log::debug!("wait {} fired {:.1} ms late", req.id, late * 1000.0);
                }
            }
            req.state.complete_ok();
        }
        n
    }
}

impl Backend for TimerBackend {
    fn now(&self) -> f64 {
        match self.mode {
            ClockMode::Manual => self.manual_now.get(),
            ClockMode::Wall => {
                let elapsed = self.wall_anchor.get().elapsed().as_secs_f64();
                self.logical_anchor.get() + elapsed * self.rate.get()
            }
        }
    }

    fn alloc_wait_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn schedule(&self, req: WaitRequest) {
        let id = req.id;
        let due = req.target.max(0.0);
        // Wait id doubles as the tie-break sequence; ids are allocated in
        // registration order.
        self.pending.borrow_mut().add(id, due, id, req);
        self.scheduled_total.set(self.scheduled_total.get() + 1);
    }

    fn cancel_wait(&self, id: u64) {
        let removed = self.pending.borrow_mut().remove(id);
        if let Some(req) = removed {
            req.state.complete_canceled();
        }
    }
}
