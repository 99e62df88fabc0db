//! Sequencer backend
//!
//! Hands every wait to an external beat sequencer over a JSON wire and
//! resolves it when the matching reply comes back. The backend is
//! beat-clocked: `wait(beats)` passes beats straight through with no bpm
//! conversion, and logical time counts beats. Cancellation is local only,
//! the remote request is never retracted; a reply for a wait we no longer
//! track is dropped on the floor.

use crate::arena::ContextArena;
use crate::backend::{Backend, WaitRequest};
use crate::context::Ctx;
use crate::engine::EngineConfig;
use crate::executor::Executor;
use crate::handle::{spawn_root, LaunchHandle};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

/// Outbound transport to the sequencer. The payload is a single JSON
/// object per call.
pub trait SequencerLink {
    fn send(&self, payload: &str);
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleDelayMsg<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    delay_id: u64,
    time: f64,
    root_id: u64,
}

#[derive(Deserialize)]
struct DelayReply {
    id: u64,
}

pub struct SequencerBackend {
    link: Rc<dyn SequencerLink>,
    next_id: Cell<u64>,
    /// Highest beat position any reply has confirmed so far.
    now_beats: Cell<f64>,
    pending: RefCell<HashMap<u64, WaitRequest>>,
}

impl SequencerBackend {
    pub fn new(link: Rc<dyn SequencerLink>) -> Self {
        Self {
            link,
            next_id: Cell::new(1),
            now_beats: Cell::new(0.0),
            pending: RefCell::new(HashMap::new()),
        }
    }

    /// Feed one reply payload from the sequencer. Completes the matching
    /// wait; unknown ids (canceled waits, duplicates) are dropped quietly.
    pub fn deliver_reply(&self, payload: &str) {
        let reply: DelayReply = match serde_json::from_str(payload) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("malformed sequencer reply {payload:?}: {e}");
                return;
            }
        };
        let req = self.pending.borrow_mut().remove(&reply.id);
        match req {
            Some(req) => {
                self.now_beats.set(self.now_beats.get().max(req.target));
                req.state.complete_ok();
            }
            None => {
                log::debug!("dropping reply for unknown delay id {}", reply.id);
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }
}

impl Backend for SequencerBackend {
    fn now(&self) -> f64 {
        self.now_beats.get()
    }

    fn alloc_wait_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn schedule(&self, req: WaitRequest) {
        let msg = ScheduleDelayMsg {
            kind: "scheduleDelay",
            delay_id: req.id,
            time: req.target,
            root_id: req.root,
        };
        let payload = match serde_json::to_string(&msg) {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to encode delay request {}: {e}", req.id);
                req.state.complete_canceled();
                return;
            }
        };
        // Register before sending so a link that replies synchronously
        // still finds the entry.
        self.pending.borrow_mut().insert(req.id, req);
        self.link.send(&payload);
    }

    fn cancel_wait(&self, id: u64) {
        // Local bookkeeping only; the remote delay fires anyway and its
        // reply will land in the unknown-id path.
        if let Some(req) = self.pending.borrow_mut().remove(&id) {
            req.state.complete_canceled();
        }
    }

    fn beat_clocked(&self) -> bool {
        true
    }
}

/// Engine front-end for sequencer-driven hosts: launch timelines, then feed
/// replies in as they arrive.
pub struct SequencerEngine {
    arena: Rc<RefCell<ContextArena>>,
    executor: Rc<Executor>,
    backend: Rc<SequencerBackend>,
    bpm: f64,
}

impl SequencerEngine {
    pub fn new(link: Rc<dyn SequencerLink>, config: EngineConfig) -> Self {
        Self {
            arena: Rc::new(RefCell::new(ContextArena::new())),
            executor: Rc::new(Executor::new()),
            backend: Rc::new(SequencerBackend::new(link)),
            bpm: config.bpm,
        }
    }

    pub fn launch<T, F, Fut>(&self, f: F) -> LaunchHandle<T>
    where
        T: 'static,
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = T> + 'static,
    {
        let backend: Rc<dyn Backend> = self.backend.clone();
        let handle = spawn_root(&self.arena, &backend, &self.executor, self.bpm, None, f);
        // Run to the first suspension so the initial delay request goes out
        // immediately.
        self.executor.run_until_stalled();
        handle
    }

    pub fn launch_named<T, F, Fut>(&self, name: &str, f: F) -> LaunchHandle<T>
    where
        T: 'static,
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = T> + 'static,
    {
        let backend: Rc<dyn Backend> = self.backend.clone();
        let handle = spawn_root(
            &self.arena,
            &backend,
            &self.executor,
            self.bpm,
            Some(name.to_string()),
            f,
        );
        self.executor.run_until_stalled();
        handle
    }

    /// Feed one reply from the sequencer and run timelines until they
    /// suspend again.
    pub fn deliver_reply(&self, payload: &str) {
        self.backend.deliver_reply(payload);
        self.executor.run_until_stalled();
    }

    /// Run timelines until they suspend, without delivering anything.
    pub fn pump(&self) {
        self.executor.run_until_stalled();
    }

    /// Current beat position, per the latest confirmed reply.
    pub fn now(&self) -> f64 {
        self.backend.now()
    }

    pub fn live_contexts(&self) -> usize {
        self.arena.borrow().len()
    }

    pub fn pending_len(&self) -> usize {
        self.backend.pending_len()
    }
}
