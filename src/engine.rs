//! Engine drivers for the timer backend
//!
//! `Engine::realtime` runs timelines against the wall clock, sleeping with
//! a spin sleeper between timeslices. `Engine::manual` owns a hand-driven
//! clock instead: `advance_to` and `step_sec` jump from deadline to
//! deadline, which makes runs deterministic and instant regardless of how
//! much logical time they cover.

use crate::arena::ContextArena;
use crate::backend::Backend;
use crate::context::Ctx;
use crate::executor::Executor;
use crate::handle::{spawn_root, LaunchHandle};
use crate::timer::{ClockMode, TimerBackend};
use spin_sleep::SpinSleeper;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

/// Safety valve for manual-clock advancement. A run that crosses this many
/// timeslices in one `advance_to` call is assumed to be a runaway loop of
/// zero-length waits.
const MAX_TIMESLICES_PER_ADVANCE: usize = 200_000;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Tempo handed to every launched root context.
    pub bpm: f64,
    /// Playback rate in logical seconds per wall second. Realtime only.
    pub rate: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bpm: 60.0,
            rate: 1.0,
        }
    }
}

pub struct Engine {
    arena: Rc<RefCell<ContextArena>>,
    executor: Rc<Executor>,
    backend: Rc<TimerBackend>,
    sleeper: SpinSleeper,
    bpm: f64,
}

impl Engine {
    /// Engine driven by the wall clock.
    pub fn realtime(config: EngineConfig) -> Self {
        Self::with_mode(ClockMode::Wall, config)
    }

    /// Engine driven by a manual clock; time only moves when the caller
    /// advances it.
    pub fn manual(config: EngineConfig) -> Self {
        Self::with_mode(ClockMode::Manual, config)
    }

    fn with_mode(mode: ClockMode, config: EngineConfig) -> Self {
        let backend = Rc::new(TimerBackend::new(mode));
        if mode == ClockMode::Wall && (config.rate - 1.0).abs() > f64::EPSILON {
            backend.set_rate(config.rate);
        }
        Self {
            arena: Rc::new(RefCell::new(ContextArena::new())),
            executor: Rc::new(Executor::new()),
            backend,
            sleeper: SpinSleeper::default(),
            bpm: config.bpm,
        }
    }

    /// Launch a root timeline. The future starts on the next executor pass;
    /// nothing runs until the engine is driven.
    pub fn launch<T, F, Fut>(&self, f: F) -> LaunchHandle<T>
    where
        T: 'static,
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = T> + 'static,
    {
        let backend: Rc<dyn Backend> = self.backend.clone();
        spawn_root(&self.arena, &backend, &self.executor, self.bpm, None, f)
    }

    /// `launch` with a debug label for diagnostics.
    pub fn launch_named<T, F, Fut>(&self, name: &str, f: F) -> LaunchHandle<T>
    where
        T: 'static,
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = T> + 'static,
    {
        let backend: Rc<dyn Backend> = self.backend.clone();
        spawn_root(
            &self.arena,
            &backend,
            &self.executor,
            self.bpm,
            Some(name.to_string()),
            f,
        )
    }

    /// Current logical time.
    pub fn now(&self) -> f64 {
        self.backend.now()
    }

    /// Number of live context slots. Settled trees release theirs, so this
    /// returns to zero once everything finishes.
    pub fn live_contexts(&self) -> usize {
        self.arena.borrow().len()
    }

    /// Direct access to the timer backend (rate changes, queue inspection).
    pub fn timer(&self) -> &TimerBackend {
        &self.backend
    }

    /// Drive a realtime engine until no task can make further progress.
    pub fn run_until_complete(&self) {
        self.run_until(|| false)
    }

    /// Drive a realtime engine until `stop` returns true (checked once per
    /// timeslice) or no task can make further progress.
    pub fn run_until(&self, stop: impl Fn() -> bool) {
        loop {
            self.executor.run_until_stalled();
            if stop() {
                return;
            }
            let next = match self.backend.next_due() {
                Some(t) => t,
                None => {
                    if self.executor.has_ready_tasks() {
                        continue;
                    }
                    return;
                }
            };
            let now = self.backend.now();
            if next <= now {
                self.backend.fire_slice();
                continue;
            }
            let wall = ((next - now) / self.backend.rate()).max(0.0);
            self.sleeper.sleep(Duration::from_secs_f64(wall));
        }
    }

    /// Advance a manual clock to `target`, firing every timeslice on the
    /// way in deadline order. Instantaneous in wall time.
    pub fn advance_to(&self, target: f64) {
        self.executor.run_until_stalled();
        let mut slices = 0usize;
        while let Some(due) = self.backend.next_due() {
            if due > target {
                break;
            }
            slices += 1;
            if slices > MAX_TIMESLICES_PER_ADVANCE {
                panic!("advance_to({target}) exceeded {MAX_TIMESLICES_PER_ADVANCE} timeslices; runaway timeline?");
            }
            self.backend.set_manual_now(due);
            self.backend.fire_slice();
            self.executor.run_until_stalled();
        }
        self.backend.set_manual_now(target);
        self.executor.run_until_stalled();
    }

    /// Advance a manual clock by `dt` seconds.
    pub fn step_sec(&self, dt: f64) {
        if !dt.is_finite() || dt < 0.0 {
            log::warn!("step_sec({dt}) ignored; step must be finite and non-negative");
            return;
        }
        self.advance_to(self.backend.now() + dt);
    }
}
