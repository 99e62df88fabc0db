//! Tree-structured cooperative time contexts for live audiovisual
//! performance.
//!
//! A launched timeline owns a [`Ctx`] and runs as a hand-written future on
//! a single-threaded executor. `wait` suspends it until a backend clock
//! says the logical deadline has passed; `branch` forks concurrent child
//! timelines; `cancel` tears down a whole subtree. Logical time is
//! monotonic per tree no matter how sloppily the underlying clock fires.
//!
//! Three interchangeable backends drive the same timeline code: a timer
//! backend with wall and manual clocks ([`Engine`]), a per-frame backend
//! for render loops ([`FrameEngine`]), and a beat-clocked JSON bridge to an
//! external sequencer ([`SequencerEngine`]).
//!
//! ```no_run
//! use timectx::{Engine, EngineConfig};
//!
//! let engine = Engine::realtime(EngineConfig { bpm: 120.0, ..Default::default() });
//! let handle = engine.launch(|ctx| async move {
//!     for _ in 0..4 {
//!         println!("beat at {:.2}s", ctx.time());
//!         if ctx.wait(1.0).await.is_err() {
//!             break;
//!         }
//!     }
//! });
//! engine.run_until_complete();
//! let _ = handle;
//! ```

pub mod arena;
pub mod backend;
pub mod context;
pub mod engine;
pub mod executor;
pub mod frame;
pub mod handle;
pub mod pq;
pub mod sequencer;
pub mod signal;
pub mod timer;

#[cfg(test)]
mod scenario_tests;

pub use arena::CtxId;
pub use backend::{Backend, WaitRequest, WaitState};
pub use context::{Ctx, FrameWaitFuture, TimeWaitFuture, WaitError, WaitFuture};
pub use engine::{Engine, EngineConfig};
pub use frame::{FrameBackend, FrameEngine};
pub use handle::{BranchHandle, BranchWaitHandle, LaunchError, LaunchHandle};
pub use sequencer::{SequencerBackend, SequencerEngine, SequencerLink};
pub use signal::CancelToken;
pub use timer::{ClockMode, TimerBackend};
