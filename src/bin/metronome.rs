//! Minimal realtime demo: a metronome timeline with an offbeat branch.
//!
//! Run with `RUST_LOG=debug` to see late-firing diagnostics from the timer
//! backend.

use timectx::{Engine, EngineConfig};

fn main() {
    env_logger::init();

    let engine = Engine::realtime(EngineConfig {
        bpm: 120.0,
        ..Default::default()
    });

    let handle = engine.launch_named("metronome", |ctx| async move {
        for bar in 0..4 {
            ctx.branch_named("offbeats", |c| async move {
                for _ in 0..4 {
                    if c.wait(0.5).await.is_err() {
                        return;
                    }
                    println!("      & ({:6.2}s)", c.time());
                    if c.wait(0.5).await.is_err() {
                        return;
                    }
                }
            });
            for beat in 0..4 {
                println!("bar {bar} beat {beat} ({:6.2}s)", ctx.time());
                if ctx.wait(1.0).await.is_err() {
                    return;
                }
            }
        }
    });

    engine.run_until_complete();
    println!("done at {:.2}s", engine.now());
    drop(handle);
}
