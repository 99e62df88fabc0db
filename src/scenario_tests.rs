//! End-to-end timeline scenarios, driven through the manual-clock engine so
//! every run is deterministic and instant.

use crate::engine::{Engine, EngineConfig};
use crate::handle::{LaunchError, LaunchHandle};
use crate::context::WaitError;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn manual_engine() -> Engine {
    Engine::manual(EngineConfig::default())
}

#[test]
fn test_launch_returns_value_after_wait() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        ctx.wait(1.0).await.ok();
        42
    });
    assert!(!handle.is_settled());
    engine.advance_to(1.0);
    assert!(handle.is_settled());
    assert_eq!(handle.take_result(), Some(Ok(42)));
    // Result is take-once.
    assert_eq!(handle.take_result(), None);
}

#[test]
fn test_parallel_branches_share_logical_time() {
    // Two sibling one-second waits overlap; the tree's high-water mark ends
    // at one second, not two.
    let engine = manual_engine();
    let observed = Rc::new(Cell::new(f64::NAN));
    let obs = observed.clone();
    let handle = engine.launch(move |ctx| async move {
        let _bg = ctx.branch(|c| async move {
            c.wait_sec(1.0).await.ok();
        });
        let bw = ctx.branch_wait(|c| async move {
            c.wait_sec(1.0).await.ok();
        });
        bw.await.ok();
        obs.set(ctx.most_recent_desc_time());
        ctx.time()
    });
    engine.advance_to(2.0);
    assert!((observed.get() - 1.0).abs() < 1e-9);
    assert!((handle.take_result().unwrap().unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_branch_starts_at_tree_high_water_mark() {
    let engine = manual_engine();
    let child_start = Rc::new(Cell::new(f64::NAN));
    let cs = child_start.clone();
    let handle = engine.launch(move |ctx| async move {
        ctx.branch_wait(|c| async move {
            c.wait_sec(5.0).await.ok();
        })
        .await
        .ok();
        // Tree has reached 5; a fresh branch must not rewind it.
        let h = ctx.branch(move |c| async move {
            cs.set(c.start_time());
        });
        drop(h);
        ctx.time()
    });
    engine.advance_to(6.0);
    assert!((child_start.get() - 5.0).abs() < 1e-9);
    assert!((handle.take_result().unwrap().unwrap() - 5.0).abs() < 1e-9);
}

#[test]
fn test_cancel_stops_subtree_permanently() {
    let engine = manual_engine();
    let ticks = Rc::new(Cell::new(0u32));
    let t = ticks.clone();
    let handle: LaunchHandle<()> = engine.launch(move |ctx| async move {
        loop {
            if ctx.wait_sec(1.0).await.is_err() {
                break;
            }
            t.set(t.get() + 1);
            ctx.branch(|c| async move {
                c.wait_sec(0.5).await.ok();
            });
        }
    });
    engine.advance_to(3.25);
    assert_eq!(ticks.get(), 3);
    handle.cancel();
    engine.advance_to(20.0);
    // No resolution after cancel, and the whole tree is torn down.
    assert_eq!(ticks.get(), 3);
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(handle.take_result(), Some(Err(LaunchError::Canceled)));
}

#[test]
fn test_wait_on_canceled_context_fails_without_scheduling() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move { ctx.wait_sec(1.0).await });
    handle.cancel();
    engine.advance_to(5.0);
    assert_eq!(handle.take_result(), Some(Err(LaunchError::Canceled)));
    assert_eq!(engine.timer().scheduled_total(), 0);
}

#[test]
fn test_cancel_single_branch_leaves_parent_running() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        let bw = ctx.branch_wait(|c| async move {
            c.wait_sec(5.0).await.ok();
        });
        ctx.wait_sec(1.0).await.ok();
        bw.cancel();
        let res = bw.await;
        (res, ctx.time())
    });
    engine.advance_to(2.0);
    let (res, t) = handle.take_result().unwrap().unwrap();
    assert_eq!(res, Err(WaitError::Canceled));
    // Canceled branch never advanced the parent.
    assert!((t - 1.0).abs() < 1e-9);
    assert_eq!(engine.live_contexts(), 0);
}

#[test]
fn test_zero_beat_wait_skips_the_backend() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        for _ in 0..100 {
            ctx.wait(0.0).await.ok();
        }
        ctx.time()
    });
    engine.advance_to(0.0);
    assert!((handle.take_result().unwrap().unwrap() - 0.0).abs() < 1e-12);
    assert_eq!(engine.timer().scheduled_total(), 0);
}

#[test]
fn test_zero_second_wait_still_schedules_a_sync_point() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        ctx.wait_sec(0.0).await.ok();
    });
    engine.advance_to(0.0);
    assert!(handle.is_settled());
    assert_eq!(engine.timer().scheduled_total(), 1);
}

#[test]
fn test_wait_converts_beats_at_context_tempo() {
    let engine = Engine::manual(EngineConfig {
        bpm: 120.0,
        ..Default::default()
    });
    let handle = engine.launch(|ctx| async move {
        ctx.wait(4.0).await.ok();
        ctx.time()
    });
    engine.advance_to(1.9);
    assert!(!handle.is_settled());
    engine.advance_to(2.0);
    // 4 beats at 120 bpm is exactly 2 seconds.
    assert!((handle.take_result().unwrap().unwrap() - 2.0).abs() < 1e-12);
}

#[test]
fn test_set_bpm_applies_to_later_waits() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        ctx.wait(1.0).await.ok(); // 1 beat at 60 bpm = 1 s
        ctx.set_bpm(120.0);
        ctx.wait(1.0).await.ok(); // 1 beat at 120 bpm = 0.5 s
        ctx.time()
    });
    engine.advance_to(2.0);
    assert!((handle.take_result().unwrap().unwrap() - 1.5).abs() < 1e-9);
}

#[test]
fn test_invalid_durations_resolve_safely() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        ctx.wait(f64::NAN).await.ok();
        ctx.wait(-3.0).await.ok();
        ctx.wait_sec(f64::NAN).await.ok();
        ctx.wait_sec(-1.0).await.ok();
        ctx.time()
    });
    engine.advance_to(0.0);
    assert!((handle.take_result().unwrap().unwrap() - 0.0).abs() < 1e-12);
}

#[test]
fn test_branch_wait_advances_parent_but_branch_does_not() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        ctx.branch(|c| async move {
            c.wait_sec(3.0).await.ok();
        });
        let after_branch = ctx.time();
        ctx.branch_wait(|c| async move {
            c.wait_sec(2.0).await.ok();
        })
        .await
        .ok();
        (after_branch, ctx.time())
    });
    engine.advance_to(4.0);
    let (after_branch, after_bw) = handle.take_result().unwrap().unwrap();
    assert!((after_branch - 0.0).abs() < 1e-12);
    assert!((after_bw - 2.0).abs() < 1e-9);
}

#[test]
fn test_equal_deadlines_fire_in_registration_order() {
    let engine = manual_engine();
    let order = Rc::new(RefCell::new(String::new()));
    let oa = order.clone();
    let ob = order.clone();
    let _a = engine.launch(move |ctx| async move {
        ctx.wait_sec(1.0).await.ok();
        oa.borrow_mut().push('A');
    });
    let _b = engine.launch(move |ctx| async move {
        ctx.wait_sec(1.0).await.ok();
        ob.borrow_mut().push('B');
    });
    engine.advance_to(1.0);
    assert_eq!(*order.borrow(), "AB");
}

#[test]
fn test_panicking_timeline_is_contained() {
    let engine = manual_engine();
    let bad: LaunchHandle<()> = engine.launch(|ctx| async move {
        ctx.wait_sec(1.0).await.ok();
        panic!("boom");
    });
    let good = engine.launch(|ctx| async move {
        ctx.wait_sec(2.0).await.ok();
        ctx.time()
    });
    engine.advance_to(3.0);
    match bad.take_result() {
        Some(Err(LaunchError::Panicked(msg))) => assert!(msg.contains("boom")),
        other => panic!("expected panicked launch, got {other:?}"),
    }
    assert!((good.take_result().unwrap().unwrap() - 2.0).abs() < 1e-9);
    assert_eq!(engine.live_contexts(), 0);
}

#[test]
fn test_panicking_branch_leaves_parent_running() {
    let engine = manual_engine();
    let handle = engine.launch(|ctx| async move {
        ctx.branch(|_c| async move {
            panic!("child boom");
        });
        ctx.wait_sec(1.0).await.ok();
        7
    });
    engine.advance_to(1.0);
    assert_eq!(handle.take_result(), Some(Ok(7)));
}

#[test]
fn test_on_settled_fires_exactly_once() {
    let engine = manual_engine();
    let count = Rc::new(Cell::new(0u32));
    let handle = engine.launch(|ctx| async move {
        ctx.wait_sec(1.0).await.ok();
    });
    let c1 = count.clone();
    handle.on_settled(move || c1.set(c1.get() + 1));
    engine.advance_to(1.0);
    assert_eq!(count.get(), 1);
    // Registered after settlement: fires immediately.
    let c2 = count.clone();
    handle.on_settled(move || c2.set(c2.get() + 10));
    assert_eq!(count.get(), 11);
}

#[test]
fn test_nested_branches_settle_bottom_up() {
    let engine = manual_engine();
    let trace = Rc::new(RefCell::new(Vec::new()));
    let t = trace.clone();
    let handle = engine.launch(move |ctx| async move {
        let t2 = t.clone();
        ctx.branch_wait(move |c| async move {
            let t3 = t2.clone();
            c.branch_wait(move |g| async move {
                g.wait_sec(1.0).await.ok();
                t3.borrow_mut().push(("grandchild", g.time()));
            })
            .await
            .ok();
            t2.borrow_mut().push(("child", c.time()));
        })
        .await
        .ok();
        t.borrow_mut().push(("root", ctx.time()));
    });
    engine.advance_to(1.0);
    assert!(handle.is_settled());
    let trace = trace.borrow();
    assert_eq!(trace.len(), 3);
    assert_eq!(trace[0].0, "grandchild");
    assert_eq!(trace[1].0, "child");
    assert_eq!(trace[2].0, "root");
    for (_, time) in trace.iter() {
        assert!((time - 1.0).abs() < 1e-9);
    }
    assert_eq!(engine.live_contexts(), 0);
}

#[test]
fn test_logical_time_never_decreases_across_waits() {
    let engine = manual_engine();
    let times = Rc::new(RefCell::new(Vec::new()));
    let t = times.clone();
    let _h = engine.launch(move |ctx| async move {
        for _ in 0..5 {
            ctx.wait_sec(0.3).await.ok();
            t.borrow_mut().push(ctx.time());
        }
    });
    engine.advance_to(2.0);
    let times = times.borrow();
    assert_eq!(times.len(), 5);
    for pair in times.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    // Accumulated target is exact, not subject to per-step drift.
    assert!((times[4] - 1.5).abs() < 1e-9);
}
