//! End-to-end scheduler scenarios: cooperative interleaving, fiber
//! lifecycle, cancellation and timeouts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use weft::error::Error;
use weft::fiber::{self, YieldResult};
use weft::time::Timeout;
use weft::Options;

fn options() -> Options {
    Options {
        thread_pool_workers: 0,
        ..Options::default()
    }
}

#[test]
fn two_fibers_interleave_strictly() {
    let trace = Rc::new(RefCell::new(Vec::new()));
    let (trace_a, trace_b) = (Rc::clone(&trace), Rc::clone(&trace));

    weft::run(options(), move || {
        fiber::spawn(move || {
            for i in 0..10 {
                trace_a.borrow_mut().push(format!("a{i}"));
                fiber::reschedule().unwrap();
            }
        })
        .unwrap();
        fiber::spawn(move || {
            for i in 0..10 {
                trace_b.borrow_mut().push(format!("b{i}"));
                fiber::reschedule().unwrap();
            }
        })
        .unwrap();
    })
    .unwrap();

    let expected: Vec<String> = (0..10)
        .flat_map(|i| vec![format!("a{i}"), format!("b{i}")])
        .collect();
    assert_eq!(*trace.borrow(), expected);
}

#[test]
fn prioritized_spawn_runs_first() {
    let trace = Rc::new(RefCell::new(Vec::new()));
    let t = Rc::clone(&trace);

    weft::run(options(), move || {
        let (t1, t2) = (Rc::clone(&t), Rc::clone(&t));
        fiber::spawn(move || t1.borrow_mut().push("tail")).unwrap();
        fiber::spawn_prioritized(move || t2.borrow_mut().push("head")).unwrap();
    })
    .unwrap();

    assert_eq!(*trace.borrow(), ["head", "tail"]);
}

#[test]
fn join_handle_returns_value() {
    let sum = Rc::new(Cell::new(0));
    let out = Rc::clone(&sum);

    weft::run(options(), move || {
        let handle = fiber::Builder::new()
            .name("adder")
            .func(|| (1..=10).sum::<i32>())
            .unwrap();
        out.set(handle.join().unwrap());
    })
    .unwrap();

    assert_eq!(sum.get(), 55);
}

#[test]
fn suspend_timeout_wins() {
    let elapsed = Rc::new(Cell::new(Duration::ZERO));
    let observed = Rc::clone(&elapsed);

    weft::run(options(), move || {
        let started = std::time::Instant::now();
        let err = fiber::suspend(Timeout::in_(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout(), "expected Timeout, got {err:?}");
        observed.set(started.elapsed());
    })
    .unwrap();

    assert!(elapsed.get() >= Duration::from_millis(15), "{:?}", elapsed.get());
    assert!(elapsed.get() < Duration::from_secs(2), "{:?}", elapsed.get());
}

#[test]
fn resume_beats_the_timeout() {
    weft::run(options(), || {
        let waiter = fiber::Builder::new()
            .func(|| {
                // A generous timeout that must not fire.
                fiber::suspend(Timeout::in_(Duration::from_secs(10)))
            })
            .unwrap();
        let target = waiter.handle();
        fiber::spawn(move || {
            assert!(fiber::resume(target));
        })
        .unwrap();
        assert!(waiter.join().unwrap().is_ok());
    })
    .unwrap();
}

#[test]
fn throw_in_surfaces_at_suspension_point() {
    weft::run(options(), || {
        let victim = fiber::Builder::new()
            .func(|| fiber::suspend(Timeout::Infinite))
            .unwrap();
        let target = victim.handle();
        fiber::spawn(move || {
            assert!(fiber::throw_in(target, Error::Injected("boom".into())));
        })
        .unwrap();
        match victim.join().unwrap() {
            Err(Error::Injected(msg)) => assert_eq!(&*msg, "boom"),
            other => panic!("expected the injected error, got {other:?}"),
        }
    })
    .unwrap();
}

#[test]
fn kill_unwinds_and_runs_guards() {
    struct RaiiProbe(Rc<Cell<bool>>);
    impl Drop for RaiiProbe {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let dropped = Rc::new(Cell::new(false));
    let finished = Rc::new(Cell::new(false));
    let (d, f) = (Rc::clone(&dropped), Rc::clone(&finished));

    weft::run(options(), move || {
        let victim = fiber::spawn(move || {
            let _probe = RaiiProbe(d);
            let _ = fiber::suspend(Timeout::Infinite);
            f.set(true); // never reached
        })
        .unwrap();
        // Let the victim park first.
        fiber::reschedule().unwrap();
        assert!(fiber::kill(victim));
        assert!(fiber::join(victim, Timeout::Infinite).is_ok());
        assert!(!victim.is_valid());
    })
    .unwrap();

    assert!(dropped.get(), "the RAII guard must run during the unwind");
    assert!(!finished.get());
}

#[test]
fn slot_reuse_bumps_incarnation() {
    weft::run(options(), || {
        let first = fiber::spawn(|| {}).unwrap();
        assert!(first.is_valid());
        fiber::join(first, Timeout::Infinite).unwrap();
        assert!(!first.is_valid());

        // The freshest released slot is reused; the old handle stays dead.
        let second = fiber::spawn(|| {}).unwrap();
        assert_eq!(second.permanent_id(), first.permanent_id());
        assert!(second.is_valid());
        assert!(!first.is_valid());
        assert_ne!(first, second);
        fiber::join(second, Timeout::Infinite).unwrap();
    })
    .unwrap();
}

#[test]
fn operations_on_stale_handles_are_noops() {
    weft::run(options(), || {
        let gone = fiber::spawn(|| {}).unwrap();
        fiber::join(gone, Timeout::Infinite).unwrap();
        assert!(!fiber::resume(gone));
        assert!(!fiber::kill(gone));
        assert!(!fiber::throw_in(gone, Error::Interrupted));
        // Joining a dead fiber reports success: it is certainly finished.
        assert!(fiber::join(gone, Timeout::Infinite).is_ok());
    })
    .unwrap();
}

#[test]
fn sleep_yields_and_returns() {
    weft::run(options(), || {
        assert_eq!(
            fiber::check_yield(|| fiber::sleep(Duration::from_millis(2)).unwrap()),
            YieldResult::Yielded(())
        );
        // Zero-duration sleep degrades to a plain reschedule.
        assert_eq!(
            fiber::check_yield(|| fiber::sleep(Duration::ZERO).unwrap()),
            YieldResult::Yielded(())
        );
        assert_eq!(fiber::check_yield(|| 7), YieldResult::DidntYield(7));
    })
    .unwrap();
}

#[test]
fn fiber_local_is_per_fiber() {
    static SLOT: fiber::FiberLocal<u32> = fiber::FiberLocal::new(|| 0);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&seen);

    weft::run(options(), move || {
        let mut handles = Vec::new();
        for i in 1..=3u32 {
            let out = Rc::clone(&out);
            handles.push(
                fiber::Builder::new()
                    .func(move || {
                        SLOT.with(|v| *v += i).unwrap();
                        fiber::reschedule().unwrap();
                        out.borrow_mut().push(SLOT.with(|v| *v).unwrap());
                    })
                    .unwrap(),
            );
        }
        for h in handles {
            h.join().unwrap();
        }
    })
    .unwrap();

    let mut got = seen.borrow().clone();
    got.sort_unstable();
    assert_eq!(got, [1, 2, 3]);
}

#[test]
fn spawn_fails_when_the_pool_is_depleted() {
    let options = Options {
        max_fibers: 2,
        thread_pool_workers: 0,
        ..Options::default()
    };
    weft::run(options, || {
        // This fiber occupies one slot.
        let _second = fiber::spawn(|| fiber::sleep(Duration::from_millis(5)).unwrap()).unwrap();
        match fiber::spawn(|| {}) {
            Err(Error::PoolDepleted(what)) => assert_eq!(what, "fiber"),
            other => panic!("expected PoolDepleted, got {other:?}"),
        }
    })
    .unwrap();
}

#[test]
fn suspending_inside_a_critical_section_panics() {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let tripped = Rc::new(Cell::new(false));
    let seen = Rc::clone(&tripped);

    weft::run(options(), move || {
        let result = catch_unwind(AssertUnwindSafe(|| {
            weft::critical(|| {
                let _ = fiber::reschedule();
            })
        }));
        seen.set(result.is_err());
    })
    .unwrap();

    assert!(tripped.get(), "the suspension attempt must be asserted");
}

#[test]
fn fiber_panic_propagates_out_of_mainloop() {
    let outcome = std::thread::spawn(|| {
        weft::run(options(), || {
            fiber::spawn(|| panic!("boom from fiber")).unwrap();
        })
    })
    .join();
    match outcome {
        Err(payload) => {
            let msg = payload.downcast_ref::<&str>().copied().unwrap_or("");
            assert!(msg.contains("boom from fiber"), "{msg}");
        }
        Ok(r) => panic!("expected mainloop to re-raise the panic, got {r:?}"),
    }
}

#[test]
fn critical_section_blocks_nothing_but_switches() {
    let witnessed = Rc::new(Cell::new(false));
    let w = Rc::clone(&witnessed);
    weft::run(options(), move || {
        let value = weft::critical(|| {
            // Resuming and spawning are fine inside, only suspension is
            // forbidden.
            fiber::spawn(|| {}).unwrap();
            41
        });
        w.set(true);
        assert_eq!(value + 1, 42);
    })
    .unwrap();
    assert!(witnessed.get());
}
