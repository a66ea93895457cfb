//! Timer API scenarios on a live reactor.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use weft::fiber;
use weft::timer;
use weft::Options;

fn options() -> Options {
    Options {
        thread_pool_workers: 0,
        ..Options::default()
    }
}

#[test]
fn one_shots_fire_in_deadline_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&order);

    weft::run(options(), move || {
        // Scheduled out of order on purpose.
        for (delay_ms, tag) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let out = Rc::clone(&out);
            timer::call_in(Duration::from_millis(delay_ms), move || {
                out.borrow_mut().push(tag);
            })
            .unwrap();
        }
    })
    .unwrap();

    assert_eq!(*order.borrow(), ["a", "b", "c"]);
}

#[test]
fn cancelled_timer_never_fires() {
    let fired = Rc::new(Cell::new(false));
    let f = Rc::clone(&fired);

    weft::run(options(), move || {
        let cookie = timer::call_in(Duration::from_millis(10), move || f.set(true)).unwrap();
        assert!(timer::cancel(cookie));
        // A stale cookie is refused.
        assert!(!timer::cancel(cookie));
    })
    .unwrap();

    assert!(!fired.get());
}

#[test]
fn periodic_timer_cancels_itself_from_its_own_callback() {
    let count = Rc::new(Cell::new(0u32));
    let cookie_cell: Rc<Cell<Option<timer::TimerCookie>>> = Rc::new(Cell::new(None));

    let (n, c) = (Rc::clone(&count), Rc::clone(&cookie_cell));
    weft::run(options(), move || {
        let cookie = timer::call_every(
            Duration::from_millis(3),
            move || {
                n.set(n.get() + 1);
                if n.get() == 4 {
                    let cookie = c.get().expect("cookie was stored before any firing");
                    assert!(timer::cancel(cookie));
                }
            },
            true,
        )
        .unwrap();
        cookie_cell.set(Some(cookie));
    })
    .unwrap();

    assert_eq!(count.get(), 4);
}

#[test]
fn unaligned_periodic_fires_repeatedly() {
    let count = Rc::new(Cell::new(0u32));
    let n = Rc::clone(&count);

    weft::run(options(), move || {
        let cookie_cell: Rc<Cell<Option<timer::TimerCookie>>> = Rc::new(Cell::new(None));
        let c = Rc::clone(&cookie_cell);
        let cookie = timer::call_every(
            Duration::from_millis(2),
            move || {
                n.set(n.get() + 1);
                if n.get() >= 3 {
                    assert!(timer::cancel(c.get().unwrap()));
                }
            },
            false,
        )
        .unwrap();
        cookie_cell.set(Some(cookie));
    })
    .unwrap();

    assert_eq!(count.get(), 3);
}

#[test]
fn timer_callbacks_wait_for_the_ready_queue() {
    // A timer due "now" must not preempt ready fibers; it runs once they
    // have all yielded.
    let order = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&order);

    weft::run(options(), move || {
        let (o1, o2) = (Rc::clone(&out), Rc::clone(&out));
        timer::call_in(Duration::ZERO, move || o1.borrow_mut().push("timer")).unwrap();
        fiber::spawn(move || o2.borrow_mut().push("fiber")).unwrap();
    })
    .unwrap();

    assert_eq!(*order.borrow(), ["fiber", "timer"]);
}

#[test]
fn callbacks_can_wake_fibers() {
    weft::run(options(), || {
        let waiter = fiber::Builder::new()
            .func(|| fiber::suspend(weft::time::Timeout::Infinite))
            .unwrap();
        let target = waiter.handle();
        timer::call_in(Duration::from_millis(5), move || {
            assert!(fiber::resume(target));
        })
        .unwrap();
        assert!(waiter.join().unwrap().is_ok());
    })
    .unwrap();
}
