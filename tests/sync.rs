//! Synchronization primitive scenarios: event, mutex, semaphore, barrier
//! and the bounded channel.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use weft::fiber::{self, Barrier, Channel, Event, Mutex, RecvError, Semaphore, TrySendError};
use weft::time::Timeout;
use weft::Options;

fn options() -> Options {
    Options {
        thread_pool_workers: 0,
        ..Options::default()
    }
}

#[test]
fn event_wakes_all_waiters() {
    let woken = Rc::new(Cell::new(0u32));
    let count = Rc::clone(&woken);

    weft::run(options(), move || {
        let event = Rc::new(Event::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let event = Rc::clone(&event);
            let count = Rc::clone(&count);
            handles.push(
                fiber::Builder::new()
                    .func(move || {
                        event.wait(Timeout::Infinite).unwrap();
                        count.set(count.get() + 1);
                    })
                    .unwrap(),
            );
        }
        // Let the three park, then fire once.
        fiber::reschedule().unwrap();
        event.set();
        for h in handles {
            h.join().unwrap();
        }
        // The flag stays raised: a late waiter passes straight through.
        assert!(event.is_set());
        event.wait(Timeout::Elapsed).unwrap();
        event.reset();
        assert!(!event.is_set());
    })
    .unwrap();

    assert_eq!(woken.get(), 3);
}

#[test]
fn event_wait_times_out() {
    weft::run(options(), || {
        let event = Event::new();
        let err = event.wait(Timeout::in_(Duration::from_millis(10))).unwrap_err();
        assert!(err.is_timeout());
    })
    .unwrap();
}

#[test]
fn mutex_hands_off_in_fifo_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&order);

    weft::run(options(), move || {
        let mutex = Rc::new(Mutex::new(Vec::<u32>::new()));

        let guard_holder = Rc::clone(&mutex);
        let holder = fiber::Builder::new()
            .func(move || {
                let mut guard = guard_holder.lock();
                guard.push(0);
                // Keep the lock across a few yields so both contenders
                // park on it.
                fiber::sleep(Duration::from_millis(5)).unwrap();
            })
            .unwrap();

        let mut contenders = Vec::new();
        for i in 1..=2u32 {
            let mutex = Rc::clone(&mutex);
            contenders.push(
                fiber::Builder::new()
                    .func(move || {
                        mutex.lock().push(i);
                    })
                    .unwrap(),
            );
        }

        holder.join().unwrap();
        for c in contenders {
            c.join().unwrap();
        }
        out.borrow_mut().extend(mutex.lock().iter().copied());
    })
    .unwrap();

    // FIFO: the contenders acquire in the order they queued.
    assert_eq!(*order.borrow(), [0, 1, 2]);
}

#[test]
fn mutex_try_lock_does_not_yield() {
    weft::run(options(), || {
        let mutex = Mutex::new(5);
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 5);
    })
    .unwrap();
}

#[test]
fn semaphore_counts_permits() {
    weft::run(options(), || {
        let sem = Rc::new(Semaphore::new(2));
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());

        let waiter = {
            let sem = Rc::clone(&sem);
            fiber::Builder::new()
                .func(move || {
                    sem.acquire(Timeout::Infinite).unwrap();
                    sem.release(1);
                })
                .unwrap()
        };
        fiber::reschedule().unwrap(); // the waiter parks
        sem.release(1);
        waiter.join().unwrap();
        assert_eq!(sem.permits(), 1);
    })
    .unwrap();
}

#[test]
fn semaphore_acquire_times_out() {
    weft::run(options(), || {
        let sem = Semaphore::new(0);
        let err = sem.acquire(Timeout::in_(Duration::from_millis(10))).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(sem.permits(), 0);
    })
    .unwrap();
}

#[test]
fn barrier_releases_everyone_at_once() {
    let leaders = Rc::new(Cell::new(0u32));
    let arrived = Rc::new(Cell::new(0u32));
    let (l, a) = (Rc::clone(&leaders), Rc::clone(&arrived));

    weft::run(options(), move || {
        let barrier = Rc::new(Barrier::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let barrier = Rc::clone(&barrier);
            let (l, a) = (Rc::clone(&l), Rc::clone(&a));
            handles.push(
                fiber::Builder::new()
                    .func(move || {
                        if barrier.wait(Timeout::Infinite).unwrap() {
                            l.set(l.get() + 1);
                        }
                        a.set(a.get() + 1);
                    })
                    .unwrap(),
            );
        }
        for h in handles {
            h.join().unwrap();
        }
    })
    .unwrap();

    assert_eq!(leaders.get(), 1, "exactly one fiber trips the barrier");
    assert_eq!(arrived.get(), 3);
}

#[test]
fn bounded_channel_backpressure() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&seen);

    weft::run(options(), move || {
        let chan: Channel<u32> = Channel::new(2);

        let producer = {
            let chan = chan.clone();
            fiber::Builder::new()
                .func(move || {
                    for i in 0..5 {
                        chan.send(i).unwrap();
                    }
                    chan.close();
                })
                .unwrap()
        };

        let consumer = {
            let chan = chan.clone();
            let out = Rc::clone(&out);
            fiber::Builder::new()
                .func(move || {
                    for v in chan.iter() {
                        out.borrow_mut().push(v);
                    }
                })
                .unwrap()
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(chan.recv().unwrap_err(), RecvError::Disconnected);
    })
    .unwrap();

    assert_eq!(*seen.borrow(), [0, 1, 2, 3, 4]);
}

#[test]
fn channel_try_send_reports_full() {
    weft::run(options(), || {
        let chan: Channel<u32> = Channel::new(1);
        chan.try_send(1).unwrap();
        match chan.try_send(2) {
            Err(TrySendError::Full(2)) => {}
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(chan.recv().unwrap(), 1);
    })
    .unwrap();
}

#[test]
fn rendezvous_channel_pairs_send_with_recv() {
    let got = Rc::new(Cell::new(0u32));
    let out = Rc::clone(&got);

    weft::run(options(), move || {
        let chan: Channel<u32> = Channel::new(0);

        let sender = {
            let chan = chan.clone();
            fiber::Builder::new()
                .func(move || chan.send(42))
                .unwrap()
        };
        // The sender parks with its value: nobody is receiving yet.
        fiber::reschedule().unwrap();

        out.set(chan.recv().unwrap());
        sender.join().unwrap().unwrap();
    })
    .unwrap();

    assert_eq!(got.get(), 42);
}

#[test]
fn rendezvous_send_times_out_without_a_receiver() {
    weft::run(options(), || {
        let chan: Channel<u32> = Channel::new(0);
        match chan.send_timeout(9, Duration::from_millis(10)) {
            Err(weft::fiber::SendError::Timeout(9)) => {}
            other => panic!("expected Timeout(9), got {other:?}"),
        }
    })
    .unwrap();
}
