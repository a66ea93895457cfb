//! Descriptor readiness scenarios over OS pipes.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use weft::coio::{self, CoIoFlags};
use weft::error::Error;
use weft::fiber;
use weft::time::Timeout;
use weft::Options;

fn options() -> Options {
    Options {
        thread_pool_workers: 0,
        ..Options::default()
    }
}

fn nonblocking_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2 failed: {}", std::io::Error::last_os_error());
    (fds[0], fds[1])
}

fn read_some(fd: i32, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_some(fd: i32, buf: &[u8]) -> Result<usize, std::io::Error> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// The reader parks on readability, the writer pushes a payload larger than
/// the pipe buffer, the reader drains it across several EAGAIN cycles and
/// finally observes EOF.
#[test]
fn pipe_reader_wakes_on_write_and_sees_eof() {
    const PAYLOAD: usize = 256 * 1024;

    let received = Rc::new(Cell::new(0usize));
    let total = Rc::clone(&received);

    weft::run(options(), move || {
        let (rd, wr) = nonblocking_pipe();

        let reader = fiber::Builder::new()
            .name("reader")
            .func(move || {
                let handle = coio::register(rd, CoIoFlags::READ, true).unwrap();
                let mut buf = [0u8; 4096];
                let mut seen = 0usize;
                loop {
                    match read_some(rd, &mut buf) {
                        Ok(0) => break, // EOF after the writer closed
                        Ok(n) => seen += n,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            coio::wait_readable(handle, Timeout::Infinite).unwrap();
                        }
                        Err(e) => panic!("pipe read failed: {e}"),
                    }
                }
                coio::deregister(handle).unwrap();
                unsafe { libc::close(rd) };
                seen
            })
            .unwrap();

        let writer = fiber::Builder::new()
            .name("writer")
            .func(move || {
                let handle = coio::register(wr, CoIoFlags::WRITE, true).unwrap();
                let chunk = [0xA5u8; 4096];
                let mut sent = 0usize;
                while sent < PAYLOAD {
                    let want = chunk.len().min(PAYLOAD - sent);
                    match write_some(wr, &chunk[..want]) {
                        Ok(n) => sent += n,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            coio::wait_writable(handle, Timeout::Infinite).unwrap();
                        }
                        Err(e) => panic!("pipe write failed: {e}"),
                    }
                }
                coio::deregister(handle).unwrap();
                unsafe { libc::close(wr) };
                sent
            })
            .unwrap();

        assert_eq!(writer.join().unwrap(), PAYLOAD);
        total.set(reader.join().unwrap());
    })
    .unwrap();

    assert_eq!(received.get(), PAYLOAD);
}

#[test]
fn register_deregister_round_trip() {
    weft::run(options(), || {
        let (rd, wr) = nonblocking_pipe();
        let first = coio::register(rd, CoIoFlags::READ, true).unwrap();
        coio::deregister(first).unwrap();
        // The same fd registers again cleanly and the stale handle is dead.
        let second = coio::register(rd, CoIoFlags::READ, true).unwrap();
        assert!(matches!(
            coio::wait_readable(first, Timeout::Elapsed),
            Err(Error::Other(_))
        ));
        coio::deregister(second).unwrap();
        assert!(coio::deregister(second).is_err());
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    })
    .unwrap();
}

#[test]
fn wait_readable_times_out() {
    weft::run(options(), || {
        let (rd, wr) = nonblocking_pipe();
        let handle = coio::register(rd, CoIoFlags::READ, true).unwrap();
        let started = std::time::Instant::now();
        match coio::wait_readable(handle, Timeout::in_(Duration::from_millis(20))) {
            Err(Error::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(15));
        coio::deregister(handle).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    })
    .unwrap();
}

#[test]
fn readiness_callback_fires_per_edge() {
    let hits = Rc::new(Cell::new(0u32));
    let count = Rc::clone(&hits);

    weft::run(options(), move || {
        let (rd, wr) = nonblocking_pipe();
        let handle = coio::register(rd, CoIoFlags::READ, true).unwrap();
        let n = Rc::clone(&count);
        coio::set_callback(
            handle,
            coio::Direction::Read,
            move || n.set(n.get() + 1),
            true,
        )
        .unwrap();

        write_some(wr, b"ping").unwrap();
        // Let the idle phase deliver the edge.
        fiber::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(count.get(), 1);

        // One-shot: a second edge is not dispatched to the callback.
        write_some(wr, b"pong").unwrap();
        fiber::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(count.get(), 1);

        coio::deregister(handle).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    })
    .unwrap();

    assert_eq!(hits.get(), 1);
}
