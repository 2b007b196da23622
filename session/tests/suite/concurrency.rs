use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use kfd_session::OpenStatus;
use pretty_assertions::assert_eq;
use session_test_support::Fixture;

const THREADS: usize = 16;

#[test]
fn racing_cold_opens_initialize_once() {
    let fixture = Fixture::new(2);
    let session = fixture.session();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let session = session.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                session.open().unwrap()
            })
        })
        .collect();
    let statuses: Vec<OpenStatus> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let cold = statuses
        .iter()
        .filter(|status| **status == OpenStatus::Opened)
        .count();
    assert_eq!(cold, 1);
    assert_eq!(session.open_count(), THREADS as u32);
    assert_eq!(fixture.device.opens(), 1);
    for subsystem in &fixture.subsystems()[..4] {
        assert_eq!(subsystem.inits(), 1);
    }

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let session = session.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                session.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(session.open_count(), 0);
    assert_eq!(fixture.device.live_handles(), 0);
    for subsystem in &fixture.subsystems()[..4] {
        assert_eq!(subsystem.destroys(), 1);
    }
}

#[test]
fn interleaved_open_close_never_underflows() {
    let fixture = Fixture::new(1);
    let session = fixture.session();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    session.open().unwrap();
                    session.close().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(session.open_count(), 0);
    assert_eq!(fixture.device.live_handles(), 0);
    assert_eq!(fixture.device.opens(), fixture.apertures.destroys());
    assert_eq!(fixture.apertures.inits(), fixture.apertures.destroys());
}

#[test]
fn surplus_closes_are_rejected_under_contention() {
    let fixture = Fixture::new(1);
    let session = fixture.session();
    for _ in 0..4 {
        session.open().unwrap();
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || session.close().is_ok())
        })
        .collect();
    let successes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(successes, 4);
    assert_eq!(session.open_count(), 0);
    assert_eq!(fixture.apertures.destroys(), 1);
}
