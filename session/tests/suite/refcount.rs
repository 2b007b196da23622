use assert_matches::assert_matches;
use kfd_session::ErrorKind;
use kfd_session::OpenStatus;
use kfd_session::SessionError;
use kfd_session::subsystems::Subsystem;
use pretty_assertions::assert_eq;
use session_test_support::Fixture;

#[test]
fn repeated_opens_initialize_once() {
    let fixture = Fixture::new(2);
    let session = fixture.session();

    assert_matches!(session.open(), Ok(OpenStatus::Opened));
    for _ in 1..5 {
        assert_matches!(session.open(), Ok(OpenStatus::AlreadyOpened));
    }

    assert_eq!(session.open_count(), 5);
    assert_eq!(fixture.device.opens(), 1);
    assert_eq!(fixture.topology.queries(), 1);
    for subsystem in &fixture.subsystems()[..4] {
        assert_eq!(subsystem.inits(), 1, "{}", subsystem.name());
    }
    assert_eq!(fixture.events.inits(), 0);
}

#[test]
fn teardown_happens_once_on_last_close() {
    let fixture = Fixture::new(1);
    let session = fixture.session();
    session.open().unwrap();
    session.open().unwrap();
    session.open().unwrap();

    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(fixture.apertures.destroys(), 0);
    assert_eq!(fixture.device.live_handles(), 1);

    session.close().unwrap();
    assert_eq!(session.open_count(), 0);
    assert_eq!(fixture.device.live_handles(), 0);
    for subsystem in &fixture.subsystems()[..4] {
        assert_eq!(subsystem.destroys(), 1);
    }

    let err = session.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoChannelNotOpened);
    for subsystem in &fixture.subsystems()[..4] {
        assert_eq!(subsystem.destroys(), 1);
    }
}

#[test]
fn close_on_fresh_session_has_no_side_effects() {
    let fixture = Fixture::new(1);
    let session = fixture.session();

    assert_matches!(
        session.close(),
        Err(SessionError::IoChannelNotOpened { source: None })
    );
    assert_eq!(fixture.journal.take(), Vec::<String>::new());
    assert_eq!(fixture.device.opens(), 0);
}

#[test]
fn teardown_runs_in_reverse_init_order() {
    let fixture = Fixture::new(1);
    let session = fixture.session();

    session.open().unwrap();
    session.close().unwrap();

    assert_eq!(
        fixture.journal.take(),
        vec![
            "init apertures",
            "init doorbells",
            "init debug memory",
            "init counter properties",
            "destroy counter properties",
            "destroy debug memory",
            "destroy doorbells",
            "destroy apertures",
        ]
    );
}

#[test]
fn reopening_after_full_close_is_cold_again() {
    let fixture = Fixture::new(1);
    let session = fixture.session();

    assert_matches!(session.open(), Ok(OpenStatus::Opened));
    session.close().unwrap();
    assert_matches!(session.open(), Ok(OpenStatus::Opened));

    assert_eq!(fixture.device.opens(), 2);
    assert_eq!(fixture.apertures.inits(), 2);
    assert_eq!(fixture.fork_hooks.registrations(), 1);
}

#[test]
fn clones_share_one_session() {
    let fixture = Fixture::new(1);
    let session = fixture.session();
    let other = session.clone();

    session.open().unwrap();
    assert_matches!(other.open(), Ok(OpenStatus::AlreadyOpened));
    other.close().unwrap();
    assert_eq!(session.open_count(), 1);
}
