use std::error::Error as _;
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use assert_matches::assert_matches;
use kfd_session::ErrorKind;
use kfd_session::OpenStatus;
use kfd_session::SessionError;
use kfd_session::config::AsicFamily;
use kfd_session::config::DebugLevel;
use kfd_session::config::FORCE_ASIC_TYPE_ENV_VAR;
use kfd_session::config::ProcessEnv;
use pretty_assertions::assert_eq;
use serial_test::serial;
use session_test_support::Fixture;
use tracing_test::traced_test;

#[test]
fn subsystems_receive_the_node_count() {
    let fixture = Fixture::new(3);
    let session = fixture.session();
    session.open().unwrap();

    for subsystem in &fixture.subsystems()[..4] {
        assert_eq!(subsystem.last_node_count(), 3);
    }
    assert_eq!(session.system_properties().map(|p| p.num_nodes), Some(3));
    let page = session.page_geometry().unwrap();
    assert_eq!(1usize << page.shift, page.size);
}

#[test]
fn device_open_failure_is_io_channel_not_opened() {
    let fixture = Fixture::new(1);
    fixture.device.fail_opens(true);
    let session = fixture.session();

    let err = session.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoChannelNotOpened);
    let source = err
        .source()
        .and_then(|source| source.downcast_ref::<io::Error>())
        .map(io::Error::kind);
    assert_eq!(source, Some(io::ErrorKind::PermissionDenied));
    assert_eq!(fixture.topology.queries(), 0);
    assert_eq!(fixture.journal.take(), Vec::<String>::new());
    assert_eq!(session.open_count(), 0);

    fixture.device.fail_opens(false);
    assert_matches!(session.open(), Ok(OpenStatus::Opened));
}

#[test]
fn topology_failure_closes_the_device() {
    let fixture = Fixture::new(1);
    fixture.topology.fail_queries(true);
    let session = fixture.session();

    let err = session.open().unwrap_err();
    assert_matches!(err, SessionError::Topology(_));
    assert_eq!(err.kind(), ErrorKind::Generic);
    assert_eq!(fixture.device.opens(), 1);
    assert_eq!(fixture.device.live_handles(), 0);
    assert_eq!(fixture.apertures.inits(), 0);
    assert_eq!(session.open_count(), 0);
}

#[test]
fn aperture_failure_unwinds_to_closed() {
    let fixture = Fixture::new(1);
    fixture.apertures.fail_init(true);
    let session = fixture.session();

    let err = session.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Generic);
    assert_eq!(fixture.journal.take(), vec!["init apertures"]);
    assert_eq!(fixture.device.live_handles(), 0);
    assert_eq!(session.open_count(), 0);
    assert_eq!(fixture.fork_hooks.registrations(), 0);
}

#[test]
fn doorbell_failure_releases_apertures() {
    let fixture = Fixture::new(1);
    fixture.doorbells.fail_init(true);
    let session = fixture.session();

    let err = session.open().unwrap_err();
    assert_matches!(
        err,
        SessionError::Subsystem {
            subsystem: "doorbells",
            ..
        }
    );
    assert_eq!(
        fixture.journal.take(),
        vec!["init apertures", "init doorbells", "destroy apertures"]
    );
    assert_eq!(fixture.device.live_handles(), 0);
    assert_eq!(session.open_count(), 0);

    // A failed open leaves nothing behind for a later close to trip over.
    assert_eq!(session.close().unwrap_err().kind(), ErrorKind::IoChannelNotOpened);

    fixture.doorbells.fail_init(false);
    assert_matches!(session.open(), Ok(OpenStatus::Opened));
    assert_eq!(session.open_count(), 1);
}

#[traced_test]
#[test]
fn debug_memory_failure_is_only_a_warning() {
    let fixture = Fixture::new(2);
    fixture.debug_memory.fail_init(true);
    let session = fixture.session();

    assert_matches!(session.open(), Ok(OpenStatus::Opened));
    assert_eq!(fixture.counter_properties.inits(), 1);
    assert!(logs_contain("debugging unavailable"));
}

#[traced_test]
#[test]
fn counter_properties_failure_is_only_a_warning() {
    let fixture = Fixture::new(2);
    fixture.counter_properties.fail_init(true);
    let session = fixture.session();

    assert_matches!(session.open(), Ok(OpenStatus::Opened));
    assert!(logs_contain("performance counters unavailable"));
}

#[test]
fn malformed_override_never_touches_the_device() {
    for value in ["10.1 1 Navi10 14", "64.0.0 1 Navi10 14", "10.1.0 1 Navi10 99"] {
        let fixture = Fixture::new(1).with_env(FORCE_ASIC_TYPE_ENV_VAR, value);
        let session = fixture.session();

        let err = session.open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config, "{value}");
        assert_eq!(fixture.device.opens(), 0, "{value}");
        assert_eq!(session.open_count(), 0, "{value}");
    }
}

#[test]
fn well_formed_override_is_exposed_while_open() {
    let fixture = Fixture::new(1)
        .with_env(FORCE_ASIC_TYPE_ENV_VAR, "10.1.0 1 Navi10 14")
        .with_env("HSAKMT_DEBUG_LEVEL", "7")
        .with_env("HSA_ZFB", "1");
    let session = fixture.session();
    session.open().unwrap();

    let config = session.config().unwrap();
    assert_eq!(config.debug_level, DebugLevel::DEBUG);
    assert!(config.zero_frame_buffer);
    let forced = config.forced_asic.unwrap();
    assert_eq!(
        (forced.major, forced.minor, forced.stepping, forced.is_dgpu),
        (10, 1, 0, true)
    );
    assert_eq!(forced.name, "Navi10");
    assert_eq!(forced.family, AsicFamily::Navi10);

    session.close().unwrap();
    assert_eq!(session.config(), None);
}

#[test]
fn environment_is_not_reread_on_warm_opens() {
    let fixture = Fixture::new(1);
    let session = fixture.session();
    session.open().unwrap();
    let first = session.config();

    assert_matches!(session.open(), Ok(OpenStatus::AlreadyOpened));
    assert_eq!(session.config(), first);
}

#[test]
#[serial]
fn non_unicode_override_never_touches_the_device() {
    let fixture = Fixture::new(1);
    let session = fixture.builder().env(Arc::new(ProcessEnv)).build();

    // SAFETY: serialized with every other test that touches the process
    // environment.
    unsafe {
        std::env::set_var(
            FORCE_ASIC_TYPE_ENV_VAR,
            OsStr::from_bytes(b"10.1 1 Navi\xff10 14"),
        );
    }
    let result = session.open();
    unsafe { std::env::remove_var(FORCE_ASIC_TYPE_ENV_VAR) };

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Config);
    assert_eq!(fixture.device.opens(), 0);
    assert_eq!(session.open_count(), 0);
}
