use netbios_ns::{DaemonConfig, DaemonStatus, Error, IfKind, NameDaemon, NameEvent, NbName};
use std::time::{Duration, SystemTime};
use test_log::test;

/// A daemon on a random unprivileged port, so that tests do not need root
/// and do not disturb a real name service on the host.
fn test_daemon() -> NameDaemon {
    let port = fastrand::u16(20000..30000);
    let config = DaemonConfig::builder()
        .port(port)
        .reachability_probe(false)
        .build();
    NameDaemon::with_config(config).expect("Failed to create daemon")
}

/// A name unlikely to exist on the network the test runs on.
fn unique_name() -> NbName {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap();
    NbName::new(&format!("T{:014}", now.as_micros() % 100_000_000_000_000), 0x20).unwrap()
}

#[test]
fn daemon_status_and_shutdown() {
    let d = test_daemon();

    let status = d.status().unwrap().recv().unwrap();
    assert_eq!(status, DaemonStatus::Running);

    let metrics = d.get_metrics().unwrap().recv().unwrap();
    println!("metrics: {:?}", metrics);

    let status = d.shutdown().unwrap().recv().unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);

    // The daemon thread is gone.
    std::thread::sleep(Duration::from_millis(100));
    let status = d.status().unwrap().recv().unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);
}

#[test]
fn resolve_unknown_name_fails() {
    let d = test_daemon();
    let name = unique_name();

    let receiver = d.resolve(name).unwrap();
    let event = receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("no answer for resolve");
    match event {
        NameEvent::ResolveFailed(failed, e) => {
            assert_eq!(failed, name);
            assert!(matches!(e, Error::Timeout | Error::NameNotFound));
        }
        other => panic!("unexpected event {:?}", other),
    }

    d.shutdown().unwrap();
}

#[test]
fn register_then_release() {
    let d = test_daemon();
    let name = unique_name();

    let receiver = d.register(name, false).unwrap();
    let event = receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("no answer for register");

    match event {
        NameEvent::Registered(registered) => {
            assert_eq!(registered, name);

            let result = d.set_port(name, 4455).unwrap().recv().unwrap();
            assert!(result.is_ok());
            assert_eq!(d.get_port(name).unwrap().recv().unwrap(), Some(4455));

            // Our own name resolves locally.
            let resolved = d.resolve(name).unwrap().recv().unwrap();
            assert!(matches!(resolved, NameEvent::Resolved(n, _) if n == name));

            let released = d.release(name, false).unwrap().recv().unwrap();
            assert_eq!(released, NameEvent::Released(name));
        }
        NameEvent::RegisterFailed(_, e) => {
            // A host without any usable IPv4 interface.
            println!("register failed: {}", e);
        }
        other => panic!("unexpected event {:?}", other),
    }

    d.shutdown().unwrap();
}

#[test]
fn register_fails_with_all_interfaces_disabled() {
    let d = test_daemon();
    d.disable_interface(IfKind::All).unwrap();

    let name = unique_name();
    let event = d
        .register(name, false)
        .unwrap()
        .recv_timeout(Duration::from_secs(2))
        .expect("no answer for register");
    assert!(matches!(event, NameEvent::RegisterFailed(n, _) if n == name));

    let status = d.shutdown().unwrap().recv().unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);
}
