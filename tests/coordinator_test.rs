//! Integration tests for the session coordinator over hosted workers.
//!
//! Each worker runs on its own thread with real time, so these tests wait on
//! responses and counters instead of exact timestamps.

use std::path::Path;
use std::time::Duration;
use telemetry_daq::config::DeviceType;
use telemetry_daq::hardware::{DeviceKind, MockInterface, MockProbe, MockScript};
use telemetry_daq::ports::StaticPorts;
use telemetry_daq::{
    DaqError, DeviceWorker, Response, SessionCoordinator, WorkerHost, WorkerSettings, WorkerState,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn add_mock(
    coordinator: &mut SessionCoordinator,
    dir: &Path,
    title: &str,
    device_type: DeviceType,
    script: MockScript,
) -> MockProbe {
    let mock = MockInterface::new(DeviceKind::Sensor, script);
    let probe = mock.probe();
    let settings = WorkerSettings::new(title, "session", dir).with_interval_ms(5);
    let worker = DeviceWorker::new(settings, Box::new(mock), None).unwrap();
    let handle = WorkerHost::spawn(worker).unwrap();
    coordinator.add_device(device_type, handle).unwrap();
    probe
}

/// Read responses until `title` reports one matching `accept`. Returns everything seen on the way.
async fn wait_for_match<F: Fn(&Response) -> bool>(
    coordinator: &mut SessionCoordinator,
    title: &str,
    accept: F,
) -> Vec<(String, Response)> {
    let mut seen = Vec::new();
    loop {
        let next = tokio::time::timeout(TIMEOUT, coordinator.next_response())
            .await
            .unwrap_or_else(|_| panic!("no matching response from {title}, saw {seen:?}"))
            .expect("all workers exited");
        let done = next.0 == title && accept(&next.1);
        seen.push(next);
        if done {
            return seen;
        }
    }
}

async fn wait_for(
    coordinator: &mut SessionCoordinator,
    title: &str,
    expected: Response,
) -> Vec<(String, Response)> {
    wait_for_match(coordinator, title, |response| *response == expected).await
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_device_does_not_affect_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = SessionCoordinator::new(Box::new(StaticPorts::default()));
    let probe_a = add_mock(
        &mut coordinator,
        dir.path(),
        "A",
        DeviceType::Mock,
        MockScript::default().generating().lose_connection_on_poll(5),
    );
    add_mock(
        &mut coordinator,
        dir.path(),
        "B",
        DeviceType::Mock,
        MockScript::default().generating(),
    );

    coordinator.connect("A", "mock-a").unwrap();
    coordinator.connect("B", "mock-b").unwrap();
    coordinator.start_all();

    let seen = wait_for(
        &mut coordinator,
        "A",
        Response::Error("Lost connection to A. Stopping".into()),
    )
    .await;
    assert!(seen.contains(&("A".to_string(), Response::Started(true))));
    assert_eq!(coordinator.sample_count("A").unwrap(), 4);
    assert_eq!(coordinator.device_state("A").unwrap(), WorkerState::Connected);

    let b_before = coordinator.sample_count("B").unwrap();
    wait_until(|| coordinator.sample_count("B").unwrap_or(0) > b_before + 5).await;
    assert_eq!(coordinator.device_state("B").unwrap(), WorkerState::Started);
    assert_eq!(coordinator.sample_count("A").unwrap(), 4);
    assert_eq!(probe_a.poll_count(), 5);

    coordinator.stop_all();
    wait_for(&mut coordinator, "B", Response::Stopped(true)).await;
    coordinator.shutdown(TIMEOUT).await.unwrap();

    let a_log = std::fs::read_to_string(dir.path().join("SESSION_A.log")).unwrap();
    assert_eq!(a_log.lines().count(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_all_shares_one_reference_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = SessionCoordinator::new(Box::new(StaticPorts::default()));
    for title in ["TMOS 1", "TMOS 2", "TMOS 3"] {
        add_mock(
            &mut coordinator,
            dir.path(),
            title,
            DeviceType::Serial,
            MockScript::default().generating(),
        );
        coordinator.connect(title, "mock").unwrap();
    }

    // Connect outcomes come back before any start
    for title in ["TMOS 1", "TMOS 2", "TMOS 3"] {
        wait_for(&mut coordinator, title, Response::Connected(true)).await;
    }

    let t0 = coordinator.start_all();
    for title in ["TMOS 1", "TMOS 2", "TMOS 3"] {
        wait_for(&mut coordinator, title, Response::Started(true)).await;
    }
    wait_until(|| {
        ["TMOS 1", "TMOS 2", "TMOS 3"]
            .iter()
            .all(|title| coordinator.sample_count(title).unwrap_or(0) >= 3)
    })
    .await;
    coordinator.stop_all();
    for title in ["TMOS 1", "TMOS 2", "TMOS 3"] {
        wait_for(&mut coordinator, title, Response::Stopped(true)).await;
    }
    let bound = u64::try_from(t0.elapsed().as_millis()).unwrap();
    coordinator.shutdown(TIMEOUT).await.unwrap();

    // Every record is stamped against the shared origin
    for file in ["SESSION_TMOS_1.log", "SESSION_TMOS_2.log", "SESSION_TMOS_3.log"] {
        let content = std::fs::read_to_string(dir.path().join(file)).unwrap();
        let stamps: Vec<u64> = content
            .lines()
            .map(|line| line.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert!(stamps.len() >= 3);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(stamps.iter().all(|stamp| *stamp <= bound));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refresh_ports_skips_connected_serial_devices() {
    let dir = tempfile::tempdir().unwrap();
    let ports = StaticPorts::new(["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    let mut coordinator = SessionCoordinator::new(Box::new(ports));
    add_mock(&mut coordinator, dir.path(), "TMOS 1", DeviceType::Serial, MockScript::default());
    add_mock(&mut coordinator, dir.path(), "TMOS 2", DeviceType::Serial, MockScript::default());
    add_mock(&mut coordinator, dir.path(), "Vicon", DeviceType::MotionCapture, MockScript::default());

    coordinator.connect("TMOS 1", "/dev/ttyUSB0").unwrap();
    wait_for(&mut coordinator, "TMOS 1", Response::Connected(true)).await;

    let found = coordinator.refresh_ports().unwrap();
    assert_eq!(found, vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    assert!(coordinator.available_ports("TMOS 1").unwrap().is_empty());
    assert_eq!(
        coordinator.available_ports("TMOS 2").unwrap(),
        ["/dev/ttyUSB0", "/dev/ttyUSB1"]
    );
    assert!(coordinator.available_ports("Vicon").unwrap().is_empty());
    assert!(matches!(
        coordinator.available_ports("TMOS 9"),
        Err(DaqError::UnknownDevice(_))
    ));

    coordinator.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_mode_and_rename() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = SessionCoordinator::new(Box::new(StaticPorts::default()));
    for title in ["TMOS 1", "Vicon"] {
        add_mock(&mut coordinator, dir.path(), title, DeviceType::Mock, MockScript::default());
    }

    coordinator.set_mode(1);
    coordinator.set_mode(4);
    for title in ["TMOS 1", "Vicon"] {
        let seen = wait_for(
            &mut coordinator,
            title,
            Response::ModeChanged {
                ok: false,
                detail: "[4]".into(),
            },
        )
        .await;
        assert!(seen.contains(&(
            title.to_string(),
            Response::ModeChanged {
                ok: true,
                detail: "[1]".into()
            }
        )));
    }

    coordinator.rename_experiment("walk test");
    assert_eq!(coordinator.experiment(), Some("walk test"));
    for (title, file) in [("TMOS 1", "WALK_TEST_TMOS_1.log"), ("Vicon", "WALK_TEST_VICON.log")] {
        let path = dir.path().join(file);
        wait_for(
            &mut coordinator,
            title,
            Response::HandlerChanged {
                ok: true,
                detail: format!("[{}]", path.display()),
            },
        )
        .await;
        assert!(path.exists());
    }

    coordinator.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_per_device_commands_and_unknown_titles() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = SessionCoordinator::new(Box::new(StaticPorts::default()));
    let probe = add_mock(
        &mut coordinator,
        dir.path(),
        "TMOS 1",
        DeviceType::Serial,
        MockScript::default().generating(),
    );

    assert!(matches!(
        coordinator.connect("nope", "/dev/ttyUSB0"),
        Err(DaqError::UnknownDevice(_))
    ));
    assert!(matches!(
        coordinator.set_console_logging("nope", true),
        Err(DaqError::UnknownDevice(_))
    ));

    coordinator.connect("TMOS 1", "/dev/ttyUSB0").unwrap();
    coordinator.set_console_logging("TMOS 1", true).unwrap();
    coordinator.set_sink_forwarding("TMOS 1", false).unwrap();
    coordinator.start_all();
    wait_for(&mut coordinator, "TMOS 1", Response::Started(true)).await;
    let seen = wait_for_match(&mut coordinator, "TMOS 1", |response| {
        matches!(response, Response::LogData(_))
    })
    .await;
    match seen.last() {
        Some((_, Response::LogData(line))) => assert!(line.ends_with(",1")),
        other => panic!("expected a record, got {other:?}"),
    }

    coordinator.disconnect("TMOS 1").unwrap();
    wait_for(&mut coordinator, "TMOS 1", Response::Disconnected(true)).await;
    assert_eq!(
        coordinator.device_state("TMOS 1").unwrap(),
        WorkerState::Disconnected
    );
    assert_eq!(probe.calls().last().map(String::as_str), Some("close"));

    coordinator.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_titles_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = SessionCoordinator::new(Box::new(StaticPorts::default()));
    add_mock(&mut coordinator, dir.path(), "TMOS 1", DeviceType::Serial, MockScript::default());

    let worker = DeviceWorker::new(
        WorkerSettings::new("TMOS 1", "other", dir.path()),
        Box::new(MockInterface::new(DeviceKind::Sensor, MockScript::default())),
        None,
    )
    .unwrap();
    let handle = WorkerHost::spawn(worker).unwrap();
    assert!(matches!(
        coordinator.add_device(DeviceType::Serial, handle),
        Err(DaqError::Configuration(_))
    ));
    assert_eq!(coordinator.titles(), vec!["TMOS 1"]);

    coordinator.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_titles_sharing_a_data_log_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = SessionCoordinator::new(Box::new(StaticPorts::default()));
    add_mock(&mut coordinator, dir.path(), "TMOS 1", DeviceType::Serial, MockScript::default());

    let worker = DeviceWorker::new(
        WorkerSettings::new("tmos_1", "session", dir.path()),
        Box::new(MockInterface::new(DeviceKind::Sensor, MockScript::default())),
        None,
    )
    .unwrap();
    let handle = WorkerHost::spawn(worker).unwrap();
    let err = coordinator.add_device(DeviceType::Serial, handle).unwrap_err();
    assert!(err
        .to_string()
        .contains("Device titles 'TMOS 1' and 'tmos_1' map to the same data log"));
    assert_eq!(coordinator.titles(), vec!["TMOS 1"]);

    coordinator.shutdown(TIMEOUT).await.unwrap();
}
