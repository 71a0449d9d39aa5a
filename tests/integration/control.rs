#[path = "common/mod.rs"]
mod common;

use std::{
    io,
    net::TcpStream,
    path::Path,
    process,
    sync::Mutex,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use carpool::{
    bootstrap::BootstrapState,
    connector::{Connector, DaemonSpawner, LaunchArgs},
    ipc::{ControlError, StopOutcome},
    logs::application_log_path,
    service::DaemonIdentity,
    supervisor::{Supervisor, SupervisorError},
};
use common::{argv, free_port, is_process_alive, wait_for_content, wait_for_process_exit};
use tempfile::tempdir;

fn spawn_supervisor(port: u16, log_dir: &Path) -> JoinHandle<Result<(), SupervisorError>> {
    let mut supervisor = Supervisor::bootstrap(DaemonIdentity::current(log_dir.to_path_buf(), port), true)
        .expect("supervisor failed to bootstrap");
    thread::spawn(move || supervisor.run())
}

/// Boots an in-process supervisor instead of re-executing a binary.
#[derive(Default)]
struct InProcessSpawner {
    handle: Mutex<Option<JoinHandle<Result<(), SupervisorError>>>>,
}

impl DaemonSpawner for InProcessSpawner {
    fn spawn(&self, launch: &LaunchArgs) -> io::Result<u32> {
        let handle = spawn_supervisor(launch.port, &launch.log_dir);
        *self.handle.lock().expect("spawner lock poisoned") = Some(handle);
        Ok(process::id())
    }
}

#[test]
fn bootstrap_creates_the_directory_and_publishes_the_endpoint() {
    let dir = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let mut supervisor =
        Supervisor::bootstrap(DaemonIdentity::current(dir.path().to_path_buf(), port), false)
            .expect("supervisor failed to bootstrap");

    let publication = supervisor.publication().expect("supervisor is not published");
    assert_eq!(publication.state(), BootstrapState::Create);
    assert_eq!(publication.directory_addr().port(), port);
    assert_eq!(supervisor.service().identity().port, port);
    assert_eq!(supervisor.registry().log_dir(), dir.path());
    assert!(!supervisor.registry().capture_output());

    let endpoint = supervisor.endpoint().expect("no control endpoint");
    let located = Connector::new(port).locate().expect("locate failed");
    assert_eq!(located.endpoint(), endpoint);

    supervisor.shutdown();
    assert!(supervisor.publication().is_none());
    assert!(Connector::new(port).locate().unwrap_err().is_offline());
}

#[test]
fn applications_are_managed_through_the_control_service() {
    let dir = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let handle = spawn_supervisor(port, dir.path());

    let (client, status) = Connector::new(port).connect().expect("connect failed");
    assert!(status.online);
    assert_eq!(status.pid, process::id());

    let pid = client
        .add_application(argv(&["sleep", "5"]))
        .expect("add failed");
    let listed = client.list_applications().expect("list failed");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid, pid);
    assert_eq!(listed[0].command, "sleep 5");
    assert!(listed[0].is_running);

    client.remove_application(pid).expect("remove failed");
    wait_for_process_exit(pid);
    assert!(client.list_applications().expect("list failed").is_empty());
    assert!(matches!(
        client.remove_application(pid),
        Err(ControlError::ApplicationNotFound(missing)) if missing == pid
    ));

    let outcome = client.stop().expect("stop failed");
    assert!(matches!(outcome, StopOutcome::Acknowledged | StopOutcome::Severed));
    handle
        .join()
        .expect("supervisor thread panicked")
        .expect("supervisor failed");
}

#[test]
fn idle_connection_does_not_stall_other_clients() {
    let dir = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let handle = spawn_supervisor(port, dir.path());
    let (client, _) = Connector::new(port).connect().expect("connect failed");

    let _idle = TcpStream::connect(client.endpoint()).expect("idle connect failed");
    let started = Instant::now();
    let status = client.status().expect("status failed");
    assert!(status.online);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "status took {:?} behind an idle connection",
        started.elapsed()
    );

    client.stop().expect("stop failed");
    handle.join().expect("supervisor thread panicked").expect("supervisor failed");
}

#[test]
fn failed_launch_is_reported_to_the_client() {
    let dir = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let handle = spawn_supervisor(port, dir.path());
    let (client, _) = Connector::new(port).connect().expect("connect failed");

    let err = client
        .add_application(argv(&["/definitely/not/a/binary"]))
        .unwrap_err();
    assert!(matches!(err, ControlError::Spawn(_)));
    assert!(client.list_applications().expect("list failed").is_empty());

    client.stop().expect("stop failed");
    handle.join().expect("supervisor thread panicked").expect("supervisor failed");
}

#[test]
fn stop_terminates_every_application_and_the_supervisor() {
    let dir = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let handle = spawn_supervisor(port, dir.path());
    let connector = Connector::new(port);
    let (client, _) = connector.connect().expect("connect failed");

    let first = client
        .add_application(argv(&["sleep", "30"]))
        .expect("first add failed");
    let second = client
        .add_application(argv(&["sh", "-c", "echo started; sleep 30"]))
        .expect("second add failed");
    assert!(is_process_alive(first));
    assert!(is_process_alive(second));
    wait_for_content(&application_log_path(dir.path(), second), "started");

    client.stop().expect("stop failed");
    handle.join().expect("supervisor thread panicked").expect("supervisor failed");

    wait_for_process_exit(first);
    wait_for_process_exit(second);

    let err = connector.connect().unwrap_err();
    assert!(err.is_offline(), "expected offline error, got {err:?}");
    assert!(connector.probe().is_none());
}

#[test]
fn second_supervisor_on_the_same_port_is_refused() {
    let dir = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let handle = spawn_supervisor(port, dir.path());

    let err = Supervisor::bootstrap(DaemonIdentity::current(dir.path().to_path_buf(), port), true)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Bootstrap(_)));

    let (client, _) = Connector::new(port).connect().expect("first supervisor went away");
    client.stop().expect("stop failed");
    handle.join().expect("supervisor thread panicked").expect("supervisor failed");
}

#[test]
fn connect_or_start_boots_a_missing_supervisor() {
    let dir = tempdir().expect("failed to create tempdir");
    let port = free_port();
    let connector = Connector::new(port).with_startup_wait(Duration::from_millis(200));
    let spawner = InProcessSpawner::default();
    let launch = LaunchArgs {
        log_level: "info".into(),
        port,
        log_dir: dir.path().to_path_buf(),
        capture_output: true,
    };

    let (client, status) = connector
        .connect_or_start(&spawner, &launch)
        .expect("connect_or_start failed");
    assert!(status.online);

    // A second call finds the running supervisor without spawning again.
    let (again, _) = connector
        .connect_or_start(&spawner, &launch)
        .expect("second connect_or_start failed");
    assert_eq!(again.endpoint(), client.endpoint());

    client.stop().expect("stop failed");
    let handle = spawner
        .handle
        .lock()
        .expect("spawner lock poisoned")
        .take()
        .expect("spawner was never called");
    handle.join().expect("supervisor thread panicked").expect("supervisor failed");
}
