#[path = "common/mod.rs"]
mod common;

use std::{collections::HashSet, sync::Arc, thread};

use carpool::{error::RegistryError, logs::application_log_path, registry::ProcessRegistry};
use common::{argv, is_process_alive, wait_for_content, wait_for_process_exit, wait_until};
use tempfile::tempdir;

#[test]
fn added_application_is_listed_as_running() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), true);

    let pid = registry.add(&argv(&["sleep", "5"])).expect("add failed");
    let listed = registry.list().expect("list failed");

    assert_eq!(listed.len(), 1);
    let info = &listed[0];
    assert_eq!(info.pid, pid);
    assert_eq!(info.command, "sleep 5");
    assert!(info.is_running);
    assert_eq!(info.exit_code, None);
    assert_eq!(
        info.log_file.as_deref(),
        Some(application_log_path(dir.path(), pid).as_path())
    );
    assert!(is_process_alive(pid));

    assert_eq!(registry.stop_all(), 1);
}

#[test]
fn removed_application_is_gone_from_the_os() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), true);

    let pid = registry.add(&argv(&["sleep", "30"])).expect("add failed");
    assert!(is_process_alive(pid));

    registry.remove(pid).expect("remove failed");
    wait_for_process_exit(pid);
    assert!(registry.list().expect("list failed").is_empty());

    assert!(matches!(
        registry.remove(pid),
        Err(RegistryError::ApplicationNotFound(missing)) if missing == pid
    ));
}

#[test]
fn removing_an_unknown_pid_fails_every_time() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), true);

    for _ in 0..2 {
        assert!(matches!(
            registry.remove(999_999),
            Err(RegistryError::ApplicationNotFound(999_999))
        ));
    }
}

#[test]
fn finished_application_stays_listed_until_removed() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), false);

    let pid = registry.add(&argv(&["sh", "-c", "exit 3"])).expect("add failed");
    wait_until("application to finish", || {
        registry
            .list()
            .expect("list failed")
            .iter()
            .any(|info| info.pid == pid && !info.is_running)
    });

    let listed = registry.list().expect("list failed");
    assert_eq!(listed[0].exit_code, Some(3));

    registry.remove(pid).expect("remove of finished application failed");
    assert!(registry.is_empty());
}

#[test]
fn stop_all_kills_everything() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), true);

    let pids: Vec<u32> = (0..3)
        .map(|_| registry.add(&argv(&["sleep", "30"])).expect("add failed"))
        .collect();

    assert_eq!(registry.stop_all(), 3);
    assert!(registry.is_empty());
    for pid in pids {
        wait_for_process_exit(pid);
    }

    assert_eq!(registry.stop_all(), 0);
}

#[test]
fn dropping_the_registry_stops_its_applications() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), false);
    let pid = registry.add(&argv(&["sleep", "30"])).expect("add failed");

    drop(registry);
    wait_for_process_exit(pid);
}

#[test]
fn parallel_adds_get_unique_pids() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = Arc::new(ProcessRegistry::new(dir.path(), true));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.add(&argv(&["sleep", "5"])).expect("add failed"))
        })
        .collect();
    let pids: HashSet<u32> = handles
        .into_iter()
        .map(|handle| handle.join().expect("add thread panicked"))
        .collect();

    assert_eq!(pids.len(), 8);
    assert_eq!(registry.len(), 8);
    let listed: HashSet<u32> = registry
        .list()
        .expect("list failed")
        .into_iter()
        .map(|info| info.pid)
        .collect();
    assert_eq!(listed, pids);

    assert_eq!(registry.stop_all(), 8);
}

#[test]
fn stdout_is_captured_per_pid() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), true);

    let pid = registry
        .add(&argv(&["sh", "-c", "echo hello; echo world"]))
        .expect("add failed");
    let path = registry.log_path(pid);
    assert_eq!(path, application_log_path(dir.path(), pid));
    assert!(path.ends_with(format!("{pid}_log.txt")));

    let content = wait_for_content(&path, "world");
    assert_eq!(content, "hello\nworld\n");

    registry.remove(pid).expect("remove failed");
}

#[test]
fn capture_can_be_disabled() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), false);
    assert!(!registry.capture_output());

    let pid = registry.add(&argv(&["sh", "-c", "echo quiet"])).expect("add failed");
    registry.remove(pid).expect("remove failed");

    assert!(!application_log_path(dir.path(), pid).exists());
}

#[test]
fn removal_reaches_descendants_of_a_finished_leader() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), true);

    let pid = registry
        .add(&argv(&["sh", "-c", "sleep 30 & echo $!"]))
        .expect("add failed");
    let content = wait_for_content(&registry.log_path(pid), "\n");
    let orphan: u32 = content.trim().parse().expect("background pid not printed");

    wait_until("leader to finish", || {
        registry
            .list()
            .expect("list failed")
            .iter()
            .any(|info| info.pid == pid && !info.is_running)
    });
    assert!(is_process_alive(orphan));

    registry.remove(pid).expect("remove failed");
    wait_for_process_exit(orphan);
}

#[test]
fn spawn_failure_names_the_full_command_line() {
    let dir = tempdir().expect("failed to create tempdir");
    let registry = ProcessRegistry::new(dir.path(), true);

    let err = registry
        .add(&argv(&["/definitely/not/a/binary", "-v", "input"]))
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("'/definitely/not/a/binary -v input'"),
        "unexpected error: {err}"
    );
}
