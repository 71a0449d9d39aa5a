//! Registry of the applications launched and tracked by the supervisor.
use std::{
    collections::HashMap,
    io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::RegistryError,
    ipc::ApplicationInfo,
    logs::{LogPipe, application_log_path},
};

/// One application spawned and tracked by the registry.
#[derive(Debug)]
pub struct ProcessEntry {
    /// OS pid, also the registry key.
    pub pid: u32,
    /// Space-joined argv, for display only.
    pub command: String,
    /// Owned handle to the running process.
    pub child: Child,
    /// Background copy of the application's stdout, when capture is enabled.
    pub log: Option<LogPipe>,
    /// When the application was spawned.
    pub started_at: DateTime<Utc>,
}

/// In-memory map of pid to [`ProcessEntry`].
///
/// All access goes through a single mutex, so `add`, `remove`, `list` and `stop_all`
/// are mutually exclusive. `add` holds the lock across spawn and insert, which keeps
/// concurrent adds from racing on keys.
#[derive(Debug)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<u32, ProcessEntry>>,
    log_dir: PathBuf,
    capture_output: bool,
}

impl ProcessRegistry {
    /// Creates an empty registry writing capture files into `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>, capture_output: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            log_dir: log_dir.into(),
            capture_output,
        }
    }

    /// Directory holding the `<pid>_log.txt` capture files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Whether new applications get their stdout captured.
    pub fn capture_output(&self) -> bool {
        self.capture_output
    }

    /// Capture file an application with `pid` writes to when capture is enabled.
    pub fn log_path(&self, pid: u32) -> PathBuf {
        application_log_path(&self.log_dir, pid)
    }

    /// Spawns `command` and starts tracking it. Returns the new pid.
    pub fn add(&self, command: &[String]) -> Result<u32, RegistryError> {
        let (program, args) = command.split_first().ok_or(RegistryError::EmptyCommand)?;
        let command_line = command.join(" ");

        let mut entries = self.entries.lock()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .stdout(if self.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        // Own process group so removal can signal the whole tree.
        unsafe {
            cmd.pre_exec(isolate_process_group);
        }

        debug!("Executing command: {cmd:?}");

        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to start application '{command_line}': {source}");
            RegistryError::Spawn {
                command: command_line.clone(),
                source,
            }
        })?;
        let pid = child.id();

        let log = match child.stdout.take() {
            Some(stdout) => match LogPipe::spawn(pid, stdout, &self.log_dir) {
                Ok(pipe) => Some(pipe),
                Err(source) => {
                    let path = self.log_path(pid);
                    error!("Failed to create capture file {:?} for PID {pid}: {source}", path);
                    kill_process_group(pid);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RegistryError::LogCapture { pid, path, source });
                }
            },
            None => None,
        };

        let entry = ProcessEntry {
            pid,
            command: command_line,
            child,
            log,
            started_at: Utc::now(),
        };

        info!("Started application '{}' with PID {pid}", entry.command);

        // A present key can only belong to an entry that was already reaped. Its
        // pid now names the new application's group, so it must not be signalled.
        if let Some(stale) = entries.insert(pid, entry) {
            warn!(
                "PID {pid} was reused; discarding stale entry for '{}'",
                stale.command
            );
            release_log(stale);
        }

        Ok(pid)
    }

    /// Kills the application tracked as `pid` and forgets it.
    ///
    /// Not idempotent: removing the same pid twice fails with
    /// [`RegistryError::ApplicationNotFound`].
    pub fn remove(&self, pid: u32) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .lock()?
            .remove(&pid)
            .ok_or(RegistryError::ApplicationNotFound(pid))?;

        info!("Removing application {pid} ('{}')", entry.command);
        terminate(entry);
        Ok(())
    }

    /// Lists every tracked application, polling liveness from the OS.
    pub fn list(&self) -> Result<Vec<ApplicationInfo>, RegistryError> {
        let mut entries = self.entries.lock()?;
        let mut infos: Vec<_> = entries.values_mut().map(describe).collect();
        infos.sort_by_key(|info| info.pid);
        Ok(infos)
    }

    /// Kills every tracked application and empties the registry.
    ///
    /// Best effort: failures are logged and the remaining entries are still
    /// processed. Returns the number of entries that were tracked.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<ProcessEntry> = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        if count > 0 {
            info!("Stopping {count} application(s)");
        }
        for entry in drained {
            terminate(entry);
        }
        count
    }

    /// Whether `pid` is currently tracked.
    pub fn contains(&self, pid: u32) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(&pid))
            .unwrap_or(false)
    }

    /// Number of tracked applications.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether no application is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn isolate_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn kill_process_group(pid: u32) {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!("Failed to signal process group {pid}: {err}"),
    }
}

fn describe(entry: &mut ProcessEntry) -> ApplicationInfo {
    let (is_running, exit_code) = match entry.child.try_wait() {
        Ok(None) => (true, None),
        Ok(Some(status)) => (false, status.code()),
        Err(err) => {
            warn!("Failed to poll application {}: {err}", entry.pid);
            (false, None)
        }
    };

    ApplicationInfo {
        pid: entry.pid,
        command: entry.command.clone(),
        is_running,
        log_file: entry.log.as_ref().map(|pipe| pipe.path().to_path_buf()),
        started_at: entry.started_at,
        exit_code,
    }
}

/// Kills and reaps the process, then cancels its log pipe.
fn terminate(mut entry: ProcessEntry) {
    let pid = entry.pid;

    match entry.child.try_wait() {
        Ok(Some(status)) => {
            debug!("Application {pid} had already exited ({status})");
            // Descendants may outlive the leader; the group id stays reserved while
            // any member remains.
            kill_process_group(pid);
        }
        Ok(None) => {
            kill_process_group(pid);
            if let Err(err) = entry.child.kill() {
                warn!("Failed to kill application {pid}: {err}");
            }
            match entry.child.wait() {
                Ok(status) => info!("Application {pid} terminated ({status})"),
                Err(err) => warn!("Failed to reap application {pid}: {err}"),
            }
        }
        Err(err) => warn!("Failed to poll application {pid}: {err}"),
    }

    release_log(entry);
}

fn release_log(mut entry: ProcessEntry) {
    let pid = entry.pid;
    if let Some(pipe) = entry.log.take() {
        match pipe.cancel_and_join() {
            Ok(bytes) => debug!("Log capture for {pid} finished with {bytes} bytes"),
            Err(err) => warn!("Log capture for {pid} failed: {err}"),
        }
    }
}
