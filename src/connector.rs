//! Client-side discovery of the supervisor, with optional daemon startup.
use std::{
    io,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use tracing::{debug, info};

use crate::{
    constants::{DEFAULT_STARTUP_WAIT_MS, SERVICE_NAME},
    directory::{DirectoryClient, DirectoryError},
    ipc::{ControlError, StatusResult, SupervisorClient},
};

/// Arguments handed to a newly spawned daemon, in positional order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub log_level: String,
    pub port: u16,
    pub log_dir: PathBuf,
    pub capture_output: bool,
}

/// Starts a new daemon process.
pub trait DaemonSpawner {
    /// Launches the daemon and returns its pid without waiting for it to be ready.
    fn spawn(&self, launch: &LaunchArgs) -> io::Result<u32>;
}

/// Re-executes a carpool binary as `supervise <level> <port> <log_dir>`.
#[derive(Debug, Clone)]
pub struct ExecutableSpawner {
    program: PathBuf,
}

impl ExecutableSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Spawner for the binary that is currently running.
    pub fn current() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl DaemonSpawner for ExecutableSpawner {
    fn spawn(&self, launch: &LaunchArgs) -> io::Result<u32> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("supervise")
            .arg(&launch.log_level)
            .arg(launch.port.to_string())
            .arg(&launch.log_dir);
        if !launch.capture_output {
            cmd.arg("--no-capture");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Detach from the client's session so the daemon outlives it.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!("Executing command: {cmd:?}");
        let child = cmd.spawn()?;
        Ok(child.id())
    }
}

/// Locates the control service through the directory on a port.
#[derive(Debug, Clone, Copy)]
pub struct Connector {
    port: u16,
    startup_wait: Duration,
}

impl Connector {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            startup_wait: Duration::from_millis(DEFAULT_STARTUP_WAIT_MS),
        }
    }

    /// Overrides the fixed wait between spawning a daemon and the retry.
    pub fn with_startup_wait(mut self, startup_wait: Duration) -> Self {
        self.startup_wait = startup_wait;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the published endpoint without contacting the supervisor.
    pub fn locate(&self) -> Result<SupervisorClient, ControlError> {
        match DirectoryClient::new(self.port).lookup(SERVICE_NAME) {
            Ok(endpoint) => Ok(SupervisorClient::new(endpoint)),
            Err(DirectoryError::NotBound(name)) => Err(ControlError::NotBound(name)),
            Err(DirectoryError::Unreachable { source, .. }) => Err(ControlError::Unreachable(source)),
            Err(err) => Err(ControlError::Unreachable(io::Error::other(err))),
        }
    }

    /// Resolves the supervisor and checks it answers `status`.
    pub fn connect(&self) -> Result<(SupervisorClient, StatusResult), ControlError> {
        let client = self.locate()?;
        let status = client.status()?;
        Ok((client, status))
    }

    /// Returns the supervisor's status, or `None` when it is offline.
    pub fn probe(&self) -> Option<StatusResult> {
        match self.connect() {
            Ok((_, status)) => Some(status),
            Err(err) => {
                debug!(
                    "Encountered an error while checking the supervisor's status -- is the supervisor alive? {err}"
                );
                None
            }
        }
    }

    /// Spawns a daemon, waits the fixed startup delay and connects once.
    ///
    /// There is no readiness polling: a daemon slower than the startup wait is
    /// reported as unreachable.
    pub fn start(
        &self,
        spawner: &dyn DaemonSpawner,
        launch: &LaunchArgs,
    ) -> Result<(SupervisorClient, StatusResult), ControlError> {
        info!("Attempting to start supervisor daemon...");
        let pid = spawner.spawn(launch).map_err(ControlError::Launch)?;
        info!("Supervisor daemon started - PID {pid}.");

        thread::sleep(self.startup_wait);
        self.connect()
    }

    /// Connects, spawning a daemon and retrying once if the supervisor is offline.
    pub fn connect_or_start(
        &self,
        spawner: &dyn DaemonSpawner,
        launch: &LaunchArgs,
    ) -> Result<(SupervisorClient, StatusResult), ControlError> {
        match self.connect() {
            Ok(connected) => Ok(connected),
            Err(err) if err.is_offline() => {
                debug!("Supervisor offline ({err}); starting a new one");
                self.start(spawner, launch)
            }
            Err(err) => Err(err),
        }
    }
}
