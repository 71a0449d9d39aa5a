//! The control service: the operations a client can invoke on the supervisor.
use std::{path::PathBuf, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    error::RegistryError,
    ipc::{ApplicationInfo, ControlRequest, ControlResponse, RemoteError, StatusResult},
    registry::ProcessRegistry,
};

/// Fixed facts about the running daemon, set once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonIdentity {
    pub pid: u32,
    pub log_dir: PathBuf,
    pub port: u16,
}

impl DaemonIdentity {
    /// Identity of the current process.
    pub fn current(log_dir: PathBuf, port: u16) -> Self {
        Self {
            pid: std::process::id(),
            log_dir,
            port,
        }
    }
}

/// Implements the remotely callable operations by delegating to the registry.
#[derive(Debug, Clone)]
pub struct ControlService {
    identity: DaemonIdentity,
    registry: Arc<ProcessRegistry>,
}

impl ControlService {
    pub fn new(identity: DaemonIdentity, registry: Arc<ProcessRegistry>) -> Self {
        Self { identity, registry }
    }

    pub fn identity(&self) -> &DaemonIdentity {
        &self.identity
    }

    pub fn status(&self) -> StatusResult {
        StatusResult {
            online: true,
            pid: self.identity.pid,
        }
    }

    /// Stops every application. The caller is responsible for exiting afterwards.
    pub fn stop(&self) -> usize {
        info!("Exiting supervisor daemon");
        self.registry.stop_all()
    }

    pub fn list_applications(&self) -> Result<Vec<ApplicationInfo>, RegistryError> {
        self.registry.list()
    }

    pub fn add_application(&self, command: &[String]) -> Result<u32, RegistryError> {
        self.registry.add(command)
    }

    pub fn remove_application(&self, pid: u32) -> Result<(), RegistryError> {
        self.registry.remove(pid)
    }

    /// Dispatches one wire request.
    pub fn handle(&self, request: ControlRequest) -> ControlResponse {
        debug!("Handling {:?}", request);
        match request {
            ControlRequest::Status => ControlResponse::Status(self.status()),
            ControlRequest::Stop => {
                self.stop();
                ControlResponse::Stopping
            }
            ControlRequest::ListApplications => match self.list_applications() {
                Ok(applications) => ControlResponse::Applications(applications),
                Err(err) => ControlResponse::Error(to_remote(err)),
            },
            ControlRequest::AddApplication { command } => match self.add_application(&command) {
                Ok(pid) => ControlResponse::Added { pid },
                Err(err) => ControlResponse::Error(to_remote(err)),
            },
            ControlRequest::RemoveApplication { pid } => match self.remove_application(pid) {
                Ok(()) => ControlResponse::Removed,
                Err(err) => ControlResponse::Error(to_remote(err)),
            },
        }
    }
}

fn to_remote(err: RegistryError) -> RemoteError {
    match err {
        RegistryError::ApplicationNotFound(pid) => {
            warn!("Request for unknown application {pid}");
            RemoteError::ApplicationNotFound { pid }
        }
        err @ (RegistryError::EmptyCommand
        | RegistryError::Spawn { .. }
        | RegistryError::LogCapture { .. }) => RemoteError::Spawn {
            message: err.to_string(),
        },
        err @ RegistryError::MutexPoisoned(_) => RemoteError::Internal {
            message: err.to_string(),
        },
    }
}
