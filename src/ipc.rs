//! Wire protocol between the command-line client and the resident supervisor.
//!
//! Every connection carries exactly one newline-terminated JSON request followed by
//! one newline-terminated JSON response. The same framing is used by the directory.
use std::{
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::debug;

/// Liveness report returned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub online: bool,
    pub pid: u32,
}

/// One tracked application as reported by `ListApplications`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub pid: u32,
    /// Space-joined argv.
    pub command: String,
    /// Polled from the OS when the listing was produced.
    pub is_running: bool,
    /// Capture file, absent when output capture is disabled.
    pub log_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    /// Exit code once the application has exited normally.
    pub exit_code: Option<i32>,
}

/// Message sent from CLI invocations to the resident supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    Status,
    Stop,
    ListApplications,
    AddApplication { command: Vec<String> },
    RemoveApplication { pid: u32 },
}

/// Response sent by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Status(StatusResult),
    /// Written right before the supervisor exits.
    Stopping,
    Applications(Vec<ApplicationInfo>),
    Added { pid: u32 },
    Removed,
    Error(RemoteError),
}

/// Failures the supervisor reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RemoteError {
    #[error("no such application with PID {pid}")]
    ApplicationNotFound { pid: u32 },
    #[error("{message}")]
    Spawn { message: String },
    #[error("{message}")]
    Internal { message: String },
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("supervisor is unreachable: {0}")]
    Unreachable(#[source] io::Error),
    #[error("'{0}' is not bound in the directory")]
    NotBound(String),
    #[error("control connection I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed before a response arrived")]
    Severed,
    #[error("no such application with PID {0}")]
    ApplicationNotFound(u32),
    #[error("failed to start application: {0}")]
    Spawn(String),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("failed to launch supervisor: {0}")]
    Launch(#[source] io::Error),
}

impl ControlError {
    /// Whether the error means no supervisor is answering.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            ControlError::Unreachable(_) | ControlError::NotBound(_) | ControlError::Severed
        )
    }
}

impl From<RemoteError> for ControlError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::ApplicationNotFound { pid } => ControlError::ApplicationNotFound(pid),
            RemoteError::Spawn { message } => ControlError::Spawn(message),
            RemoteError::Internal { message } => ControlError::Server(message),
        }
    }
}

/// How a successful `stop` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The supervisor acknowledged before exiting.
    Acknowledged,
    /// The connection dropped while the supervisor was exiting. Still a success.
    Severed,
}

/// Writes one message followed by a newline.
pub fn write_message<T: Serialize>(stream: &mut TcpStream, message: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Reads one newline-terminated message. `Ok(None)` means the peer closed the
/// connection without sending anything.
pub fn read_message<T: DeserializeOwned>(stream: &mut TcpStream) -> io::Result<Option<T>> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str(trimmed)?))
}

/// Client stub for the control service published at `endpoint`.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorClient {
    endpoint: SocketAddr,
}

impl SupervisorClient {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Sends a request and waits for the response. Remote errors are mapped to
    /// their [`ControlError`] counterparts.
    pub fn call(&self, request: &ControlRequest) -> Result<ControlResponse, ControlError> {
        let mut stream = TcpStream::connect(self.endpoint).map_err(ControlError::Unreachable)?;
        debug!("Sending {:?} to {}", request, self.endpoint);
        write_message(&mut stream, request)?;

        match read_message::<ControlResponse>(&mut stream)? {
            None => Err(ControlError::Severed),
            Some(ControlResponse::Error(err)) => Err(err.into()),
            Some(response) => Ok(response),
        }
    }

    pub fn status(&self) -> Result<StatusResult, ControlError> {
        match self.call(&ControlRequest::Status)? {
            ControlResponse::Status(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    /// Asks the supervisor to stop every application and exit.
    ///
    /// A connection that drops mid-call is the expected consequence of the
    /// supervisor exiting and is reported as [`StopOutcome::Severed`].
    pub fn stop(&self) -> Result<StopOutcome, ControlError> {
        match self.call(&ControlRequest::Stop) {
            Ok(ControlResponse::Stopping) => Ok(StopOutcome::Acknowledged),
            Ok(other) => Err(unexpected(&other)),
            Err(ControlError::Severed) => Ok(StopOutcome::Severed),
            Err(ControlError::Io(err)) if is_disconnect(&err) => Ok(StopOutcome::Severed),
            Err(err) => Err(err),
        }
    }

    pub fn list_applications(&self) -> Result<Vec<ApplicationInfo>, ControlError> {
        match self.call(&ControlRequest::ListApplications)? {
            ControlResponse::Applications(applications) => Ok(applications),
            other => Err(unexpected(&other)),
        }
    }

    pub fn add_application(&self, command: Vec<String>) -> Result<u32, ControlError> {
        match self.call(&ControlRequest::AddApplication { command })? {
            ControlResponse::Added { pid } => Ok(pid),
            other => Err(unexpected(&other)),
        }
    }

    pub fn remove_application(&self, pid: u32) -> Result<(), ControlError> {
        match self.call(&ControlRequest::RemoveApplication { pid })? {
            ControlResponse::Removed => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &ControlResponse) -> ControlError {
    ControlError::Protocol(format!("{response:?}"))
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
