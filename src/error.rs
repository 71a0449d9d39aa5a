//! Error handling for carpool.
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the process registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An application was requested with an empty argument vector.
    #[error("Cannot start an application without a command")]
    EmptyCommand,

    /// The OS refused to launch the command.
    #[error("Failed to start application '{command}': {source}")]
    Spawn {
        /// The space-joined command that failed to start.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The application started but its capture file could not be created.
    #[error("Failed to capture output of PID {pid} into {path:?}: {source}")]
    LogCapture {
        /// The pid of the application that was killed again.
        pid: u32,
        /// The capture file that could not be created.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// No application is tracked under the given pid.
    #[error("No such application with PID {0}")]
    ApplicationNotFound(u32),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisoned(String),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `RegistryError`.
impl<T> From<std::sync::PoisonError<T>> for RegistryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RegistryError::MutexPoisoned(err.to_string())
    }
}

/// Errors that abort the directory bootstrap. Every variant is fatal to the daemon.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Another live daemon already holds the service name.
    #[error("'{name}' is already bound in the directory on port {port}")]
    AlreadyBound {
        /// The published name.
        name: String,
        /// The directory port.
        port: u16,
    },

    /// No directory was reachable and creating one failed.
    #[error("Could not create a directory on port {port}: {source}")]
    Create {
        /// The directory port.
        port: u16,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while loading the settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference names an unset variable.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
}
