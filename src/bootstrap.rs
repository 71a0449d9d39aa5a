//! Directory bootstrap for the daemon.
//!
//! The daemon first tries to attach to a directory already listening on its port.
//! When none answers it creates one in-process. Either way the control endpoint is
//! published under [`SERVICE_NAME`](crate::constants::SERVICE_NAME). Any failure
//! here is fatal to the daemon.
use std::net::SocketAddr;

use strum::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{
    directory::{DirectoryClient, DirectoryError, DirectoryServer},
    error::BootstrapError,
};

/// The two bootstrap states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BootstrapState {
    /// Bind into a directory that some other process already serves.
    Attach,
    /// Serve a fresh directory from this process and bind into it.
    Create,
}

/// A successful publication of the control endpoint.
#[derive(Debug)]
pub enum Publication {
    Attached {
        directory: DirectoryClient,
        name: String,
    },
    Created {
        directory: DirectoryServer,
        name: String,
    },
}

impl Publication {
    /// How the publication was obtained.
    pub fn state(&self) -> BootstrapState {
        match self {
            Publication::Attached { .. } => BootstrapState::Attach,
            Publication::Created { .. } => BootstrapState::Create,
        }
    }

    /// Address of the directory holding the binding.
    pub fn directory_addr(&self) -> SocketAddr {
        match self {
            Publication::Attached { directory, .. } => directory.addr(),
            Publication::Created { directory, .. } => directory.local_addr(),
        }
    }

    /// Removes the binding. A directory created by this process stops with it.
    pub fn withdraw(self) {
        match self {
            Publication::Attached { directory, name } => {
                if let Err(err) = directory.unbind(&name) {
                    warn!("Failed to unbind '{name}' from {}: {err}", directory.addr());
                }
            }
            Publication::Created { mut directory, .. } => directory.shutdown(),
        }
    }
}

/// Publishes `endpoint` as `name` in the directory on `port`, creating the
/// directory if none is reachable.
pub fn publish(
    port: u16,
    name: &str,
    endpoint: SocketAddr,
) -> Result<Publication, BootstrapError> {
    debug!("Bootstrap state: {}", BootstrapState::Attach);
    let client = DirectoryClient::new(port);
    match client.bind(name, endpoint) {
        Ok(()) => {
            info!("Connected to the directory on port {port}");
            return Ok(Publication::Attached {
                directory: client,
                name: name.to_string(),
            });
        }
        Err(DirectoryError::AlreadyBound(_)) => {
            return Err(BootstrapError::AlreadyBound {
                name: name.to_string(),
                port,
            });
        }
        Err(err) => {
            debug!("Could not attach to a directory on port {port} ({err}), attempting to create our own");
        }
    }

    debug!("Bootstrap state: {}", BootstrapState::Create);
    // The name is in place before the directory accepts its first connection, so a
    // daemon attaching concurrently is refused instead of taking the name.
    let directory = DirectoryServer::spawn_with(port, name, endpoint)
        .map_err(|source| BootstrapError::Create { port, source })?;

    info!(
        "Connected to the self-made directory on {}",
        directory.local_addr()
    );
    Ok(Publication::Created {
        directory,
        name: name.to_string(),
    })
}

/// Unbinds `name` from the directory on `port` if it still points at `endpoint`.
///
/// Used where the [`Publication`] itself is out of reach, such as a signal handler.
/// A binding that already moved to another endpoint is left alone.
pub fn retract(port: u16, name: &str, endpoint: SocketAddr) -> Result<bool, DirectoryError> {
    let client = DirectoryClient::new(port);
    match client.lookup(name) {
        Ok(bound) if bound == endpoint => {
            client.unbind(name)?;
            Ok(true)
        }
        Ok(_) | Err(DirectoryError::NotBound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}
