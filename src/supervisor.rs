use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    bootstrap::{self, Publication},
    constants::{LOCALHOST, REQUEST_READ_TIMEOUT, SERVICE_NAME},
    error::{BootstrapError, RegistryError},
    ipc::{ControlRequest, ControlResponse, RemoteError, read_message, write_message},
    registry::ProcessRegistry,
    service::{ControlService, DaemonIdentity},
};

/// Errors emitted by the resident supervisor runtime.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Long-lived daemon that owns the registry and answers control requests.
#[derive(Debug)]
pub struct Supervisor {
    service: ControlService,
    registry: Arc<ProcessRegistry>,
    listener: TcpListener,
    publication: Option<Publication>,
}

impl Supervisor {
    /// Opens the control listener and publishes it through the directory on
    /// `identity.port`. Nothing is left running when this fails.
    pub fn bootstrap(
        identity: DaemonIdentity,
        capture_output: bool,
    ) -> Result<Self, SupervisorError> {
        info!("Starting supervisor daemon -- PID {}", identity.pid);

        let listener = TcpListener::bind(SocketAddr::from((LOCALHOST, 0)))?;
        let endpoint = listener.local_addr()?;
        let publication = bootstrap::publish(identity.port, SERVICE_NAME, endpoint)?;

        let registry = Arc::new(ProcessRegistry::new(
            identity.log_dir.clone(),
            capture_output,
        ));
        let service = ControlService::new(identity, Arc::clone(&registry));

        info!(
            "Supervisor daemon started ({} directory {})",
            publication.state(),
            publication.directory_addr()
        );
        Ok(Self {
            service,
            registry,
            listener,
            publication: Some(publication),
        })
    }

    /// Shared handle to the registry, e.g. for a termination handler.
    pub fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn service(&self) -> &ControlService {
        &self.service
    }

    /// Address the control service is listening on.
    pub fn endpoint(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn publication(&self) -> Option<&Publication> {
        self.publication.as_ref()
    }

    /// Serves control requests until a `Stop` arrives.
    ///
    /// Every connection is handled on its own thread, so a peer that never sends
    /// its request only holds up itself.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        let endpoint = self.endpoint()?;
        info!("carpool supervisor listening on {endpoint}");
        let stopping = Arc::new(AtomicBool::new(false));

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!("Control connection from {peer}");
                    let service = self.service.clone();
                    let stopping = Arc::clone(&stopping);
                    let spawned = thread::Builder::new()
                        .name("carpool-control".into())
                        .spawn(move || {
                            if serve_connection(&service, stream) {
                                stopping.store(true, Ordering::SeqCst);
                                // Wake the blocking accept.
                                let _ = TcpStream::connect(endpoint);
                            }
                        });
                    if let Err(err) = spawned {
                        warn!("Failed to spawn control handler: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Supervisor listener error: {err}");
                    self.shutdown();
                    return Err(err.into());
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stops every application and withdraws the publication. Idempotent.
    pub fn shutdown(&mut self) {
        self.registry.stop_all();
        if let Some(publication) = self.publication.take() {
            publication.withdraw();
            info!("Supervisor daemon stopped");
        }
    }
}

/// Handles one request. Returns `true` once a stop was served.
fn serve_connection(service: &ControlService, mut stream: TcpStream) -> bool {
    if let Err(err) = stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT)) {
        warn!("Failed to set read timeout on control connection: {err}");
    }

    match read_message::<ControlRequest>(&mut stream) {
        Ok(Some(request)) => {
            let stop_requested = matches!(request, ControlRequest::Stop);
            let response = service.handle(request);
            if let Err(err) = write_message(&mut stream, &response) {
                debug!("Failed to deliver control response: {err}");
            }
            stop_requested
        }
        Ok(None) => false,
        Err(err) => {
            warn!("Invalid supervisor command: {err}");
            let response = ControlResponse::Error(RemoteError::Internal {
                message: err.to_string(),
            });
            let _ = write_message(&mut stream, &response);
            false
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
