//! Minimal name directory used to publish and discover the control service.
//!
//! The directory listens on a well-known localhost port and maps service names to
//! TCP endpoints. A daemon either attaches to a directory that is already running on
//! its port or hosts one itself; see [`crate::bootstrap`].
use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    constants::{BINDING_PROBE_TIMEOUT, LOCALHOST, REQUEST_READ_TIMEOUT},
    ipc::{read_message, write_message},
};

/// Address of the directory for `port`.
pub fn directory_addr(port: u16) -> SocketAddr {
    SocketAddr::from((LOCALHOST, port))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryRequest {
    Bind { name: String, endpoint: SocketAddr },
    Lookup { name: String },
    Unbind { name: String },
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryResponse {
    Bound,
    Endpoint(SocketAddr),
    Unbound,
    Names(Vec<String>),
    Error(DirectoryFault),
}

/// Refusals sent back by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryFault {
    AlreadyBound { name: String },
    NotBound { name: String },
}

/// Errors raised while talking to a directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no directory reachable at {addr}: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("'{0}' is already bound")]
    AlreadyBound(String),
    #[error("'{0}' is not bound")]
    NotBound(String),
    #[error("directory I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("directory closed the connection without answering")]
    Closed,
    #[error("unexpected directory response: {0}")]
    Protocol(String),
}

impl From<DirectoryFault> for DirectoryError {
    fn from(fault: DirectoryFault) -> Self {
        match fault {
            DirectoryFault::AlreadyBound { name } => DirectoryError::AlreadyBound(name),
            DirectoryFault::NotBound { name } => DirectoryError::NotBound(name),
        }
    }
}

/// Name to endpoint table held by a directory.
#[derive(Debug, Default)]
pub struct Bindings {
    names: Mutex<HashMap<String, SocketAddr>>,
}

impl Bindings {
    /// Binds `name`, refusing if it is held by another endpoint that still accepts
    /// connections. A binding whose endpoint is gone is stale and gets replaced.
    pub fn bind(&self, name: &str, endpoint: SocketAddr) -> Result<(), DirectoryFault> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = names.get(name).copied()
            && existing != endpoint
        {
            if TcpStream::connect_timeout(&existing, BINDING_PROBE_TIMEOUT).is_ok() {
                return Err(DirectoryFault::AlreadyBound {
                    name: name.to_string(),
                });
            }
            warn!("Replacing stale binding for '{name}' ({existing} is not answering)");
        }

        names.insert(name.to_string(), endpoint);
        info!("Bound '{name}' to {endpoint}");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<SocketAddr, DirectoryFault> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .ok_or_else(|| DirectoryFault::NotBound {
                name: name.to_string(),
            })
    }

    pub fn unbind(&self, name: &str) -> Result<(), DirectoryFault> {
        match self
            .names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
        {
            Some(endpoint) => {
                info!("Unbound '{name}' (was {endpoint})");
                Ok(())
            }
            None => Err(DirectoryFault::NotBound {
                name: name.to_string(),
            }),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Dispatches one wire request.
    pub fn handle(&self, request: DirectoryRequest) -> DirectoryResponse {
        let result = match request {
            DirectoryRequest::Bind { name, endpoint } => {
                self.bind(&name, endpoint).map(|()| DirectoryResponse::Bound)
            }
            DirectoryRequest::Lookup { name } => self.lookup(&name).map(DirectoryResponse::Endpoint),
            DirectoryRequest::Unbind { name } => self.unbind(&name).map(|()| DirectoryResponse::Unbound),
            DirectoryRequest::List => Ok(DirectoryResponse::Names(self.names())),
        };
        result.unwrap_or_else(DirectoryResponse::Error)
    }
}

/// A directory served from a background thread of the current process.
#[derive(Debug)]
pub struct DirectoryServer {
    addr: SocketAddr,
    bindings: Arc<Bindings>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DirectoryServer {
    /// Binds the directory port and starts serving. Fails if the port is taken.
    pub fn spawn(port: u16) -> io::Result<Self> {
        Self::serve_on(port, Bindings::default())
    }

    /// Like [`DirectoryServer::spawn`], but `name` is already bound to `endpoint`
    /// when the first request is accepted.
    pub fn spawn_with(port: u16, name: &str, endpoint: SocketAddr) -> io::Result<Self> {
        let bindings = Bindings::default();
        bindings
            .names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), endpoint);
        Self::serve_on(port, bindings)
    }

    fn serve_on(port: u16, bindings: Bindings) -> io::Result<Self> {
        let listener = TcpListener::bind(directory_addr(port))?;
        let addr = listener.local_addr()?;
        let bindings = Arc::new(bindings);
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let bindings = Arc::clone(&bindings);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("carpool-directory".into())
                .spawn(move || serve(listener, bindings, &running))?
        };

        info!("Directory listening on {addr}");
        Ok(Self {
            addr,
            bindings,
            running,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The table served by this directory, for in-process publication.
    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Blocks until the serving thread exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Stops accepting connections and joins the serving thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.running.store(false, Ordering::SeqCst);
            // Wake the blocking accept.
            let _ = TcpStream::connect(self.addr);
            let _ = handle.join();
            debug!("Directory on {} shut down", self.addr);
        }
    }
}

impl Drop for DirectoryServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accepts connections until shut down. Each connection gets its own thread so a
/// silent peer cannot hold up other callers.
fn serve(listener: TcpListener, bindings: Arc<Bindings>, running: &AtomicBool) {
    for stream in listener.incoming() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(mut stream) => {
                let bindings = Arc::clone(&bindings);
                let spawned = thread::Builder::new()
                    .name("carpool-directory-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(&mut stream, &bindings) {
                            warn!("Directory request failed: {err}");
                        }
                    });
                if let Err(err) = spawned {
                    warn!("Failed to spawn directory handler: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => warn!("Directory listener error: {err}"),
        }
    }
}

fn handle_connection(stream: &mut TcpStream, bindings: &Bindings) -> io::Result<()> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let Some(request) = read_message::<DirectoryRequest>(stream)? else {
        return Ok(());
    };
    debug!("Directory received {:?}", request);
    write_message(stream, &bindings.handle(request))
}

/// Client for the directory on a given port.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryClient {
    addr: SocketAddr,
}

impl DirectoryClient {
    pub fn new(port: u16) -> Self {
        Self {
            addr: directory_addr(port),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn request(&self, request: &DirectoryRequest) -> Result<DirectoryResponse, DirectoryError> {
        let mut stream =
            TcpStream::connect(self.addr).map_err(|source| DirectoryError::Unreachable {
                addr: self.addr,
                source,
            })?;
        write_message(&mut stream, request)?;

        match read_message::<DirectoryResponse>(&mut stream)? {
            None => Err(DirectoryError::Closed),
            Some(DirectoryResponse::Error(fault)) => Err(fault.into()),
            Some(response) => Ok(response),
        }
    }

    pub fn bind(&self, name: &str, endpoint: SocketAddr) -> Result<(), DirectoryError> {
        let request = DirectoryRequest::Bind {
            name: name.to_string(),
            endpoint,
        };
        match self.request(&request)? {
            DirectoryResponse::Bound => Ok(()),
            other => Err(DirectoryError::Protocol(format!("{other:?}"))),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<SocketAddr, DirectoryError> {
        let request = DirectoryRequest::Lookup {
            name: name.to_string(),
        };
        match self.request(&request)? {
            DirectoryResponse::Endpoint(endpoint) => Ok(endpoint),
            other => Err(DirectoryError::Protocol(format!("{other:?}"))),
        }
    }

    pub fn unbind(&self, name: &str) -> Result<(), DirectoryError> {
        let request = DirectoryRequest::Unbind {
            name: name.to_string(),
        };
        match self.request(&request)? {
            DirectoryResponse::Unbound => Ok(()),
            other => Err(DirectoryError::Protocol(format!("{other:?}"))),
        }
    }

    pub fn list(&self) -> Result<Vec<String>, DirectoryError> {
        match self.request(&DirectoryRequest::List)? {
            DirectoryResponse::Names(names) => Ok(names),
            other => Err(DirectoryError::Protocol(format!("{other:?}"))),
        }
    }
}
