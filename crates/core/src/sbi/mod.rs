//! Service based interface: the HTTP request/response surface newer network
//! functions expose to each other.
//!
//! [`ServerRegistry`] keeps the listen addresses a node serves on and drives
//! one [`ServerBackend`], chosen once from [`SbiConfig::backend`]. Requests
//! reach the application through a callback as [`SbiRequest`]s; each carries
//! a [`StreamId`] the application answers with
//! [`ServerRegistry::send_response`] or one of the problem helpers.

use std::{fmt, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::{SbiBackendKind, SbiConfig},
    util::{Arena, Handle},
};

mod http;
mod loopback;

pub use http::HttpBackend;
pub use loopback::LoopbackBackend;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum SbiError {
    #[error("server pool exhausted, capacity: {capacity}")]
    PoolExhausted { capacity: usize },
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    #[error("unknown server")]
    UnknownServer,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(Handle);

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server:{:?}", self.0)
    }
}

/// One request/response exchange on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SbiRequest {
    pub stream: StreamId,
    pub server: ServerId,
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbiResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl SbiResponse {
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Result<Self, SbiError> {
        Ok(Self {
            status,
            content_type: Some(JSON_CONTENT_TYPE.into()),
            body: serde_json::to_vec(value)?.into(),
        })
    }

    pub fn problem(problem: &ProblemDetails) -> Result<Self, SbiError> {
        Ok(Self {
            status: problem.status,
            content_type: Some(PROBLEM_CONTENT_TYPE.into()),
            body: serde_json::to_vec(problem)?.into(),
        })
    }
}

/// The parts of a decoded request that identify the resource it addressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub service: String,
    pub api_version: String,
    /// Path components below the API version; only the first two are used.
    pub resource: Vec<String>,
}

/// RFC 7807 problem details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    /// `type` becomes `/service/version` and `instance` the first one or two
    /// resource components, when a header is given.
    pub fn new(
        status: u16,
        header: Option<&MessageHeader>,
        title: Option<&str>,
        detail: Option<&str>,
    ) -> Self {
        let (problem_type, instance) = match header {
            Some(header) => {
                let problem_type = format!("/{}/{}", header.service, header.api_version);
                let instance = match header.resource.as_slice() {
                    [] => None,
                    [first] => Some(format!("/{first}")),
                    [first, second, ..] => Some(format!("/{first}/{second}")),
                };
                (Some(problem_type), instance)
            }
            None => (None, None),
        };
        Self {
            problem_type,
            title: title.map(str::to_owned),
            status,
            detail: detail.map(str::to_owned),
            instance,
        }
    }
}

pub type RequestCallback = Arc<dyn Fn(SbiRequest) + Send + Sync>;

/// A request/response transport serving registered addresses.
pub trait ServerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts serving `addr`; returns the address actually bound.
    fn start(
        &self,
        server: ServerId,
        addr: SocketAddr,
        callback: RequestCallback,
    ) -> Result<SocketAddr, SbiError>;

    /// Stops serving. Pending streams of the server are dropped.
    fn stop(&self, server: ServerId);

    fn send_response(&self, stream: StreamId, response: SbiResponse) -> Result<(), SbiError>;

    /// Server a pending stream arrived on.
    fn server_of(&self, stream: StreamId) -> Option<ServerId>;

    /// Releases everything the backend holds. Called once on shutdown.
    fn cleanup(&self);
}

impl<T: ServerBackend + ?Sized> ServerBackend for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn start(
        &self,
        server: ServerId,
        addr: SocketAddr,
        callback: RequestCallback,
    ) -> Result<SocketAddr, SbiError> {
        (**self).start(server, addr, callback)
    }

    fn stop(&self, server: ServerId) {
        (**self).stop(server)
    }

    fn send_response(&self, stream: StreamId, response: SbiResponse) -> Result<(), SbiError> {
        (**self).send_response(stream, response)
    }

    fn server_of(&self, stream: StreamId) -> Option<ServerId> {
        (**self).server_of(stream)
    }

    fn cleanup(&self) {
        (**self).cleanup()
    }
}

#[derive(Debug)]
struct ServerRecord {
    addr: SocketAddr,
    bound: Option<SocketAddr>,
}

pub struct ServerRegistry {
    backend: Box<dyn ServerBackend>,
    servers: Mutex<Arena<ServerRecord>>,
}

impl ServerRegistry {
    /// Creates the backend named by the config.
    pub fn new(config: &SbiConfig) -> Result<Self, SbiError> {
        let backend: Box<dyn ServerBackend> = match config.backend {
            SbiBackendKind::Http => Box::new(HttpBackend::new(
                config.session_pool,
                config.response_timeout(),
            )?),
            SbiBackendKind::Loopback => Box::new(LoopbackBackend::new(config.session_pool)),
        };
        tracing::debug!(backend = backend.name(), "service interface backend selected");
        Ok(Self::with_backend(backend, config.server_capacity))
    }

    pub fn with_backend(backend: Box<dyn ServerBackend>, capacity: usize) -> Self {
        Self {
            backend,
            servers: Mutex::new(Arena::with_capacity(capacity)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn add(&self, addr: SocketAddr) -> Result<ServerId, SbiError> {
        let mut servers = self.servers.lock();
        let capacity = servers.capacity();
        servers
            .insert(ServerRecord { addr, bound: None })
            .map(ServerId)
            .map_err(|_| SbiError::PoolExhausted { capacity })
    }

    /// Stops and forgets a server. Returns whether it was registered.
    pub fn remove(&self, server: ServerId) -> bool {
        let removed = self.servers.lock().remove(server.0);
        match removed {
            Some(record) => {
                if record.bound.is_some() {
                    self.backend.stop(server);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) -> usize {
        let handles = self.servers.lock().handles();
        handles
            .into_iter()
            .filter(|handle| self.remove(ServerId(*handle)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }

    pub fn servers(&self) -> Vec<(ServerId, SocketAddr)> {
        self.servers
            .lock()
            .iter()
            .map(|(handle, record)| (ServerId(handle), record.addr))
            .collect()
    }

    /// Address a started server is listening on.
    pub fn local_addr(&self, server: ServerId) -> Option<SocketAddr> {
        self.servers.lock().get(server.0).and_then(|r| r.bound)
    }

    /// Starts every registered server that is not running yet. Stops at the
    /// first failure; servers started before it keep running.
    pub fn start_all(&self, callback: RequestCallback) -> Result<usize, SbiError> {
        let mut started = 0;
        let handles = self.servers.lock().handles();
        for handle in handles {
            let server = ServerId(handle);
            let addr = match self.servers.lock().get(handle) {
                Some(ServerRecord { bound: None, addr }) => *addr,
                _ => continue,
            };
            let bound = self.backend.start(server, addr, callback.clone())?;
            match self.servers.lock().get_mut(handle) {
                Some(record) => record.bound = Some(bound),
                // removed while starting
                None => {
                    self.backend.stop(server);
                    continue;
                }
            }
            tracing::info!(%addr, %bound, backend = self.backend.name(), "server started");
            started += 1;
        }
        Ok(started)
    }

    pub fn stop_all(&self) {
        let handles = self.servers.lock().handles();
        for handle in handles {
            let was_running = self
                .servers
                .lock()
                .get_mut(handle)
                .and_then(|record| record.bound.take())
                .is_some();
            if was_running {
                self.backend.stop(ServerId(handle));
            }
        }
    }

    pub fn send_response(&self, stream: StreamId, response: SbiResponse) -> Result<(), SbiError> {
        self.backend.send_response(stream, response)
    }

    pub fn send_problem(&self, stream: StreamId, problem: &ProblemDetails) -> Result<(), SbiError> {
        self.send_response(stream, SbiResponse::problem(problem)?)
    }

    pub fn send_error(
        &self,
        stream: StreamId,
        status: u16,
        header: Option<&MessageHeader>,
        title: Option<&str>,
        detail: Option<&str>,
    ) -> Result<(), SbiError> {
        let problem = ProblemDetails::new(status, header, title, detail);
        self.send_problem(stream, &problem)
    }

    /// Server a pending stream belongs to.
    pub fn resolve_server(&self, stream: StreamId) -> Result<ServerId, SbiError> {
        let server = self
            .backend
            .server_of(stream)
            .ok_or(SbiError::UnknownStream(stream))?;
        if self.servers.lock().contains(server.0) {
            Ok(server)
        } else {
            Err(SbiError::UnknownServer)
        }
    }

    /// Removes every server, then releases the backend.
    pub fn shutdown(&self) {
        let removed = self.remove_all();
        self.backend.cleanup();
        tracing::debug!(removed, "service interface shut down");
    }
}
