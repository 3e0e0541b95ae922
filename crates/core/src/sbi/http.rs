//! HTTP backend built on axum, running on a runtime of its own so the
//! callers stay synchronous.
//!
//! Every request becomes a pending stream. The handler waits for the
//! application's [`SbiResponse`] and answers `504 Gateway Timeout` if none
//! arrives within the response timeout.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{runtime::Runtime, sync::oneshot};

use super::{
    ProblemDetails, RequestCallback, SbiError, SbiRequest, SbiResponse, ServerBackend, ServerId,
    StreamId,
};

const RUNTIME_THREADS: usize = 2;

struct PendingStream {
    server: ServerId,
    reply: oneshot::Sender<SbiResponse>,
}

type Streams = Arc<DashMap<StreamId, PendingStream>>;

#[derive(Clone)]
struct ServerState {
    server: ServerId,
    callback: RequestCallback,
    streams: Streams,
    next_stream: Arc<AtomicU64>,
    session_pool: usize,
    response_timeout: Duration,
}

pub struct HttpBackend {
    runtime: Mutex<Option<Runtime>>,
    streams: Streams,
    servers: DashMap<ServerId, oneshot::Sender<()>>,
    next_stream: Arc<AtomicU64>,
    session_pool: usize,
    response_timeout: Duration,
}

impl HttpBackend {
    pub fn new(session_pool: usize, response_timeout: Duration) -> Result<Self, SbiError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name("sbi-http")
            .enable_all()
            .build()
            .map_err(SbiError::Runtime)?;
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            streams: Arc::new(DashMap::new()),
            servers: DashMap::new(),
            next_stream: Arc::new(AtomicU64::new(1)),
            session_pool,
            response_timeout,
        })
    }
}

impl ServerBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn start(
        &self,
        server: ServerId,
        addr: SocketAddr,
        callback: RequestCallback,
    ) -> Result<SocketAddr, SbiError> {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return Err(SbiError::Runtime(std::io::Error::other(
                "backend already cleaned up",
            )));
        };
        // bind synchronously so address errors reach the caller
        let listener =
            std::net::TcpListener::bind(addr).map_err(|source| SbiError::Bind { addr, source })?;
        listener.set_nonblocking(true).map_err(SbiError::Runtime)?;
        let bound = listener.local_addr().map_err(SbiError::Runtime)?;
        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(listener).map_err(SbiError::Runtime)?
        };

        let state = ServerState {
            server,
            callback,
            streams: self.streams.clone(),
            next_stream: self.next_stream.clone(),
            session_pool: self.session_pool,
            response_timeout: self.response_timeout,
        };
        let router = Router::new().fallback(dispatch).with_state(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        runtime.spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = served {
                tracing::error!(%bound, "service interface server failed: {err}");
            }
        });
        if let Some(previous) = self.servers.insert(server, shutdown_tx) {
            let _ = previous.send(());
        }
        Ok(bound)
    }

    fn stop(&self, server: ServerId) {
        if let Some((_, shutdown)) = self.servers.remove(&server) {
            let _ = shutdown.send(());
        }
        self.streams.retain(|_, pending| pending.server != server);
    }

    fn send_response(&self, stream: StreamId, response: SbiResponse) -> Result<(), SbiError> {
        let (_, pending) = self
            .streams
            .remove(&stream)
            .ok_or(SbiError::UnknownStream(stream))?;
        if pending.reply.send(response).is_err() {
            tracing::debug!(%stream, "client gone before the response");
        }
        Ok(())
    }

    fn server_of(&self, stream: StreamId) -> Option<ServerId> {
        self.streams.get(&stream).map(|pending| pending.server)
    }

    fn cleanup(&self) {
        let servers: Vec<ServerId> = self.servers.iter().map(|entry| *entry.key()).collect();
        for server in servers {
            self.stop(server);
        }
        self.streams.clear();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn dispatch(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.streams.len() >= state.session_pool {
        tracing::warn!(%uri, "session pool exhausted, request refused");
        let problem = ProblemDetails::new(
            StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            None,
            Some("Service Unavailable"),
            Some("too many concurrent requests"),
        );
        return match SbiResponse::problem(&problem) {
            Ok(response) => into_http(response),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        };
    }

    let stream = StreamId(state.next_stream.fetch_add(1, Ordering::Relaxed));
    let (reply, answer) = oneshot::channel();
    state.streams.insert(
        stream,
        PendingStream {
            server: state.server,
            reply,
        },
    );
    // hyper drops this future when the client goes away
    let _forget = ForgetStream {
        streams: &state.streams,
        stream,
    };
    let request = SbiRequest {
        stream,
        server: state.server,
        method: method.to_string(),
        path: uri.path().to_owned(),
        content_type: headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        body,
    };
    tracing::trace!(%stream, %method, path = %uri.path(), "service interface request");
    (state.callback)(request);

    match tokio::time::timeout(state.response_timeout, answer).await {
        Ok(Ok(response)) => into_http(response),
        // stream dropped by stop or cleanup
        Ok(Err(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(_) => {
            tracing::warn!(%stream, path = %uri.path(), "no response in time");
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// Removes a stream from the pending set when the request ends, however it
/// ends.
struct ForgetStream<'a> {
    streams: &'a Streams,
    stream: StreamId,
}

impl Drop for ForgetStream<'_> {
    fn drop(&mut self) {
        if self.streams.remove(&self.stream).is_some() {
            tracing::debug!(stream = %self.stream, "request ended without a response");
        }
    }
}

fn into_http(response: SbiResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    if let Some(content_type) = &response.content_type {
        builder = builder.header(CONTENT_TYPE, content_type.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|err| {
            tracing::error!("invalid response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}
