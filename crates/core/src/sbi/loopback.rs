//! In-process backend: requests are injected by the caller instead of read
//! from a socket. Used when two functions share a process and in tests.

use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::{
    RequestCallback, SbiError, SbiRequest, SbiResponse, ServerBackend, ServerId, StreamId,
};

struct PendingStream {
    server: ServerId,
    reply: Sender<SbiResponse>,
}

#[derive(Default)]
struct State {
    servers: HashMap<ServerId, RequestCallback>,
    streams: HashMap<StreamId, PendingStream>,
    next_stream: u64,
}

pub struct LoopbackBackend {
    session_pool: usize,
    state: Mutex<State>,
}

impl LoopbackBackend {
    pub fn new(session_pool: usize) -> Self {
        Self {
            session_pool,
            state: Mutex::new(State::default()),
        }
    }

    /// Delivers a request to a started server. The response arrives on the
    /// returned channel once the application answers the stream.
    pub fn inject(
        &self,
        server: ServerId,
        method: &str,
        path: &str,
        body: Bytes,
    ) -> Result<Receiver<SbiResponse>, SbiError> {
        let (callback, request, reply) = {
            let mut state = self.state.lock();
            let callback = state
                .servers
                .get(&server)
                .cloned()
                .ok_or(SbiError::UnknownServer)?;
            if state.streams.len() >= self.session_pool {
                return Err(SbiError::PoolExhausted {
                    capacity: self.session_pool,
                });
            }
            state.next_stream += 1;
            let stream = StreamId(state.next_stream);
            let (tx, rx) = channel::bounded(1);
            state.streams.insert(stream, PendingStream { server, reply: tx });
            let request = SbiRequest {
                stream,
                server,
                method: method.to_owned(),
                path: path.to_owned(),
                content_type: None,
                body,
            };
            (callback, request, rx)
        };
        // outside the lock: the callback may answer right away
        callback(request);
        Ok(reply)
    }
}

impl ServerBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn start(
        &self,
        server: ServerId,
        addr: SocketAddr,
        callback: RequestCallback,
    ) -> Result<SocketAddr, SbiError> {
        self.state.lock().servers.insert(server, callback);
        Ok(addr)
    }

    fn stop(&self, server: ServerId) {
        let mut state = self.state.lock();
        state.servers.remove(&server);
        state.streams.retain(|_, pending| pending.server != server);
    }

    fn send_response(&self, stream: StreamId, response: SbiResponse) -> Result<(), SbiError> {
        let pending = self
            .state
            .lock()
            .streams
            .remove(&stream)
            .ok_or(SbiError::UnknownStream(stream))?;
        if pending.reply.send(response).is_err() {
            tracing::debug!(%stream, "requester gone before the response");
        }
        Ok(())
    }

    fn server_of(&self, stream: StreamId) -> Option<ServerId> {
        self.state.lock().streams.get(&stream).map(|p| p.server)
    }

    fn cleanup(&self) {
        let mut state = self.state.lock();
        state.servers.clear();
        state.streams.clear();
    }
}
