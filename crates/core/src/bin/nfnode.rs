use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use clap::Parser;
use crossbeam::channel;
use nfcore::{
    config::ConfigArgs,
    message::PeerId,
    sbi::{SbiRequest, SbiResponse, ServerRegistry},
    xact::FinishedXact,
    IncomingRequest, Node, NodeCx, Protocol, StatsSnapshot,
};

const ECHO_TIMER: u64 = 1;
const ECHO_BODY: &[u8] = b"echo";

/// Answers every request with its own body and periodically checks that the
/// configured peers answer ours.
struct EchoProtocol {
    peers: Vec<PeerId>,
    interval: Duration,
}

impl EchoProtocol {
    fn echo_all(&self, node: &mut NodeCx<'_>) {
        for &peer in &self.peers {
            if let Err(err) = node.begin(peer, ECHO_BODY) {
                tracing::warn!(%peer, %err, "cannot send echo request");
            }
        }
    }
}

impl Protocol for EchoProtocol {
    fn on_start(&mut self, node: &mut NodeCx<'_>) {
        if self.peers.is_empty() {
            return;
        }
        if let Err(err) = node.arm_periodic(ECHO_TIMER, self.interval) {
            tracing::error!(%err, "cannot arm echo timer");
        }
        self.echo_all(node);
    }

    fn on_request(&mut self, node: &mut NodeCx<'_>, request: IncomingRequest) {
        if let Err(err) = node.respond(request.xact, &request.body) {
            tracing::warn!(key = %request.key, %err, "cannot answer request");
        }
    }

    fn on_response(&mut self, _node: &mut NodeCx<'_>, request: FinishedXact, _body: Bytes) {
        tracing::debug!(peer = %request.key.peer, retries = request.retries, "peer alive");
    }

    fn on_timeout(&mut self, _node: &mut NodeCx<'_>, request: FinishedXact) {
        tracing::warn!(peer = %request.key.peer, "peer unreachable");
    }

    fn on_timer(&mut self, node: &mut NodeCx<'_>, token: u64) {
        if token == ECHO_TIMER {
            self.echo_all(node);
        }
    }
}

fn status_response(stats: StatsSnapshot) -> SbiResponse {
    SbiResponse::json(200, &stats).unwrap_or_else(|err| {
        tracing::error!(%err, "cannot encode node status");
        SbiResponse::empty(500)
    })
}

fn main() -> anyhow::Result<()> {
    let args = ConfigArgs::parse();
    nfcore::tracing::init_tracer(args.log_level)?;
    let config = args.build()?;

    let (stop_tx, stop_rx) = channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    let protocol = EchoProtocol {
        peers: config.peers.iter().copied().map(PeerId::new).collect(),
        interval: config.echo_interval(),
    };
    let mut node = Node::new(config.clone(), protocol).initialize()?;
    tracing::info!(node = node.name(), addr = %node.local_addr(), "nfnode running");

    let (request_tx, request_rx) = channel::unbounded::<SbiRequest>();
    let registry = if config.sbi.listen.is_empty() {
        None
    } else {
        let registry = ServerRegistry::new(&config.sbi)?;
        for addr in &config.sbi.listen {
            registry.add(*addr)?;
        }
        let request_tx = request_tx.clone();
        registry.start_all(Arc::new(move |request| {
            let _ = request_tx.send(request);
        }))?;
        Some(registry)
    };

    loop {
        channel::select! {
            recv(stop_rx) -> _ => break,
            recv(request_rx) -> request => {
                let (Ok(request), Some(registry)) = (request, registry.as_ref()) else {
                    continue;
                };
                let response = match (request.method.as_str(), request.path.as_str()) {
                    ("GET", "/status") => status_response(node.stats()),
                    _ => {
                        if let Err(err) = registry.send_error(
                            request.stream,
                            404,
                            None,
                            Some("Not Found"),
                            Some(&request.path),
                        ) {
                            tracing::warn!(%err, "cannot send problem");
                        }
                        continue;
                    }
                };
                if let Err(err) = registry.send_response(request.stream, response) {
                    tracing::warn!(%err, "cannot send response");
                }
            }
        }
    }

    tracing::info!("shutting down");
    if let Some(registry) = registry {
        registry.stop_all();
        registry.shutdown();
    }
    drop(request_tx);
    node.terminate();
    Ok(())
}
