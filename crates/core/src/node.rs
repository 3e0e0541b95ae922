//! A network function node: one thread running an event loop that drives
//! the node's state machine, transactions and timers.
//!
//! [`Node::initialize`] does everything that can fail up front (config
//! validation, queue creation, socket binding, thread spawn) and only then
//! returns a [`NodeHandle`]. The node thread then walks through
//!
//! ```text
//! initial --> operational --(stop)--> final
//! ```
//!
//! Entering `operational` opens the signalling paths and starts the
//! [`Protocol`]; leaving it stops the protocol and closes the paths. In
//! between, every queued event is dispatched to the operational state, which
//! routes datagrams through the transaction manager and timer expiries to
//! their owner.
//!
//! Timers are serviced whenever the queue wait times out and, under load,
//! before dispatching an event once more than the wait timeout has passed
//! since the last run.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, trace};

use crate::{
    config::NodeConfig,
    event::{Event, TimerContext, TimerExpiry},
    fsm::{Fsm, State, Transition},
    message::{Datagram, PeerId, SocketId},
    queue::{self, EventReceiver, EventSender, QueueError, Received},
    timer::{TimerError, TimerHandle, TimerKind, TimerService},
    transport::{TransportError, UdpPaths},
    xact::{FinishedXact, Inbound, TimeoutOutcome, XactError, XactKey, XactManager, XactRef},
};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn node thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A request received from a peer, to be answered with [`NodeCx::respond`].
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub xact: XactRef,
    pub key: XactKey,
    pub socket: SocketId,
    pub body: Bytes,
}

/// Signalling logic running on a node.
///
/// Every callback runs on the node thread and must not block; waiting is
/// done by arming a timer with [`NodeCx::arm_timer`].
pub trait Protocol: Send + 'static {
    /// Called once the signalling paths are open.
    fn on_start(&mut self, _node: &mut NodeCx<'_>) {}

    fn on_request(&mut self, node: &mut NodeCx<'_>, request: IncomingRequest);

    fn on_response(&mut self, _node: &mut NodeCx<'_>, _request: FinishedXact, _body: Bytes) {}

    /// A request of ours went unanswered through all retransmissions.
    fn on_timeout(&mut self, _node: &mut NodeCx<'_>, _request: FinishedXact) {}

    fn on_timer(&mut self, _node: &mut NodeCx<'_>, _token: u64) {}

    /// Called before the paths close. In-flight transactions are discarded
    /// right after.
    fn on_stop(&mut self, _node: &mut NodeCx<'_>) {}
}

/// What a [`Protocol`] callback can do with its node.
pub struct NodeCx<'a> {
    name: &'a str,
    paths: &'a UdpPaths,
    timers: &'a mut TimerService,
    xacts: &'a mut XactManager<Arc<UdpPaths>>,
}

impl NodeCx<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn now(&self) -> Instant {
        self.timers.now()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.paths.local_addr(SocketId(0))
    }

    /// Sends a request from the first socket.
    pub fn begin(&mut self, peer: PeerId, body: &[u8]) -> Result<XactKey, XactError> {
        self.begin_on(SocketId(0), peer, body)
    }

    pub fn begin_on(
        &mut self,
        socket: SocketId,
        peer: PeerId,
        body: &[u8],
    ) -> Result<XactKey, XactError> {
        self.xacts.begin(&mut *self.timers, socket, peer, body)
    }

    pub fn respond(&mut self, xact: XactRef, body: &[u8]) -> Result<XactKey, XactError> {
        self.xacts.respond(&mut *self.timers, xact, body)
    }

    /// One-shot timer delivered to [`Protocol::on_timer`] with `token`.
    pub fn arm_timer(&mut self, token: u64, delay: Duration) -> Result<TimerHandle, TimerError> {
        self.timers.arm_in(TimerContext::Application(token), delay)
    }

    pub fn arm_periodic(&mut self, token: u64, period: Duration) -> Result<TimerHandle, TimerError> {
        let first = self.timers.now() + period;
        self.timers
            .arm(TimerContext::Application(token), first, TimerKind::Periodic(period))
    }

    pub fn disarm(&mut self, timer: TimerHandle) -> bool {
        self.timers.disarm(timer)
    }

    pub fn in_flight(&self) -> usize {
        self.xacts.len()
    }
}

/// Counters updated by the node thread.
#[derive(Debug, Default)]
pub struct NodeStats {
    service_runs: AtomicU64,
    events: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    duplicates: AtomicU64,
    unsolicited: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    retransmissions: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub service_runs: u64,
    pub events: u64,
    pub requests: u64,
    pub responses: u64,
    pub duplicates: u64,
    pub unsolicited: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
}

impl NodeStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            service_runs: read(&self.service_runs),
            events: read(&self.events),
            requests: read(&self.requests),
            responses: read(&self.responses),
            duplicates: read(&self.duplicates),
            unsolicited: read(&self.unsolicited),
            malformed: read(&self.malformed),
            rejected: read(&self.rejected),
            retransmissions: read(&self.retransmissions),
            timeouts: read(&self.timeouts),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopExitReason {
    Stopped,
    QueueDisconnected,
}

/// Everything the node thread owns.
struct NodeContext<P> {
    name: String,
    protocol: P,
    timers: TimerService,
    xacts: XactManager<Arc<UdpPaths>>,
    paths: Arc<UdpPaths>,
    queue: EventSender,
    stats: Arc<NodeStats>,
    stop: Arc<AtomicBool>,
    /// Set once `operational` opened the paths and started the protocol.
    started: bool,
}

impl<P: Protocol> NodeContext<P> {
    fn split(&mut self) -> (&mut P, NodeCx<'_>) {
        (
            &mut self.protocol,
            NodeCx {
                name: &self.name,
                paths: &self.paths,
                timers: &mut self.timers,
                xacts: &mut self.xacts,
            },
        )
    }

    fn service_timers(&mut self, now: Instant) {
        NodeStats::bump(&self.stats.service_runs);
        let posted = self.timers.service(now, &self.queue);
        if posted > 0 {
            trace!(node = %self.name, posted, "timers serviced");
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        let Datagram {
            socket,
            peer,
            payload,
        } = datagram;
        let stats = self.stats.clone();
        match self.xacts.receive(&mut self.timers, socket, peer, payload) {
            Inbound::NewRequest {
                xact,
                key,
                socket,
                body,
            } => {
                NodeStats::bump(&stats.requests);
                let (protocol, mut node) = self.split();
                protocol.on_request(
                    &mut node,
                    IncomingRequest {
                        xact,
                        key,
                        socket,
                        body,
                    },
                );
            }
            Inbound::MatchedResponse { request, body } => {
                NodeStats::bump(&stats.responses);
                let (protocol, mut node) = self.split();
                protocol.on_response(&mut node, request, body);
            }
            Inbound::DuplicateRetransmission { .. } => NodeStats::bump(&stats.duplicates),
            Inbound::Unsolicited { .. } => NodeStats::bump(&stats.unsolicited),
            Inbound::Malformed { .. } => NodeStats::bump(&stats.malformed),
            Inbound::Rejected { .. } => NodeStats::bump(&stats.rejected),
        }
    }

    fn handle_expiry(&mut self, expiry: TimerExpiry) {
        match expiry.context {
            TimerContext::Transaction(xact) => {
                match self.xacts.on_timeout(&mut self.timers, xact, expiry.timer) {
                    TimeoutOutcome::Retransmitted { .. } => {
                        NodeStats::bump(&self.stats.retransmissions)
                    }
                    TimeoutOutcome::TimedOut(request) => {
                        NodeStats::bump(&self.stats.timeouts);
                        let (protocol, mut node) = self.split();
                        protocol.on_timeout(&mut node, request);
                    }
                    TimeoutOutcome::Released { .. } | TimeoutOutcome::Stale => {}
                }
            }
            TimerContext::Application(token) => {
                let (protocol, mut node) = self.split();
                protocol.on_timer(&mut node, token);
            }
        }
    }
}

fn initial<P: Protocol>() -> State<NodeContext<P>> {
    State {
        name: "initial",
        on_entry: initial_entry::<P>,
        on_exit: |_| {},
        on_event: |_, _| Transition::Stay,
    }
}

fn initial_entry<P: Protocol>(_: &mut NodeContext<P>) -> Transition<NodeContext<P>> {
    Transition::To(operational())
}

fn operational<P: Protocol>() -> State<NodeContext<P>> {
    State {
        name: "operational",
        on_entry: operational_entry::<P>,
        on_exit: operational_exit::<P>,
        on_event: operational_event::<P>,
    }
}

fn operational_entry<P: Protocol>(cx: &mut NodeContext<P>) -> Transition<NodeContext<P>> {
    if let Err(err) = cx.paths.open(&cx.queue, &cx.name) {
        error!(node = %cx.name, %err, "cannot open signalling paths, stopping node");
        cx.stop.store(true, Ordering::Release);
        return Transition::Stay;
    }
    cx.started = true;
    let (protocol, mut node) = cx.split();
    protocol.on_start(&mut node);
    Transition::Stay
}

fn operational_exit<P: Protocol>(cx: &mut NodeContext<P>) {
    if !std::mem::take(&mut cx.started) {
        return;
    }
    let (protocol, mut node) = cx.split();
    protocol.on_stop(&mut node);
    cx.paths.close();
}

fn operational_event<P: Protocol>(
    cx: &mut NodeContext<P>,
    event: Event,
) -> Transition<NodeContext<P>> {
    match event {
        Event::Message(datagram) => cx.handle_datagram(datagram),
        Event::TimerExpiry(expiry) => cx.handle_expiry(expiry),
        Event::Signal(signal) => {
            debug!(node = %cx.name, ?signal, "lifecycle signal posted to the queue, ignored")
        }
    }
    Transition::Stay
}

fn terminal<P: Protocol>() -> State<NodeContext<P>> {
    State {
        name: "final",
        on_entry: terminal_entry::<P>,
        on_exit: |_| {},
        on_event: |_, _| Transition::Stay,
    }
}

fn terminal_entry<P: Protocol>(cx: &mut NodeContext<P>) -> Transition<NodeContext<P>> {
    debug!(node = %cx.name, "state machine finished");
    Transition::Stay
}

fn run_event_loop<P: Protocol>(
    mut cx: NodeContext<P>,
    events: EventReceiver,
    wait: Duration,
) -> EventLoopExitReason {
    let mut fsm = Fsm::new(initial::<P>(), terminal::<P>());
    fsm.init(&mut cx);
    info!(node = %cx.name, state = fsm.state(), "event loop running");

    let mut last_service = cx.timers.now();
    let reason = loop {
        if cx.stop.load(Ordering::Acquire) {
            break EventLoopExitReason::Stopped;
        }
        let received = events.receive(wait);
        let now = cx.timers.now();
        match received {
            Ok(Received::Empty) => {
                cx.service_timers(now);
                last_service = now;
            }
            Ok(Received::Event(event)) => {
                if now.saturating_duration_since(last_service) > wait {
                    cx.service_timers(now);
                    last_service = now;
                }
                NodeStats::bump(&cx.stats.events);
                fsm.dispatch(&mut cx, event);
            }
            Err(QueueError::Disconnected) => break EventLoopExitReason::QueueDisconnected,
            Err(QueueError::Full(_)) => {}
        }
    };

    fsm.finalize(&mut cx);
    let discarded = cx.xacts.finalize(&mut cx.timers);
    cx.timers.clear();
    drop(events);
    info!(node = %cx.name, ?reason, discarded, "event loop stopped");
    reason
}

pub struct Node<P> {
    config: NodeConfig,
    protocol: P,
}

impl<P: Protocol> Node<P> {
    pub fn new(config: NodeConfig, protocol: P) -> Self {
        Self { config, protocol }
    }

    /// Binds the signalling sockets and starts the node thread. Nothing is
    /// left running if any step fails.
    pub fn initialize(self) -> Result<NodeHandle, NodeError> {
        let Node { config, protocol } = self;
        config
            .validate()
            .map_err(|err| NodeError::InvalidConfig(err.to_string()))?;

        let (queue, events) = queue::bounded(config.queue_capacity, config.queue_post_timeout());
        let paths = Arc::new(UdpPaths::bind(&config.listen)?);
        let local_addrs = paths.local_addrs().to_vec();
        let stats = Arc::new(NodeStats::default());
        let stop = Arc::new(AtomicBool::new(false));

        let cx = NodeContext {
            name: config.name.clone(),
            protocol,
            timers: TimerService::new(config.timer_capacity),
            xacts: XactManager::new(config.xact.clone(), paths.clone()),
            paths,
            queue: queue.clone(),
            stats: stats.clone(),
            stop: stop.clone(),
            started: false,
        };
        let wait = config.event_wait_timeout();
        let thread = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || run_event_loop(cx, events, wait))
            .map_err(NodeError::Spawn)?;

        info!(node = %config.name, listen = ?local_addrs, "node initialised");
        Ok(NodeHandle {
            name: config.name,
            local_addrs,
            queue,
            stats,
            stop,
            thread: Some(thread),
        })
    }
}

/// Owner's side of a running node. Dropping it terminates the node.
pub struct NodeHandle {
    name: String,
    local_addrs: Vec<SocketAddr>,
    queue: EventSender,
    stats: Arc<NodeStats>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<EventLoopExitReason>>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the first signalling socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addrs[0]
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Injects an event as if it came from a socket or timer.
    pub fn post(&self, event: Event) -> Result<(), QueueError> {
        self.queue.post(event)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the event loop and waits for the node thread. Later calls
    /// return `None`.
    pub fn terminate(&mut self) -> Option<EventLoopExitReason> {
        let thread = self.thread.take()?;
        self.stop.store(true, Ordering::Release);
        match thread.join() {
            Ok(reason) => {
                info!(node = %self.name, ?reason, "node terminated");
                Some(reason)
            }
            Err(_) => {
                error!(node = %self.name, "node thread panicked");
                None
            }
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}
