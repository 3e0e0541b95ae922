//! End-to-end behaviour of nodes talking over real UDP sockets on loopback.

use std::{
    net::{SocketAddr, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use nfcore::{
    config::{NodeConfig, XactConfig},
    event::{Event, Signal},
    message::{self, MessageKind, PeerId, XactHeader},
    xact::{FinishedXact, XactState},
    EventLoopExitReason, IncomingRequest, Node, NodeCx, NodeError, Protocol,
};
use testresult::TestResult;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Seen {
    Started,
    Request(Bytes),
    Response { request: Bytes, body: Bytes },
    Timeout(FinishedXact),
    Stopped,
}

/// Answers requests with an upper-cased copy of the body and sends one
/// request to every peer on start.
struct Recorder {
    peers: Vec<PeerId>,
    greeting: &'static [u8],
    seen: Sender<Seen>,
}

impl Protocol for Recorder {
    fn on_start(&mut self, node: &mut NodeCx<'_>) {
        let _ = self.seen.send(Seen::Started);
        for &peer in &self.peers {
            node.begin(peer, self.greeting).expect("begin");
        }
    }

    fn on_request(&mut self, node: &mut NodeCx<'_>, request: IncomingRequest) {
        let answer = request.body.to_ascii_uppercase();
        node.respond(request.xact, &answer).expect("respond");
        let _ = self.seen.send(Seen::Request(request.body));
    }

    fn on_response(&mut self, _node: &mut NodeCx<'_>, request: FinishedXact, body: Bytes) {
        let _ = self.seen.send(Seen::Response {
            request: request.request,
            body,
        });
    }

    fn on_timeout(&mut self, _node: &mut NodeCx<'_>, request: FinishedXact) {
        let _ = self.seen.send(Seen::Timeout(request));
    }

    fn on_stop(&mut self, _node: &mut NodeCx<'_>) {
        let _ = self.seen.send(Seen::Stopped);
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn config(name: &str) -> NodeConfig {
    NodeConfig {
        name: name.into(),
        listen: vec![loopback()],
        event_wait_timeout_ms: 5,
        xact: XactConfig {
            retry_interval_ms: 50,
            max_retries: 2,
            ..XactConfig::default()
        },
        ..NodeConfig::default()
    }
}

fn recorder(peers: Vec<SocketAddr>, greeting: &'static [u8]) -> (Recorder, Receiver<Seen>) {
    let (seen, rx) = channel::unbounded();
    let protocol = Recorder {
        peers: peers.into_iter().map(PeerId::new).collect(),
        greeting,
        seen,
    };
    (protocol, rx)
}

fn next_matching(rx: &Receiver<Seen>, mut matches: impl FnMut(&Seen) -> bool) -> Option<Seen> {
    let deadline = Instant::now() + WAIT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(seen) if matches(&seen) => return Some(seen),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

#[test_log::test]
fn request_is_answered_across_nodes() -> TestResult {
    let (server_protocol, server_seen) = recorder(Vec::new(), b"");
    let mut server = Node::new(config("server"), server_protocol).initialize()?;

    let (client_protocol, client_seen) = recorder(vec![server.local_addr()], b"ping");
    let mut client = Node::new(config("client"), client_protocol).initialize()?;

    let request = next_matching(&server_seen, |s| matches!(s, Seen::Request(_)));
    assert!(matches!(request, Some(Seen::Request(body)) if body == "ping"));

    let response = next_matching(&client_seen, |s| matches!(s, Seen::Response { .. }));
    match response {
        Some(Seen::Response { request, body }) => {
            assert_eq!(request, "ping");
            assert_eq!(body, "PING");
        }
        other => panic!("expected a response, got {other:?}"),
    }

    assert_eq!(client.terminate(), Some(EventLoopExitReason::Stopped));
    assert_eq!(server.terminate(), Some(EventLoopExitReason::Stopped));
    assert_eq!(server.stats().requests, 1);
    assert_eq!(client.stats().responses, 1);
    assert_eq!(client.stats().timeouts, 0);
    Ok(())
}

#[test_log::test]
fn silent_peer_times_out() -> TestResult {
    let silent = UdpSocket::bind(loopback())?;
    let (protocol, seen) = recorder(vec![silent.local_addr()?], b"anyone?");
    let started = Instant::now();
    let mut node = Node::new(config("lonely"), protocol).initialize()?;

    let timeout = next_matching(&seen, |s| matches!(s, Seen::Timeout(_)));
    let elapsed = started.elapsed();
    match timeout {
        Some(Seen::Timeout(request)) => {
            assert_eq!(request.state, XactState::TimedOut);
            assert_eq!(request.retries, 2);
            assert_eq!(request.request, "anyone?");
            assert_eq!(request.key.peer, PeerId::new(silent.local_addr()?));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    // first send plus two retransmissions, then one more interval
    assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");

    // the peer saw every copy of the request
    silent.set_read_timeout(Some(Duration::from_millis(200)))?;
    let mut buf = [0u8; 64];
    let mut copies = 0;
    while silent.recv_from(&mut buf).is_ok() {
        copies += 1;
    }
    assert_eq!(copies, 3);

    node.terminate();
    let stats = node.stats();
    assert_eq!(stats.retransmissions, 2);
    assert_eq!(stats.timeouts, 1);
    Ok(())
}

#[test_log::test]
fn idle_node_keeps_servicing_timers() -> TestResult {
    let (protocol, seen) = recorder(Vec::new(), b"");
    let mut node = Node::new(config("idle"), protocol).initialize()?;
    assert!(next_matching(&seen, |s| matches!(s, Seen::Started)).is_some());

    thread::sleep(Duration::from_millis(100));
    assert!(node.stats().service_runs >= 3, "{:?}", node.stats());
    node.terminate();
    Ok(())
}

#[test_log::test]
fn terminate_is_idempotent() -> TestResult {
    let (protocol, seen) = recorder(Vec::new(), b"");
    let mut node = Node::new(config("twice"), protocol).initialize()?;
    assert!(node.is_running());

    assert_eq!(node.terminate(), Some(EventLoopExitReason::Stopped));
    assert!(!node.is_running());
    assert_eq!(node.terminate(), None);

    let events: Vec<_> = seen.try_iter().collect();
    assert!(matches!(events.first(), Some(Seen::Started)));
    assert!(matches!(events.last(), Some(Seen::Stopped)));
    assert_eq!(
        events.iter().filter(|s| matches!(s, Seen::Stopped)).count(),
        1
    );
    Ok(())
}

#[test_log::test]
fn occupied_address_fails_initialisation() -> TestResult {
    let taken = UdpSocket::bind(loopback())?;
    let mut config = config("clash");
    config.listen = vec![taken.local_addr()?];
    let (protocol, _seen) = recorder(Vec::new(), b"");

    let result = Node::new(config, protocol).initialize();
    assert!(matches!(result, Err(NodeError::Transport(_))));
    Ok(())
}

#[test_log::test]
fn invalid_config_is_rejected() {
    let mut config = config("broken");
    config.queue_capacity = 0;
    let (protocol, _seen) = recorder(Vec::new(), b"");
    assert!(matches!(
        Node::new(config, protocol).initialize(),
        Err(NodeError::InvalidConfig(_))
    ));
}

#[test_log::test]
fn stray_datagrams_are_counted_and_dropped() -> TestResult {
    let (protocol, seen) = recorder(Vec::new(), b"");
    let mut node = Node::new(config("strays"), protocol).initialize()?;
    assert!(next_matching(&seen, |s| matches!(s, Seen::Started)).is_some());

    let peer = UdpSocket::bind(loopback())?;
    peer.send_to(b"abc", node.local_addr())?;
    let unsolicited = message::encode(
        XactHeader {
            kind: MessageKind::Response,
            id: 42,
        },
        b"late",
    )?;
    peer.send_to(&unsolicited, node.local_addr())?;
    let mut oversized = message::encode(
        XactHeader {
            kind: MessageKind::Request,
            id: 43,
        },
        &[0u8; 64],
    )?
    .to_vec();
    oversized.resize(message::MAX_DATAGRAM_SIZE + 1, 0);
    peer.send_to(&oversized, node.local_addr())?;

    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        let stats = node.stats();
        if stats.malformed == 2 && stats.unsolicited == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    node.terminate();
    let stats = node.stats();
    assert_eq!(stats.malformed, 2);
    assert_eq!(stats.unsolicited, 1);
    assert_eq!(stats.requests, 0);
    assert!(seen.try_iter().all(|s| !matches!(s, Seen::Request(_))));
    Ok(())
}

#[test_log::test]
fn retransmitted_request_gets_cached_answer() -> TestResult {
    let (protocol, seen) = recorder(Vec::new(), b"");
    let mut node = Node::new(config("cache"), protocol).initialize()?;
    assert!(next_matching(&seen, |s| matches!(s, Seen::Started)).is_some());

    let peer = UdpSocket::bind(loopback())?;
    peer.set_read_timeout(Some(WAIT))?;
    let request = message::encode(
        XactHeader {
            kind: MessageKind::Request,
            id: 7,
        },
        b"hello",
    )?;
    let mut buf = [0u8; 64];
    for _ in 0..2 {
        peer.send_to(&request, node.local_addr())?;
        let (len, _) = peer.recv_from(&mut buf)?;
        let (header, body) = message::decode(&Bytes::copy_from_slice(&buf[..len]))?;
        assert_eq!(header.kind, MessageKind::Response);
        assert_eq!(header.id, 7);
        assert_eq!(body, "HELLO");
    }

    node.terminate();
    let stats = node.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.duplicates, 1);
    let requests = seen
        .try_iter()
        .filter(|s| matches!(s, Seen::Request(_)))
        .count();
    assert_eq!(requests, 1);
    Ok(())
}

#[test_log::test]
fn timers_run_during_a_message_burst() -> TestResult {
    let silent = UdpSocket::bind(loopback())?;
    let mut config = config("burst");
    config.queue_capacity = 8;
    config.xact.retry_interval_ms = 20;
    config.xact.max_retries = 1;
    let (protocol, seen) = recorder(vec![silent.local_addr()?], b"busy?");
    let mut node = Node::new(config, protocol).initialize()?;
    assert!(next_matching(&seen, |s| matches!(s, Seen::Started)).is_some());

    let burst = Duration::from_millis(200);
    let before = node.stats();
    let started = Instant::now();
    let (posted, timed_out_at, during) = thread::scope(|scope| {
        let producer = scope.spawn(|| {
            // the queue holds 8 events, so it never runs dry while this loops
            let mut posted = 0u64;
            while started.elapsed() < burst {
                if node.post(Event::Signal(Signal::Entry)).is_ok() {
                    posted += 1;
                }
            }
            posted
        });
        let timed_out_at = next_matching(&seen, |s| matches!(s, Seen::Timeout(_)))
            .map(|_| started.elapsed());
        let posted = producer.join();
        (posted, timed_out_at, node.stats())
    });
    let posted = posted.map_err(|_| "producer panicked")?;

    assert!(posted > 100, "burst too small: {posted}");
    // up to a queue's worth may still be waiting
    assert!(during.events - before.events + 8 >= posted);
    assert!(
        during.service_runs - before.service_runs >= 3,
        "{before:?} -> {during:?}"
    );
    // one retransmission after 20ms, timeout 20ms later, well inside the burst
    let timed_out_at = timed_out_at.ok_or("no timeout reported")?;
    assert!(timed_out_at < burst, "{timed_out_at:?}");
    assert_eq!(during.retransmissions, 1);
    assert_eq!(during.timeouts, 1);

    node.terminate();
    Ok(())
}
