//! Request/response transaction tracking for one node.
//!
//! Every request this node sends, and every request a peer sends to it, is a
//! [`Transaction`] keyed by `(peer, id, origin)`. Each side numbers its own
//! requests, so an id is unique per peer and direction; the id of a request
//! is echoed by its response and matching is exact equality on the key.
//!
//! Local transactions (`Origin::Local`) live from [`XactManager::begin`]
//! until their response arrives or their retry budget runs out:
//!
//! ```text
//! Requested --retry timer--> Retrying --retry timer--> ... --> TimedOut
//!     \__________________________\_____response____________--> removed
//! ```
//!
//! Remote transactions (`Origin::Remote`) are created by an inbound request
//! and held for the peer's retransmission window. While held, a retransmitted
//! request is answered again from the cached response instead of reaching
//! the application twice.
//!
//! Timer expiries carry the [`XactRef`] of their transaction. An expiry whose
//! transaction is gone, or whose timer has been replaced since it was armed,
//! is reported as [`TimeoutOutcome::Stale`] and changes nothing.

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    config::XactConfig,
    event::TimerContext,
    message::{self, MessageError, MessageKind, PeerId, SocketId, XactHeader, HEADER_LEN},
    timer::{TimerError, TimerHandle, TimerService},
    transport::Transmit,
    util::{Arena, Handle, TimeSource},
};

/// Reference to a live transaction; stops resolving once it is removed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct XactRef(Handle);

impl fmt::Debug for XactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xact:{:?}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// Request issued by this node.
    Local,
    /// Request issued by the peer.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XactKey {
    pub peer: PeerId,
    pub id: u32,
    pub origin: Origin,
}

impl fmt::Display for XactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            Origin::Local => "local",
            Origin::Remote => "remote",
        };
        write!(f, "{origin} {:#x}@{}", self.id, self.peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactState {
    Requested,
    Retrying,
    Responded,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum XactError {
    #[error("no transaction id available for peer {peer}")]
    AllocationExhausted { peer: PeerId },
    #[error("transaction table full, capacity: {capacity}")]
    TableFull { capacity: usize },
    #[error("unknown transaction")]
    UnknownTransaction,
    #[error("cannot {action} transaction {key} in state {state:?}")]
    InvalidState {
        key: XactKey,
        state: XactState,
        action: &'static str,
    },
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Encode(#[from] MessageError),
}

#[derive(Debug)]
pub struct Transaction {
    key: XactKey,
    socket: SocketId,
    /// The request as it went over the wire, header included.
    request: Bytes,
    /// Encoded answer to a remote request, replayed to retransmissions.
    response: Option<Bytes>,
    state: XactState,
    retries: u8,
    timer: Option<TimerHandle>,
}

impl Transaction {
    pub fn key(&self) -> XactKey {
        self.key
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn state(&self) -> XactState {
        self.state
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn request_body(&self) -> Bytes {
        self.request.slice(HEADER_LEN..)
    }

    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    fn finish(self) -> FinishedXact {
        FinishedXact {
            key: self.key,
            socket: self.socket,
            request: self.request.slice(HEADER_LEN..),
            state: self.state,
            retries: self.retries,
        }
    }
}

/// What is left of a transaction after it has been removed from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedXact {
    pub key: XactKey,
    pub socket: SocketId,
    /// Body of the original request.
    pub request: Bytes,
    pub state: XactState,
    pub retries: u8,
}

/// Classification of one inbound datagram.
#[derive(Debug)]
pub enum Inbound {
    /// First sight of a peer's request. The application should answer it with
    /// [`XactManager::respond`].
    NewRequest {
        xact: XactRef,
        key: XactKey,
        socket: SocketId,
        body: Bytes,
    },
    /// Answer to one of our requests; the transaction has been removed.
    MatchedResponse { request: FinishedXact, body: Bytes },
    /// Retransmission of a request already being handled. If it was
    /// answered, the cached response has been sent again.
    DuplicateRetransmission { key: XactKey, answered: bool },
    /// Response matching no live request of ours.
    Unsolicited { peer: PeerId, id: u32 },
    Malformed { peer: PeerId, error: MessageError },
    /// New request that could not be tracked.
    Rejected { key: XactKey, reason: XactError },
}

#[derive(Debug)]
pub enum TimeoutOutcome {
    /// The expiry no longer refers to a live timer; nothing changed.
    Stale,
    /// Request sent again, `attempt` counts retransmissions so far.
    Retransmitted { key: XactKey, attempt: u8 },
    /// Retry budget exhausted; the transaction has been removed.
    TimedOut(FinishedXact),
    /// Hold window of a remote transaction ended; it has been removed.
    Released { key: XactKey, answered: bool },
}

#[derive(Debug)]
struct PeerSpace {
    next_id: u32,
    live: usize,
}

pub struct XactManager<T> {
    config: XactConfig,
    transmit: T,
    table: Arena<Transaction>,
    index: HashMap<XactKey, XactRef>,
    peers: HashMap<PeerId, PeerSpace>,
}

impl<T: Transmit> XactManager<T> {
    pub fn new(config: XactConfig, transmit: T) -> Self {
        Self {
            table: Arena::with_capacity(config.capacity),
            index: HashMap::new(),
            peers: HashMap::new(),
            config,
            transmit,
        }
    }

    pub fn config(&self) -> &XactConfig {
        &self.config
    }

    pub fn transmitter(&self) -> &T {
        &self.transmit
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, xact: XactRef) -> Option<&Transaction> {
        self.table.get(xact.0)
    }

    pub fn find(&self, key: &XactKey) -> Option<XactRef> {
        self.index.get(key).copied()
    }

    /// Live transactions with `peer`, both directions.
    pub fn live_for(&self, peer: PeerId) -> usize {
        self.peers.get(&peer).map_or(0, |space| space.live)
    }

    /// Peers with live transactions or a remembered id cursor.
    pub fn tracked_peers(&self) -> usize {
        self.peers.len()
    }

    /// Sends a new request to `peer` and tracks it until answered or timed
    /// out. Returns the key carrying the allocated id.
    pub fn begin<C: TimeSource>(
        &mut self,
        timers: &mut TimerService<C>,
        socket: SocketId,
        peer: PeerId,
        body: &[u8],
    ) -> Result<XactKey, XactError> {
        if self.table.is_full() {
            return Err(XactError::TableFull {
                capacity: self.table.capacity(),
            });
        }
        let id = self.allocate_id(peer)?;
        let request = message::encode(
            XactHeader {
                kind: MessageKind::Request,
                id,
            },
            body,
        )?;
        let key = XactKey {
            peer,
            id,
            origin: Origin::Local,
        };
        let xact = self.insert(Transaction {
            key,
            socket,
            request: request.clone(),
            response: None,
            state: XactState::Requested,
            retries: 0,
            timer: None,
        })?;
        match timers.arm_in(TimerContext::Transaction(xact), self.config.retry_interval()) {
            Ok(timer) => self.set_timer(xact, timer),
            Err(err) => {
                self.release(xact);
                return Err(err.into());
            }
        }
        debug!(%key, len = body.len(), "request sent");
        self.send(socket, peer, request);
        Ok(key)
    }

    /// Classifies a datagram received on `socket` from `peer`.
    pub fn receive<C: TimeSource>(
        &mut self,
        timers: &mut TimerService<C>,
        socket: SocketId,
        peer: PeerId,
        raw: Bytes,
    ) -> Inbound {
        let (header, body) = match message::decode(&raw) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(%peer, %socket, len = raw.len(), %error, "malformed message dropped");
                return Inbound::Malformed { peer, error };
            }
        };
        match header.kind {
            MessageKind::Request => self.receive_request(timers, socket, peer, header.id, raw, body),
            MessageKind::Response => self.receive_response(timers, peer, header.id, body),
        }
    }

    fn receive_request<C: TimeSource>(
        &mut self,
        timers: &mut TimerService<C>,
        socket: SocketId,
        peer: PeerId,
        id: u32,
        raw: Bytes,
        body: Bytes,
    ) -> Inbound {
        let key = XactKey {
            peer,
            id,
            origin: Origin::Remote,
        };
        if let Some(xact) = self.find(&key) {
            let cached = self.table.get(xact.0).and_then(|tx| tx.response.clone());
            let answered = cached.is_some();
            match cached {
                Some(response) => {
                    debug!(%key, "retransmitted request, answering from cache");
                    self.send(socket, peer, response);
                }
                None => debug!(%key, "retransmitted request still pending"),
            }
            return Inbound::DuplicateRetransmission { key, answered };
        }

        if self.live_for(peer) >= self.config.max_per_peer {
            warn!(%key, "too many transactions with peer, request rejected");
            return Inbound::Rejected {
                key,
                reason: XactError::AllocationExhausted { peer },
            };
        }
        let tracked = self.insert(Transaction {
            key,
            socket,
            request: raw,
            response: None,
            state: XactState::Requested,
            retries: 0,
            timer: None,
        });
        let xact = match tracked {
            Ok(xact) => xact,
            Err(reason) => {
                warn!(%key, %reason, "request rejected");
                return Inbound::Rejected { key, reason };
            }
        };
        match timers.arm_in(TimerContext::Transaction(xact), self.config.hold()) {
            Ok(timer) => self.set_timer(xact, timer),
            Err(err) => {
                self.release(xact);
                warn!(%key, %err, "request rejected");
                return Inbound::Rejected {
                    key,
                    reason: err.into(),
                };
            }
        }
        trace!(%key, len = body.len(), "new request");
        Inbound::NewRequest {
            xact,
            key,
            socket,
            body,
        }
    }

    fn receive_response<C: TimeSource>(
        &mut self,
        timers: &mut TimerService<C>,
        peer: PeerId,
        id: u32,
        body: Bytes,
    ) -> Inbound {
        let key = XactKey {
            peer,
            id,
            origin: Origin::Local,
        };
        let Some(tx) = self.find(&key).and_then(|xact| self.release(xact)) else {
            warn!(%peer, xact_id = id, "unsolicited response dropped");
            return Inbound::Unsolicited { peer, id };
        };
        if let Some(timer) = tx.timer {
            timers.disarm(timer);
        }
        debug!(%key, retries = tx.retries, "response matched");
        Inbound::MatchedResponse {
            request: tx.finish(),
            body,
        }
    }

    /// Answers a remote request. The response is cached and replayed to
    /// retransmissions of the request until the hold window ends.
    pub fn respond<C: TimeSource>(
        &mut self,
        timers: &mut TimerService<C>,
        xact: XactRef,
        body: &[u8],
    ) -> Result<XactKey, XactError> {
        let tx = self
            .table
            .get_mut(xact.0)
            .ok_or(XactError::UnknownTransaction)?;
        if tx.key.origin != Origin::Remote || tx.state != XactState::Requested {
            return Err(XactError::InvalidState {
                key: tx.key,
                state: tx.state,
                action: "respond to",
            });
        }
        let response = message::encode(
            XactHeader {
                kind: MessageKind::Response,
                id: tx.key.id,
            },
            body,
        )?;
        tx.response = Some(response.clone());
        tx.state = XactState::Responded;
        let (key, socket, previous) = (tx.key, tx.socket, tx.timer.take());
        if let Some(timer) = previous {
            timers.disarm(timer);
        }
        match timers.arm_in(TimerContext::Transaction(xact), self.config.hold()) {
            Ok(timer) => self.set_timer(xact, timer),
            Err(err) => {
                warn!(%key, %err, "cannot hold answered request, retransmissions will not be recognised");
                self.release(xact);
            }
        }
        debug!(%key, len = body.len(), "response sent");
        self.send(socket, key.peer, response);
        Ok(key)
    }

    /// Handles the expiry of `fired`, armed for `xact`.
    pub fn on_timeout<C: TimeSource>(
        &mut self,
        timers: &mut TimerService<C>,
        xact: XactRef,
        fired: TimerHandle,
    ) -> TimeoutOutcome {
        let Some(tx) = self.table.get_mut(xact.0) else {
            trace!(?xact, timer = %fired, "expiry for removed transaction ignored");
            return TimeoutOutcome::Stale;
        };
        if tx.timer != Some(fired) {
            trace!(key = %tx.key, timer = %fired, "expiry of replaced timer ignored");
            return TimeoutOutcome::Stale;
        }
        tx.timer = None;

        if tx.key.origin == Origin::Remote {
            let (key, answered) = (tx.key, tx.response.is_some());
            self.release(xact);
            if answered {
                trace!(%key, "hold window over");
            } else {
                debug!(%key, "request never answered, released");
            }
            return TimeoutOutcome::Released { key, answered };
        }

        if tx.retries >= self.config.max_retries {
            tx.state = XactState::TimedOut;
            return match self.release(xact) {
                Some(tx) => {
                    warn!(key = %tx.key, retries = tx.retries, "transaction timed out");
                    TimeoutOutcome::TimedOut(tx.finish())
                }
                None => TimeoutOutcome::Stale,
            };
        }

        tx.retries += 1;
        tx.state = XactState::Retrying;
        let (key, socket, request, attempt) = (tx.key, tx.socket, tx.request.clone(), tx.retries);
        match timers.arm_in(TimerContext::Transaction(xact), self.config.retry_interval()) {
            Ok(timer) => self.set_timer(xact, timer),
            Err(err) => {
                warn!(%key, %err, "cannot re-arm retry timer, giving up");
                return match self.release(xact) {
                    Some(mut tx) => {
                        tx.state = XactState::TimedOut;
                        TimeoutOutcome::TimedOut(tx.finish())
                    }
                    None => TimeoutOutcome::Stale,
                };
            }
        }
        debug!(%key, attempt, "retransmitting request");
        self.send(socket, key.peer, request);
        TimeoutOutcome::Retransmitted { key, attempt }
    }

    /// Drops every transaction and disarms its timer without reporting
    /// anything. Returns how many were discarded.
    pub fn finalize<C: TimeSource>(&mut self, timers: &mut TimerService<C>) -> usize {
        let discarded = self.table.drain();
        for timer in discarded.iter().filter_map(|tx| tx.timer) {
            timers.disarm(timer);
        }
        self.index.clear();
        self.peers.clear();
        if !discarded.is_empty() {
            debug!(count = discarded.len(), "in-flight transactions discarded");
        }
        discarded.len()
    }

    fn allocate_id(&mut self, peer: PeerId) -> Result<u32, XactError> {
        let (min, max) = (self.config.min_id, self.config.max_id);
        let index = &self.index;
        let space = self.peers.entry(peer).or_insert(PeerSpace {
            next_id: min,
            live: 0,
        });
        if space.live >= self.config.max_per_peer {
            return Err(XactError::AllocationExhausted { peer });
        }
        let span = u64::from(max - min) + 1;
        // at most `live` ids are taken, so `live + 1` candidates always include a
        // free one unless the whole space is in use
        let attempts = span.min(space.live as u64 + 1);
        let mut candidate = if (min..=max).contains(&space.next_id) {
            space.next_id
        } else {
            min
        };
        for _ in 0..attempts {
            let next = if candidate == max { min } else { candidate + 1 };
            let key = XactKey {
                peer,
                id: candidate,
                origin: Origin::Local,
            };
            if !index.contains_key(&key) {
                space.next_id = next;
                return Ok(candidate);
            }
            candidate = next;
        }
        Err(XactError::AllocationExhausted { peer })
    }

    fn insert(&mut self, tx: Transaction) -> Result<XactRef, XactError> {
        let key = tx.key;
        let handle = self.table.insert(tx).map_err(|_| XactError::TableFull {
            capacity: self.table.capacity(),
        })?;
        let xact = XactRef(handle);
        self.index.insert(key, xact);
        let min_id = self.config.min_id;
        self.peers
            .entry(key.peer)
            .or_insert(PeerSpace {
                next_id: min_id,
                live: 0,
            })
            .live += 1;
        Ok(xact)
    }

    fn release(&mut self, xact: XactRef) -> Option<Transaction> {
        let tx = self.table.remove(xact.0)?;
        self.index.remove(&tx.key);
        let min_id = self.config.min_id;
        if let Some(space) = self.peers.get_mut(&tx.key.peer) {
            space.live = space.live.saturating_sub(1);
            // an idle space still at the start of its range is the same as no space
            if space.live == 0 && space.next_id == min_id {
                self.peers.remove(&tx.key.peer);
            }
        }
        self.prune_idle_peers();
        Some(tx)
    }

    /// Idle peers keep their id cursor so a finished id is not reissued at
    /// once. Their number is bounded by the table capacity; past it every
    /// idle cursor is forgotten.
    fn prune_idle_peers(&mut self) {
        if self.peers.len() <= self.table.len() + self.config.capacity {
            return;
        }
        let before = self.peers.len();
        self.peers.retain(|_, space| space.live > 0);
        debug!(pruned = before - self.peers.len(), "idle peer id cursors dropped");
    }

    fn set_timer(&mut self, xact: XactRef, timer: TimerHandle) {
        if let Some(tx) = self.table.get_mut(xact.0) {
            tx.timer = Some(timer);
        }
    }

    fn send(&self, socket: SocketId, peer: PeerId, payload: Bytes) {
        if let Err(err) = self.transmit.transmit(socket, peer, payload) {
            // the retry timer covers a lost send like a lost datagram
            warn!(%peer, %socket, %err, "send failed");
        }
    }
}
