//! Control-plane network function runtime.
//!
//! Each node runs one thread with an event loop that feeds a state machine.
//! Datagrams from peers and timer expiries arrive through a bounded queue.
//! A transaction manager pairs requests with responses, retransmits requests
//! that go unanswered and gives up after a bounded number of retries.

/// Node configuration.
pub mod config;

/// Events consumed by the node event loop.
pub mod event;

/// Generic state machine engine.
pub mod fsm;

/// Peer identities, datagrams and the transaction header codec.
pub mod message;

/// Node lifecycle, event loop and the protocol callback surface.
pub mod node;
pub use node::{
    EventLoopExitReason, IncomingRequest, Node, NodeCx, NodeError, NodeHandle, Protocol,
    StatsSnapshot,
};

/// Bounded inter-thread mailbox feeding the event loop.
pub mod queue;

/// Service based interface registry and its HTTP backends.
pub mod sbi;

/// Per-node timers.
pub mod timer;

/// Tracing subscriber setup.
pub mod tracing;

/// UDP signalling paths.
pub mod transport;

pub mod util;

/// Request/response transaction tracking.
pub mod xact;
