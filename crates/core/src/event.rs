//! Events consumed by a node's event loop.

use std::fmt;

use crate::{message::Datagram, timer::TimerHandle, xact::XactRef};

/// FSM lifecycle marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Entry,
    Exit,
}

/// Owner-supplied payload of a timer, handed back when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerContext {
    /// Retry or hold timer of a transaction, armed by the transaction manager.
    Transaction(XactRef),
    /// Timer armed by the protocol running on the node.
    Application(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    pub timer: TimerHandle,
    pub context: TimerContext,
}

/// Every input of the event loop.
///
/// Events move from their producer through the queue to the single consumer;
/// nothing else holds on to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Signal(Signal),
    Message(Datagram),
    TimerExpiry(TimerExpiry),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Signal(Signal::Entry) => "signal:entry",
            Event::Signal(Signal::Exit) => "signal:exit",
            Event::Message(_) => "message",
            Event::TimerExpiry(TimerExpiry {
                context: TimerContext::Transaction(_),
                ..
            }) => "timer:transaction",
            Event::TimerExpiry(TimerExpiry {
                context: TimerContext::Application(_),
                ..
            }) => "timer:application",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Message(datagram) => write!(
                f,
                "message from {} on {} ({} bytes)",
                datagram.peer,
                datagram.socket,
                datagram.payload.len()
            ),
            Event::TimerExpiry(expiry) => write!(f, "{} ({})", self.name(), expiry.timer),
            Event::Signal(_) => f.write_str(self.name()),
        }
    }
}
