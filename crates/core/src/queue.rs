//! Bounded event queue feeding a node's event loop.
//!
//! Backed by `crossbeam::channel`. Any number of producers (socket readers,
//! the timer service, external callers) hold an [`EventSender`]; the node
//! thread owns the only [`EventReceiver`], which is deliberately not `Clone`.
//!
//! Posting waits at most `post_timeout` for space. When the queue stays full
//! the event is handed back in [`QueueError::Full`] so the producer decides
//! what to do with it; nothing is dropped silently.

use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, SendTimeoutError, TrySendError};

use crate::event::Event;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("event queue full, {} not delivered", .0.name())]
    Full(Event),
    #[error("event queue disconnected")]
    Disconnected,
}

/// Outcome of a timed receive.
#[derive(Debug)]
pub enum Received {
    Event(Event),
    /// The wait timed out with nothing queued.
    Empty,
}

/// The sending half of a node's event queue.
///
/// This can be cloned to create multiple producers.
#[derive(Clone)]
pub struct EventSender {
    inner: channel::Sender<Event>,
    post_timeout: Duration,
}

impl EventSender {
    /// Queues an event, waiting up to the configured post timeout for space.
    pub fn post(&self, event: Event) -> Result<(), QueueError> {
        match self.inner.send_timeout(event, self.post_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(event)) => Err(QueueError::Full(event)),
            Err(SendTimeoutError::Disconnected(_)) => Err(QueueError::Disconnected),
        }
    }

    /// Queues an event only if there is room right now.
    pub fn try_post(&self, event: Event) -> Result<(), QueueError> {
        match self.inner.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => Err(QueueError::Full(event)),
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Disconnected),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}

/// The receiving half of a node's event queue.
pub struct EventReceiver {
    inner: channel::Receiver<Event>,
}

impl EventReceiver {
    /// Blocks for at most `timeout` waiting for the next event.
    ///
    /// A timeout is the normal [`Received::Empty`] outcome, not an error.
    pub fn receive(&self, timeout: Duration) -> Result<Received, QueueError> {
        match self.inner.recv_timeout(timeout) {
            Ok(event) => Ok(Received::Event(event)),
            Err(RecvTimeoutError::Timeout) => Ok(Received::Empty),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Creates a node's event queue holding at most `capacity` events.
pub fn bounded(capacity: usize, post_timeout: Duration) -> (EventSender, EventReceiver) {
    let (tx, rx) = channel::bounded(capacity);
    (
        EventSender {
            inner: tx,
            post_timeout,
        },
        EventReceiver { inner: rx },
    )
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;
    use crate::event::{Signal, TimerContext, TimerExpiry};
    use crate::timer::TimerHandle;

    fn expiry(token: u64) -> Event {
        Event::TimerExpiry(TimerExpiry {
            timer: TimerHandle::detached(),
            context: TimerContext::Application(token),
        })
    }

    #[test]
    fn delivers_in_post_order() {
        let (tx, rx) = bounded(16, Duration::from_millis(10));
        for token in 0..10 {
            tx.post(expiry(token)).unwrap();
        }
        for token in 0..10 {
            match rx.receive(Duration::from_millis(10)).unwrap() {
                Received::Event(event) => assert_eq!(event, expiry(token)),
                Received::Empty => panic!("queue drained early"),
            }
        }
    }

    #[test]
    fn empty_after_timeout() {
        let (_tx, rx) = bounded(4, Duration::from_millis(10));
        let started = Instant::now();
        assert!(matches!(
            rx.receive(Duration::from_millis(20)).unwrap(),
            Received::Empty
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn full_queue_hands_event_back() {
        let (tx, _rx) = bounded(1, Duration::from_millis(5));
        tx.post(Event::Signal(Signal::Entry)).unwrap();
        match tx.post(Event::Signal(Signal::Exit)) {
            Err(QueueError::Full(event)) => assert_eq!(event, Event::Signal(Signal::Exit)),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            tx.try_post(expiry(1)),
            Err(QueueError::Full(_))
        ));
    }

    #[test]
    fn disconnect_is_reported_to_both_sides() {
        let (tx, rx) = bounded(1, Duration::from_millis(5));
        drop(rx);
        assert!(matches!(
            tx.post(expiry(0)),
            Err(QueueError::Disconnected)
        ));

        let (tx, rx) = bounded(1, Duration::from_millis(5));
        drop(tx);
        assert!(matches!(
            rx.receive(Duration::from_millis(5)),
            Err(QueueError::Disconnected)
        ));
    }

    #[test]
    fn producers_on_other_threads() {
        let (tx, rx) = bounded(64, Duration::from_millis(50));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..8 {
                        tx.post(expiry(p * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let mut per_producer = vec![Vec::new(); 4];
        while let Received::Event(Event::TimerExpiry(e)) =
            rx.receive(Duration::from_millis(5)).unwrap()
        {
            let TimerContext::Application(token) = e.context else {
                unreachable!()
            };
            per_producer[(token / 100) as usize].push(token % 100);
        }
        for seen in per_producer {
            assert_eq!(seen, (0..8).collect::<Vec<_>>());
        }
    }
}
