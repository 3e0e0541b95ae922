//! Per-node timer service.
//!
//! Timers live in a fixed-capacity [`Arena`] and are addressed by a
//! generation-tagged [`TimerHandle`]. The service never fires callbacks
//! itself: each call to [`TimerService::service`] turns expired timers into
//! [`Event::TimerExpiry`] events on the node's queue, so expiry handling runs
//! on the node thread like every other input.
//!
//! A handle outlives its timer. Disarming an already-fired or already-retired
//! timer is a no-op, and the consumer of an expiry event must re-check that
//! whatever the context refers to is still alive.

use std::{
    fmt,
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use crate::{
    event::{Event, TimerContext, TimerExpiry},
    queue::{EventSender, QueueError},
    util::{Arena, Handle, InstantTimeSrc, TimeSource},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(Handle);

impl TimerHandle {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        TimerHandle(Handle::dangling())
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{:?}", self.0)
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    /// Rescheduled `period` after each expiry until disarmed.
    Periodic(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("timer pool exhausted, capacity: {capacity}")]
    PoolExhausted { capacity: usize },
}

#[derive(Debug)]
struct Timer {
    deadline: Instant,
    kind: TimerKind,
    context: TimerContext,
}

pub struct TimerService<T: TimeSource = InstantTimeSrc> {
    timers: Arena<Timer>,
    clock: T,
    fired: u64,
}

impl TimerService<InstantTimeSrc> {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, InstantTimeSrc::new())
    }
}

impl<T: TimeSource> TimerService<T> {
    pub fn with_clock(capacity: usize, clock: T) -> Self {
        Self {
            timers: Arena::with_capacity(capacity),
            clock,
            fired: 0,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Arms a timer expiring at `deadline`. The context names the owner and
    /// is returned verbatim in the expiry event.
    pub fn arm(
        &mut self,
        context: TimerContext,
        deadline: Instant,
        kind: TimerKind,
    ) -> Result<TimerHandle, TimerError> {
        let timer = Timer {
            deadline,
            kind,
            context,
        };
        match self.timers.insert(timer) {
            Ok(handle) => Ok(TimerHandle(handle)),
            Err(_) => Err(TimerError::PoolExhausted {
                capacity: self.timers.capacity(),
            }),
        }
    }

    /// Arms a one-shot timer `delay` from now.
    pub fn arm_in(
        &mut self,
        context: TimerContext,
        delay: Duration,
    ) -> Result<TimerHandle, TimerError> {
        let deadline = self.clock.now() + delay;
        self.arm(context, deadline, TimerKind::OneShot)
    }

    /// Returns whether the timer was still armed.
    pub fn disarm(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(handle.0).is_some()
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.timers.contains(handle.0)
    }

    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.timers.get(handle.0).map(|t| t.deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Total expiry events posted since creation.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Posts an expiry event for every timer due at `now`, earliest deadline
    /// first. One-shot timers are retired, periodic ones rescheduled.
    ///
    /// Never waits for queue space: the caller is the queue's only consumer.
    /// If the queue refuses an event the timer stays armed and is retried on
    /// the next call; the remaining due timers are left for that call too.
    pub fn service(&mut self, now: Instant, queue: &EventSender) -> usize {
        let mut due: Vec<(Instant, Handle)> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(handle, timer)| (timer.deadline, handle))
            .collect();
        due.sort_unstable();

        let mut posted = 0;
        for (_, handle) in due {
            let Some((kind, context)) = self.timers.get(handle).map(|t| (t.kind, t.context))
            else {
                continue;
            };
            let expiry = TimerExpiry {
                timer: TimerHandle(handle),
                context,
            };
            match queue.try_post(Event::TimerExpiry(expiry)) {
                Ok(()) => {}
                Err(QueueError::Full(_)) => {
                    warn!(timer = %expiry.timer, "event queue full, deferring timer expiry");
                    break;
                }
                Err(QueueError::Disconnected) => {
                    warn!("event queue disconnected while servicing timers");
                    break;
                }
            }
            trace!(timer = %expiry.timer, context = ?expiry.context, "timer expired");
            posted += 1;
            self.fired += 1;
            match kind {
                TimerKind::OneShot => {
                    self.timers.remove(handle);
                }
                TimerKind::Periodic(period) => {
                    if let Some(timer) = self.timers.get_mut(handle) {
                        timer.deadline += period;
                        if timer.deadline <= now {
                            // fell behind by more than a period, skip the missed ticks
                            timer.deadline = now + period;
                        }
                    }
                }
            }
        }
        posted
    }

    /// Disarms everything.
    pub fn clear(&mut self) -> usize {
        self.timers.drain().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{self, EventReceiver, Received},
        util::MockTimeSource,
    };

    fn setup() -> (TimerService<MockTimeSource>, MockTimeSource, EventSender, EventReceiver) {
        let clock = MockTimeSource::new(Instant::now());
        let timers = TimerService::with_clock(8, clock.clone());
        let (tx, rx) = queue::bounded(32, Duration::from_millis(1));
        (timers, clock, tx, rx)
    }

    fn drain(rx: &EventReceiver) -> Vec<TimerExpiry> {
        let mut out = Vec::new();
        while let Ok(Received::Event(Event::TimerExpiry(e))) = rx.receive(Duration::ZERO) {
            out.push(e);
        }
        out
    }

    #[test]
    fn one_shot_fires_once_then_retires() {
        let (mut timers, clock, tx, rx) = setup();
        let handle = timers
            .arm_in(TimerContext::Application(7), Duration::from_millis(10))
            .unwrap();

        clock.advance_time(Duration::from_millis(9));
        assert_eq!(timers.service(clock.now(), &tx), 0);

        clock.advance_time(Duration::from_millis(1));
        assert_eq!(timers.service(clock.now(), &tx), 1);
        let fired = drain(&rx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].timer, handle);
        assert_eq!(fired[0].context, TimerContext::Application(7));
        assert!(!timers.is_armed(handle));

        clock.advance_time(Duration::from_millis(50));
        assert_eq!(timers.service(clock.now(), &tx), 0);
    }

    #[test]
    fn periodic_reschedules_relative_to_deadline() {
        let (mut timers, clock, tx, rx) = setup();
        let start = clock.now();
        let period = Duration::from_millis(10);
        let handle = timers
            .arm(
                TimerContext::Application(1),
                start + period,
                TimerKind::Periodic(period),
            )
            .unwrap();
        for tick in 1..=3u32 {
            clock.advance_time(period);
            assert_eq!(timers.service(clock.now(), &tx), 1);
            assert_eq!(timers.deadline(handle), Some(start + period * (tick + 1)));
        }
        assert_eq!(drain(&rx).len(), 3);
        assert!(timers.disarm(handle));
        clock.advance_time(period);
        assert_eq!(timers.service(clock.now(), &tx), 0);
    }

    #[test]
    fn due_timers_post_in_deadline_order() {
        let (mut timers, clock, tx, rx) = setup();
        let now = clock.now();
        for (token, ms) in [(3u64, 30u64), (1, 10), (2, 20)] {
            timers
                .arm(
                    TimerContext::Application(token),
                    now + Duration::from_millis(ms),
                    TimerKind::OneShot,
                )
                .unwrap();
        }
        clock.advance_time(Duration::from_millis(30));
        timers.service(clock.now(), &tx);
        let order: Vec<_> = drain(&rx)
            .into_iter()
            .map(|e| match e.context {
                TimerContext::Application(token) => token,
                TimerContext::Transaction(_) => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn disarm_is_idempotent_and_late_safe() {
        let (mut timers, clock, tx, rx) = setup();
        let handle = timers
            .arm_in(TimerContext::Application(0), Duration::from_millis(1))
            .unwrap();
        clock.advance_time(Duration::from_millis(1));
        timers.service(clock.now(), &tx);
        // expiry already queued; disarming now must not fail
        assert!(!timers.disarm(handle));
        assert!(!timers.disarm(handle));
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let (mut timers, _clock, _tx, _rx) = setup();
        for i in 0..8 {
            timers
                .arm_in(TimerContext::Application(i), Duration::from_secs(1))
                .unwrap();
        }
        assert!(matches!(
            timers.arm_in(TimerContext::Application(9), Duration::from_secs(1)),
            Err(TimerError::PoolExhausted { capacity: 8 })
        ));
    }

    #[test]
    fn full_queue_defers_expiry() {
        let clock = MockTimeSource::new(Instant::now());
        let mut timers = TimerService::with_clock(4, clock.clone());
        let (tx, rx) = queue::bounded(1, Duration::from_millis(1));
        let first = timers
            .arm_in(TimerContext::Application(1), Duration::from_millis(1))
            .unwrap();
        let second = timers
            .arm_in(TimerContext::Application(2), Duration::from_millis(2))
            .unwrap();
        clock.advance_time(Duration::from_millis(5));

        assert_eq!(timers.service(clock.now(), &tx), 1);
        assert!(!timers.is_armed(first));
        assert!(timers.is_armed(second));

        assert_eq!(drain(&rx).len(), 1);
        assert_eq!(timers.service(clock.now(), &tx), 1);
        assert!(!timers.is_armed(second));
    }

    #[test]
    fn full_queue_does_not_block_servicing() {
        let clock = MockTimeSource::new(Instant::now());
        let mut timers = TimerService::with_clock(4, clock.clone());
        let (tx, rx) = queue::bounded(1, Duration::from_secs(5));
        tx.post(Event::TimerExpiry(TimerExpiry {
            timer: TimerHandle::detached(),
            context: TimerContext::Application(0),
        }))
        .unwrap();
        let pending = timers
            .arm_in(TimerContext::Application(1), Duration::from_millis(1))
            .unwrap();
        clock.advance_time(Duration::from_millis(2));

        let started = Instant::now();
        assert_eq!(timers.service(clock.now(), &tx), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(timers.is_armed(pending));

        assert_eq!(drain(&rx).len(), 1);
        assert_eq!(timers.service(clock.now(), &tx), 1);
        assert!(!timers.is_armed(pending));
    }
}
