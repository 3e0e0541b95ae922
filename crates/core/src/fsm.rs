//! Generic finite state machine engine.
//!
//! A [`State`] is three plain function pointers over a caller-owned context
//! `C`. The engine owns no protocol logic: it only tracks which state is
//! current and runs entry/exit handlers around transitions.
//!
//! Handlers request a transition by returning [`Transition::To`] instead of
//! switching state themselves. The engine applies it after the handler has
//! returned (`exit(current)`, `current = target`, `entry(target)`), so a
//! transition can never start while another one is half done.
//!
//! ```ignore
//! fn idle_entry(cx: &mut Ctx) -> Transition<Ctx> { Transition::To(running()) }
//! let mut fsm = Fsm::new(idle(), stopped());
//! fsm.init(&mut cx);            // entry(idle) -> exit(idle) -> entry(running)
//! fsm.dispatch(&mut cx, event); // running.on_event
//! fsm.finalize(&mut cx);        // exit(running) -> entry(stopped)
//! ```

use std::fmt;

use tracing::{error, trace, warn};

use crate::event::{Event, Signal};

/// Bound on transitions requested back to back from entry handlers.
const MAX_CHAINED_TRANSITIONS: usize = 16;

pub enum Transition<C> {
    Stay,
    To(State<C>),
}

pub struct State<C> {
    pub name: &'static str,
    pub on_entry: fn(&mut C) -> Transition<C>,
    pub on_exit: fn(&mut C),
    pub on_event: fn(&mut C, Event) -> Transition<C>,
}

impl<C> State<C> {
    /// A state whose handlers do nothing. Useful as a terminal sink.
    pub fn sink(name: &'static str) -> Self {
        fn stay<C>(_: &mut C) -> Transition<C> {
            Transition::Stay
        }
        fn nothing<C>(_: &mut C) {}
        fn ignore<C>(_: &mut C, _: Event) -> Transition<C> {
            Transition::Stay
        }
        State {
            name,
            on_entry: stay::<C>,
            on_exit: nothing::<C>,
            on_event: ignore::<C>,
        }
    }
}

// Manual impls: the derives would needlessly require `C: Clone`.
impl<C> Clone for State<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for State<C> {}

impl<C> fmt::Debug for State<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Finished,
}

pub struct Fsm<C> {
    current: State<C>,
    initial: State<C>,
    terminal: State<C>,
    phase: Phase,
    transitions: u64,
}

impl<C> Fsm<C> {
    pub fn new(initial: State<C>, terminal: State<C>) -> Self {
        Self {
            current: initial,
            initial,
            terminal,
            phase: Phase::Created,
            transitions: 0,
        }
    }

    /// Name of the active state.
    pub fn state(&self) -> &'static str {
        self.current.name
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// Number of completed state changes.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Enters the initial state, following any transitions its entry
    /// handler requests.
    pub fn init(&mut self, cx: &mut C) {
        if self.phase != Phase::Created {
            warn!(state = self.current.name, "state machine already initialised");
            return;
        }
        self.phase = Phase::Running;
        self.current = self.initial;
        trace!(state = self.current.name, signal = ?Signal::Entry, "fsm");
        let next = (self.current.on_entry)(cx);
        self.follow(cx, next);
    }

    /// Hands one event to the current state's handler.
    pub fn dispatch(&mut self, cx: &mut C, event: Event) {
        if self.phase != Phase::Running {
            warn!(state = self.current.name, event = event.name(), "dispatch outside running machine");
            return;
        }
        trace!(state = self.current.name, event = event.name(), "fsm dispatch");
        let next = (self.current.on_event)(cx, event);
        self.follow(cx, next);
    }

    /// Leaves the current state and enters the terminal one. Transitions
    /// requested by the terminal state's entry handler are ignored.
    pub fn finalize(&mut self, cx: &mut C) {
        if self.phase != Phase::Running {
            return;
        }
        trace!(state = self.current.name, signal = ?Signal::Exit, "fsm");
        (self.current.on_exit)(cx);
        self.current = self.terminal;
        self.transitions += 1;
        self.phase = Phase::Finished;
        trace!(state = self.current.name, signal = ?Signal::Entry, "fsm");
        if let Transition::To(target) = (self.current.on_entry)(cx) {
            warn!(target = target.name, "terminal state requested a transition, ignored");
        }
    }

    fn follow(&mut self, cx: &mut C, mut next: Transition<C>) {
        for _ in 0..MAX_CHAINED_TRANSITIONS {
            let Transition::To(target) = next else {
                return;
            };
            trace!(from = self.current.name, to = target.name, "fsm transition");
            (self.current.on_exit)(cx);
            self.current = target;
            self.transitions += 1;
            next = (self.current.on_entry)(cx);
        }
        if let Transition::To(target) = next {
            error!(
                state = self.current.name,
                target = target.name,
                "too many chained transitions, staying in current state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{TimerContext, TimerExpiry};
    use crate::timer::TimerHandle;

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
    }

    fn tick(token: u64) -> Event {
        Event::TimerExpiry(TimerExpiry {
            timer: TimerHandle::detached(),
            context: TimerContext::Application(token),
        })
    }

    fn token_of(event: &Event) -> u64 {
        match event {
            Event::TimerExpiry(TimerExpiry {
                context: TimerContext::Application(token),
                ..
            }) => *token,
            _ => u64::MAX,
        }
    }

    fn initial() -> State<Recorder> {
        State {
            name: "initial",
            on_entry: |r| {
                r.log.push("entry:initial".into());
                Transition::To(idle())
            },
            on_exit: |r| r.log.push("exit:initial".into()),
            on_event: |_, _| Transition::Stay,
        }
    }

    fn idle() -> State<Recorder> {
        State {
            name: "idle",
            on_entry: |r| {
                r.log.push("entry:idle".into());
                Transition::Stay
            },
            on_exit: |r| r.log.push("exit:idle".into()),
            on_event: |r, e| {
                let token = token_of(&e);
                r.log.push(format!("idle:{token}"));
                if token == 99 {
                    Transition::To(busy())
                } else {
                    Transition::Stay
                }
            },
        }
    }

    fn busy() -> State<Recorder> {
        State {
            name: "busy",
            on_entry: |r| {
                r.log.push("entry:busy".into());
                Transition::Stay
            },
            on_exit: |r| r.log.push("exit:busy".into()),
            on_event: |r, e| {
                r.log.push(format!("busy:{}", token_of(&e)));
                Transition::To(idle())
            },
        }
    }

    fn terminal() -> State<Recorder> {
        State {
            name: "final",
            on_entry: |r| {
                r.log.push("entry:final".into());
                Transition::To(idle())
            },
            on_exit: |r| r.log.push("exit:final".into()),
            on_event: |_, _| Transition::Stay,
        }
    }

    #[test]
    fn init_follows_entry_transition() {
        let mut recorder = Recorder::default();
        let mut fsm = Fsm::new(initial(), terminal());
        fsm.init(&mut recorder);
        assert_eq!(fsm.state(), "idle");
        assert_eq!(
            recorder.log,
            vec!["entry:initial", "exit:initial", "entry:idle"]
        );
    }

    #[test]
    fn exit_runs_before_entry_once_per_transition() {
        let mut recorder = Recorder::default();
        let mut fsm = Fsm::new(initial(), terminal());
        fsm.init(&mut recorder);
        recorder.log.clear();

        for token in [1, 99, 2, 3] {
            fsm.dispatch(&mut recorder, tick(token));
        }
        fsm.finalize(&mut recorder);

        assert_eq!(
            recorder.log,
            vec![
                "idle:1",
                "idle:99",
                "exit:idle",
                "entry:busy",
                "busy:2",
                "exit:busy",
                "entry:idle",
                "idle:3",
                "exit:idle",
                "entry:final",
            ]
        );
        assert_eq!(fsm.state(), "final");
        // initial -> idle, idle -> busy, busy -> idle, idle -> final
        assert_eq!(fsm.transitions(), 4);
    }

    #[test]
    fn events_after_finalize_are_ignored() {
        let mut recorder = Recorder::default();
        let mut fsm = Fsm::new(initial(), terminal());
        fsm.init(&mut recorder);
        fsm.finalize(&mut recorder);
        let before = recorder.log.len();
        fsm.dispatch(&mut recorder, tick(5));
        fsm.finalize(&mut recorder);
        assert_eq!(recorder.log.len(), before);
        assert!(!fsm.is_running());
    }

    #[test]
    fn dispatch_before_init_is_ignored() {
        let mut recorder = Recorder::default();
        let mut fsm = Fsm::new(initial(), terminal());
        fsm.dispatch(&mut recorder, tick(1));
        assert!(recorder.log.is_empty());
        assert_eq!(fsm.state(), "initial");
    }

    #[test]
    fn runaway_entry_chain_is_cut() {
        fn ping() -> State<Recorder> {
            State {
                name: "ping",
                on_entry: |r| {
                    r.log.push("ping".into());
                    Transition::To(pong())
                },
                on_exit: |_| {},
                on_event: |_, _| Transition::Stay,
            }
        }
        fn pong() -> State<Recorder> {
            State {
                name: "pong",
                on_entry: |r| {
                    r.log.push("pong".into());
                    Transition::To(ping())
                },
                on_exit: |_| {},
                on_event: |_, _| Transition::Stay,
            }
        }
        let mut recorder = Recorder::default();
        let mut fsm = Fsm::new(ping(), State::sink("done"));
        fsm.init(&mut recorder);
        assert_eq!(recorder.log.len(), MAX_CHAINED_TRANSITIONS + 1);
        assert!(fsm.is_running());
    }
}
