//! Generic finite state machine with arrival handlers and wildcard events.
//!
//! DESIGN
//! ======
//! Transitions are keyed by `(state, event)`; wildcard transitions are keyed
//! by event alone and win over state-specific ones. Feeding an event with no
//! matching transition is a silent no-op. After a transition, every arrival
//! handler registered for the new state runs in registration order.
//!
//! Handlers never call [`Fsm::feed`] themselves. They push follow-up events
//! onto the [`Queue`] they are handed, and the single driver loop in `feed`
//! drains that queue FIFO once the current transition and its arrival
//! handlers have finished.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Follow-up events requested by handlers during a `feed` call.
pub struct Queue<E, A> {
    pending: VecDeque<(E, A)>,
}

impl<E, A> Queue<E, A> {
    fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    /// Schedule `event` to be fed after the current handlers return.
    pub fn push(&mut self, event: E, arg: A) {
        self.pending.push_back((event, arg));
    }

    fn pop(&mut self) -> Option<(E, A)> {
        self.pending.pop_front()
    }
}

type Transition<S, E, A, C> = Box<dyn FnMut(&mut C, &A, &mut Queue<E, A>) -> S>;
type Arrival<E, A, C> = Box<dyn FnMut(&mut C, &A, &mut Queue<E, A>)>;

/// State machine over states `S` and events `E`. Handlers receive the owner's
/// context `C` and the event argument `A`.
pub struct Fsm<S, E, A, C> {
    state: S,
    transitions: HashMap<(S, E), Transition<S, E, A, C>>,
    wilds: HashMap<E, Transition<S, E, A, C>>,
    arrivals: HashMap<S, Vec<Arrival<E, A, C>>>,
}

impl<S, E, A, C> Fsm<S, E, A, C>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    #[must_use]
    pub fn new(start: S) -> Self {
        Self {
            state: start,
            transitions: HashMap::new(),
            wilds: HashMap::new(),
            arrivals: HashMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> S {
        self.state
    }

    /// Run `handler` whenever the machine enters `state`. Not run for the
    /// start state at construction.
    pub fn on(&mut self, state: S, handler: impl FnMut(&mut C, &A, &mut Queue<E, A>) + 'static) {
        self.arrivals.entry(state).or_default().push(Box::new(handler));
    }

    /// Register the transition taken when `event` is fed in state `from`.
    /// The handler returns the next state.
    pub fn act(
        &mut self,
        from: S,
        event: E,
        handler: impl FnMut(&mut C, &A, &mut Queue<E, A>) -> S + 'static,
    ) {
        self.transitions.insert((from, event), Box::new(handler));
    }

    /// Register a transition for `event` in every state.
    pub fn wild_act(
        &mut self,
        event: E,
        handler: impl FnMut(&mut C, &A, &mut Queue<E, A>) -> S + 'static,
    ) {
        self.wilds.insert(event, Box::new(handler));
    }

    /// Feed an event, then any follow-ups the handlers queued.
    pub fn feed(&mut self, ctx: &mut C, event: E, arg: A) {
        let mut queue = Queue::new();
        queue.push(event, arg);
        while let Some((event, arg)) = queue.pop() {
            self.step(ctx, event, &arg, &mut queue);
        }
    }

    fn step(&mut self, ctx: &mut C, event: E, arg: &A, queue: &mut Queue<E, A>) {
        let next = if let Some(handler) = self.wilds.get_mut(&event) {
            handler(ctx, arg, queue)
        } else if let Some(handler) = self.transitions.get_mut(&(self.state, event)) {
            handler(ctx, arg, queue)
        } else {
            return;
        };

        self.state = next;
        if let Some(handlers) = self.arrivals.get_mut(&next) {
            for handler in handlers {
                handler(ctx, arg, queue);
            }
        }
    }
}

#[cfg(test)]
#[path = "fsm_test.rs"]
mod tests;
