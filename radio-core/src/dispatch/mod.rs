//! Table-driven dispatch shared by every lifecycle tier.
//!
//! Each tier describes itself as a [`StateMachine`]: a pure transition table
//! keyed by `(state, event)` plus an action executor. [`dispatch`] runs one
//! external event and every follow-up or raised event it produces in a single
//! iterative chain. The state is committed before the action runs, so an
//! action always observes the state it is moving into.

use core::fmt;

use crate::telemetry::Traceable;

/// Outcome of a request that was accepted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Completion {
    /// The operation finished inside the call.
    Success,
    /// The operation continues; completion arrives later through a notice.
    Pending,
}

/// Result carried by a finished operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

/// What an action asks the engine to do next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step<E> {
    /// Continue with the table's follow-up event, if any.
    Done,
    /// Stop here; the operation completes asynchronously.
    Pending,
    /// Continue with this event instead of the follow-up.
    Raise(E),
}

/// Broken internal assumption reported by an action.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fault(pub &'static str);

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// One row of a transition table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transition<S, E, A> {
    pub action: A,
    pub next: S,
    pub follow_up: Option<E>,
}

impl<S, E, A> Transition<S, E, A> {
    /// Creates a row with no follow-up event.
    #[must_use]
    pub const fn to(next: S, action: A) -> Self {
        Self {
            action,
            next,
            follow_up: None,
        }
    }

    /// Adds the event dispatched after the action reports [`Step::Done`].
    #[must_use]
    pub fn then(mut self, follow_up: E) -> Self {
        self.follow_up = Some(follow_up);
        self
    }
}

/// The first event of a dispatch had no row for the current state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DispatchError<S, E> {
    pub state: S,
    pub event: E,
}

impl<S: fmt::Debug, E: fmt::Debug> fmt::Display for DispatchError<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition for {:?} in {:?}", self.event, self.state)
    }
}

impl<S: fmt::Debug, E: fmt::Debug> core::error::Error for DispatchError<S, E> {}

/// A tier driven by [`dispatch`].
pub trait StateMachine {
    /// Tier name used in log lines.
    const TIER: &'static str;

    type State: Copy + Eq + Traceable;
    type Event: Copy + Eq + Traceable;
    type Action: Copy + Traceable;
    type Context<'c>;

    fn state(&self) -> Self::State;

    fn enter(&mut self, next: Self::State);

    /// Pure table lookup.
    fn transition(
        state: Self::State,
        event: Self::Event,
    ) -> Option<Transition<Self::State, Self::Event, Self::Action>>;

    fn perform(
        &mut self,
        action: Self::Action,
        ctx: &mut Self::Context<'_>,
    ) -> Result<Step<Self::Event>, Fault>;

    /// Called when an action leaves the operation pending.
    fn mark_async(&mut self);

    /// Hook for journaling a committed transition.
    fn observe(
        &self,
        _ctx: &mut Self::Context<'_>,
        _from: Self::State,
        _event: Self::Event,
        _to: Self::State,
    ) {
    }
}

/// Runs `event` through `machine` until the chain settles or goes pending.
///
/// # Errors
///
/// Returns [`DispatchError`] when `event` has no row for the current state.
/// The machine is left untouched in that case.
///
/// # Panics
///
/// Panics when a follow-up or raised event has no row, or when an action
/// reports a [`Fault`]. Both mean the table and its actions disagree.
pub fn dispatch<M: StateMachine>(
    machine: &mut M,
    event: M::Event,
    ctx: &mut M::Context<'_>,
) -> Result<Completion, DispatchError<M::State, M::Event>> {
    let state = machine.state();
    let Some(mut row) = M::transition(state, event) else {
        log_debug!("{} rejected {:?} in {:?}", M::TIER, event, state);
        return Err(DispatchError { state, event });
    };
    let mut event = event;

    loop {
        let from = machine.state();
        machine.enter(row.next);
        machine.observe(ctx, from, event, row.next);
        log_debug!("{} {:?} --{:?}--> {:?}", M::TIER, from, event, row.next);

        let next_event = match machine.perform(row.action, ctx) {
            Ok(Step::Pending) => {
                machine.mark_async();
                return Ok(Completion::Pending);
            }
            Ok(Step::Raise(raised)) => raised,
            Ok(Step::Done) => match row.follow_up {
                Some(follow_up) => follow_up,
                None => return Ok(Completion::Success),
            },
            Err(fault) => invariant_violated(fault.0),
        };

        let current = machine.state();
        row = M::transition(current, next_event)
            .unwrap_or_else(|| invariant_violated("chained event has no transition"));
        event = next_event;
    }
}

/// Logs and panics on a broken internal invariant.
#[cold]
#[track_caller]
pub fn invariant_violated(reason: &'static str) -> ! {
    log_error!("invariant violated: {}", reason);
    panic!("invariant violated: {reason}");
}
