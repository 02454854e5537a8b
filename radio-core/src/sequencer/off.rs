//! Transport shutdown: switch the link off and wait for confirmation.

use crate::controller::bus::{Bus, Notice};
use crate::dispatch::{
    Completion, DispatchError, Fault, StateMachine, Status, Step, Transition, dispatch,
};
use crate::hci::{EventRoute, HCI_SUCCESS, HciEvent, HciStatus, RouteLease};
use crate::telemetry::TransitionKind;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OffSequenceState {
    Idle,
    TurningLinkOff,
}

impl OffSequenceState {
    pub const ALL: [Self; 2] = [Self::Idle, Self::TurningLinkOff];
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OffSequenceEvent {
    Start,
    LinkDown,
    Failed,
}

impl OffSequenceEvent {
    pub const ALL: [Self; 3] = [Self::Start, Self::LinkDown, Self::Failed];

    /// Maps a link event to the event this sequencer understands.
    #[must_use]
    pub fn from_hci(event: &HciEvent) -> Option<Self> {
        match event {
            HciEvent::TransportOffCompleted { status } if *status == HCI_SUCCESS => {
                Some(Self::LinkDown)
            }
            HciEvent::TransportOffCompleted { .. } => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OffSequenceAction {
    TurnLinkOff,
    Finish(Status),
}

/// Drives the link from on to off.
#[derive(Debug)]
pub struct TransportOffSequencer {
    state: OffSequenceState,
    async_completion: bool,
    lease: Option<RouteLease>,
    outcome: Option<Status>,
}

impl TransportOffSequencer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: OffSequenceState::Idle,
            async_completion: false,
            lease: None,
            outcome: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> OffSequenceState {
        self.state
    }

    /// Result of the most recent sequence.
    #[must_use]
    pub const fn outcome(&self) -> Option<Status> {
        self.outcome
    }

    pub(crate) fn start(
        &mut self,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<OffSequenceState, OffSequenceEvent>> {
        self.async_completion = false;
        self.outcome = None;
        dispatch(self, OffSequenceEvent::Start, bus)
    }

    pub(crate) fn handle_event(
        &mut self,
        event: OffSequenceEvent,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<OffSequenceState, OffSequenceEvent>> {
        dispatch(self, event, bus)
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    fn turn_link_off(&mut self, bus: &mut Bus<'_>) -> Result<Step<OffSequenceEvent>, Fault> {
        if self.lease.is_some() {
            return Err(Fault("off-sequence already holds the event route"));
        }
        self.lease = Some(RouteLease::claim(bus.hci, EventRoute::PowerOffSequencer));

        match bus.hci.transport_off() {
            Ok(HciStatus::Pending) => Ok(Step::Pending),
            Ok(HciStatus::Complete) => Ok(Step::Done),
            Err(error) => {
                log_warn!("chip {}: transport off failed: {:?}", bus.chip.0, error);
                Ok(Step::Raise(OffSequenceEvent::Failed))
            }
        }
    }

    fn finish(&mut self, status: Status, bus: &mut Bus<'_>) -> Step<OffSequenceEvent> {
        if let Some(lease) = self.lease.take() {
            lease.release(bus.hci);
        }
        self.outcome = Some(status);
        if self.async_completion {
            bus.mailbox.post(Notice::OffSequence(status));
        }
        Step::Done
    }
}

impl Default for TransportOffSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TransportOffSequencer {
    const TIER: &'static str = "off-sequence";

    type State = OffSequenceState;
    type Event = OffSequenceEvent;
    type Action = OffSequenceAction;
    type Context<'c> = Bus<'c>;

    fn state(&self) -> OffSequenceState {
        self.state
    }

    fn enter(&mut self, next: OffSequenceState) {
        self.state = next;
    }

    fn transition(
        state: OffSequenceState,
        event: OffSequenceEvent,
    ) -> Option<Transition<OffSequenceState, OffSequenceEvent, OffSequenceAction>> {
        use OffSequenceAction as A;
        use OffSequenceEvent as E;
        use OffSequenceState as S;

        let row = match (state, event) {
            (S::Idle, E::Start) => Transition::to(S::TurningLinkOff, A::TurnLinkOff).then(E::LinkDown),
            (S::TurningLinkOff, E::LinkDown) => Transition::to(S::Idle, A::Finish(Status::Success)),
            (S::TurningLinkOff, E::Failed) => Transition::to(S::Idle, A::Finish(Status::Failure)),
            _ => return None,
        };
        Some(row)
    }

    fn perform(
        &mut self,
        action: OffSequenceAction,
        bus: &mut Bus<'_>,
    ) -> Result<Step<OffSequenceEvent>, Fault> {
        match action {
            OffSequenceAction::TurnLinkOff => self.turn_link_off(bus),
            OffSequenceAction::Finish(status) => Ok(self.finish(status, bus)),
        }
    }

    fn mark_async(&mut self) {
        self.async_completion = true;
    }

    fn observe(
        &self,
        bus: &mut Bus<'_>,
        from: OffSequenceState,
        event: OffSequenceEvent,
        to: OffSequenceState,
    ) {
        bus.record(TransitionKind::OffSequence { from, event, to });
    }
}
