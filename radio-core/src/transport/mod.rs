//! Lifecycle of the shared HCI transport.
//!
//! The transport owns both sequencers and runs at most one of them at a time.
//! Its parent is the arbiter, which learns about finished operations either
//! from the synchronous return value or, once an operation has gone
//! asynchronous, from a [`TransportReport`] notice.

use crate::controller::ControllerError;
use crate::controller::bus::{Bus, Notice};
use crate::dispatch::{
    Completion, DispatchError, Fault, StateMachine, Status, Step, Transition, dispatch,
};
use crate::hci::{ChipVersion, EventRoute, HciEvent};
use crate::sequencer::off::{OffSequenceEvent, TransportOffSequencer};
use crate::sequencer::on::{OnSequenceEvent, OnSequenceOutcome, TransportOnSequencer};
use crate::telemetry::TransitionKind;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportState {
    Off,
    PoweringOn,
    On,
    PoweringOff,
    AbortingOn,
    AbortedPoweringOff,
    /// Bring-up failed; only reinitialization leaves this state.
    OnFailed,
}

impl TransportState {
    pub const ALL: [Self; 7] = [
        Self::Off,
        Self::PoweringOn,
        Self::On,
        Self::PoweringOff,
        Self::AbortingOn,
        Self::AbortedPoweringOff,
        Self::OnFailed,
    ];

    /// Returns `true` while a sequence is running.
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        !matches!(self, Self::Off | Self::On | Self::OnFailed)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportEvent {
    On,
    Off,
    Abort,
    OnSequenceReady,
    OnSequenceFailed,
    OnSequenceAborted,
    OffSequenceComplete,
    OffSequenceFailed,
}

impl TransportEvent {
    pub const ALL: [Self; 8] = [
        Self::On,
        Self::Off,
        Self::Abort,
        Self::OnSequenceReady,
        Self::OnSequenceFailed,
        Self::OnSequenceAborted,
        Self::OffSequenceComplete,
        Self::OffSequenceFailed,
    ];

    const fn from_outcome(outcome: OnSequenceOutcome) -> Self {
        match outcome {
            OnSequenceOutcome::Ready => Self::OnSequenceReady,
            OnSequenceOutcome::Failed => Self::OnSequenceFailed,
            OnSequenceOutcome::Aborted => Self::OnSequenceAborted,
        }
    }
}

/// Request the arbiter forwards to the transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportOperation {
    On,
    Off,
    Abort,
}

impl TransportOperation {
    const fn event(self) -> TransportEvent {
        match self {
            Self::On => TransportEvent::On,
            Self::Off => TransportEvent::Off,
            Self::Abort => TransportEvent::Abort,
        }
    }
}

/// Result of a finished transport operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportReport {
    pub operation: TransportOperation,
    pub status: Status,
}

impl TransportReport {
    #[must_use]
    pub const fn new(operation: TransportOperation, status: Status) -> Self {
        Self { operation, status }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportAction {
    StartOnSequence,
    AbortOnSequence,
    StartOffSequence,
    Report(TransportReport),
}

/// Owns the transport state and both HCI sequencers of one chip.
#[derive(Debug)]
pub struct TransportLifecycleManager {
    state: TransportState,
    async_completion: bool,
    on_sequence: TransportOnSequencer,
    off_sequence: TransportOffSequencer,
    last_report: Option<TransportReport>,
}

impl TransportLifecycleManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: TransportState::Off,
            async_completion: false,
            on_sequence: TransportOnSequencer::new(),
            off_sequence: TransportOffSequencer::new(),
            last_report: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TransportState {
        self.state
    }

    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        self.state.is_in_progress()
    }

    #[must_use]
    pub const fn chip_version(&self) -> Option<ChipVersion> {
        self.on_sequence.chip_version()
    }

    /// Report produced by the most recent operation.
    #[must_use]
    pub const fn last_report(&self) -> Option<TransportReport> {
        self.last_report
    }

    pub(crate) fn request(
        &mut self,
        operation: TransportOperation,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<TransportState, TransportEvent>> {
        self.async_completion = false;
        self.last_report = None;
        dispatch(self, operation.event(), bus)
    }

    pub(crate) fn on_sequence_finished(
        &mut self,
        outcome: OnSequenceOutcome,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<TransportState, TransportEvent>> {
        dispatch(self, TransportEvent::from_outcome(outcome), bus)
    }

    pub(crate) fn off_sequence_finished(
        &mut self,
        status: Status,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<TransportState, TransportEvent>> {
        let event = match status {
            Status::Success => TransportEvent::OffSequenceComplete,
            Status::Failure => TransportEvent::OffSequenceFailed,
        };
        dispatch(self, event, bus)
    }

    /// Hands a link event to whichever sequencer holds the event route.
    pub(crate) fn deliver_hci_event(
        &mut self,
        event: &HciEvent,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, ControllerError> {
        match bus.hci.event_route() {
            EventRoute::PowerOnSequencer => {
                let mapped = OnSequenceEvent::from_hci(event).ok_or(ControllerError::ImproperState)?;
                self.on_sequence.handle_event(mapped, bus).map_err(|rejected| {
                    log_debug!("chip {}: {}", bus.chip.0, rejected);
                    ControllerError::ImproperState
                })
            }
            EventRoute::PowerOffSequencer => {
                let mapped =
                    OffSequenceEvent::from_hci(event).ok_or(ControllerError::ImproperState)?;
                self.off_sequence.handle_event(mapped, bus).map_err(|rejected| {
                    log_debug!("chip {}: {}", bus.chip.0, rejected);
                    ControllerError::ImproperState
                })
            }
            EventRoute::Unclaimed | EventRoute::Client(_) => Err(ControllerError::UnclaimedEvent),
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    fn start_on_sequence(&mut self, bus: &mut Bus<'_>) -> Result<Step<TransportEvent>, Fault> {
        match self.on_sequence.start(bus) {
            Err(_) => Err(Fault("on-sequence busy while the transport is off")),
            Ok(Completion::Pending) => Ok(Step::Pending),
            Ok(Completion::Success) => match self.on_sequence.outcome() {
                Some(OnSequenceOutcome::Ready) => Ok(Step::Done),
                Some(OnSequenceOutcome::Failed) => Ok(Step::Raise(TransportEvent::OnSequenceFailed)),
                Some(OnSequenceOutcome::Aborted) | None => {
                    Err(Fault("bring-up finished without a bring-up outcome"))
                }
            },
        }
    }

    fn abort_on_sequence(&mut self, bus: &mut Bus<'_>) -> Result<Step<TransportEvent>, Fault> {
        match self.on_sequence.abort(bus) {
            Err(_) => Err(Fault("on-sequence is not in an abortable step")),
            Ok(Completion::Pending) => Ok(Step::Pending),
            Ok(Completion::Success) => match self.on_sequence.outcome() {
                Some(OnSequenceOutcome::Aborted) => Ok(Step::Done),
                _ => Err(Fault("aborted bring-up finished without an abort outcome")),
            },
        }
    }

    fn start_off_sequence(&mut self, bus: &mut Bus<'_>) -> Result<Step<TransportEvent>, Fault> {
        match self.off_sequence.start(bus) {
            Err(_) => Err(Fault("off-sequence busy while the transport is idle")),
            Ok(Completion::Pending) => Ok(Step::Pending),
            Ok(Completion::Success) => match self.off_sequence.outcome() {
                Some(Status::Success) => Ok(Step::Done),
                Some(Status::Failure) => Ok(Step::Raise(TransportEvent::OffSequenceFailed)),
                None => Err(Fault("shutdown finished without an outcome")),
            },
        }
    }

    fn report(&mut self, report: TransportReport, bus: &mut Bus<'_>) -> Step<TransportEvent> {
        match report.status {
            Status::Success => log_debug!("chip {}: transport {:?} done", bus.chip.0, report.operation),
            Status::Failure => {
                log_warn!("chip {}: transport {:?} failed", bus.chip.0, report.operation);
            }
        }
        self.last_report = Some(report);
        if self.async_completion {
            bus.mailbox.post(Notice::Transport(report));
        }
        Step::Done
    }
}

impl Default for TransportLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TransportLifecycleManager {
    const TIER: &'static str = "transport";

    type State = TransportState;
    type Event = TransportEvent;
    type Action = TransportAction;
    type Context<'c> = Bus<'c>;

    fn state(&self) -> TransportState {
        self.state
    }

    fn enter(&mut self, next: TransportState) {
        self.state = next;
    }

    fn transition(
        state: TransportState,
        event: TransportEvent,
    ) -> Option<Transition<TransportState, TransportEvent, TransportAction>> {
        use TransportAction as A;
        use TransportEvent as E;
        use TransportOperation as Op;
        use TransportState as S;

        let report = |operation, status| A::Report(TransportReport::new(operation, status));

        let row = match (state, event) {
            (S::Off, E::On) => {
                Transition::to(S::PoweringOn, A::StartOnSequence).then(E::OnSequenceReady)
            }
            (S::PoweringOn, E::OnSequenceReady) => {
                Transition::to(S::On, report(Op::On, Status::Success))
            }
            (S::PoweringOn, E::OnSequenceFailed) => {
                Transition::to(S::OnFailed, report(Op::On, Status::Failure))
            }
            (S::PoweringOn, E::Abort) => {
                Transition::to(S::AbortingOn, A::AbortOnSequence).then(E::OnSequenceAborted)
            }
            (S::AbortingOn, E::OnSequenceAborted) => {
                Transition::to(S::AbortedPoweringOff, A::StartOffSequence)
                    .then(E::OffSequenceComplete)
            }
            (S::AbortedPoweringOff, E::OffSequenceComplete) => {
                Transition::to(S::Off, report(Op::Abort, Status::Success))
            }
            (S::AbortedPoweringOff, E::OffSequenceFailed) => {
                Transition::to(S::Off, report(Op::Abort, Status::Failure))
            }
            (S::On, E::Off) => {
                Transition::to(S::PoweringOff, A::StartOffSequence).then(E::OffSequenceComplete)
            }
            (S::PoweringOff, E::OffSequenceComplete) => {
                Transition::to(S::Off, report(Op::Off, Status::Success))
            }
            (S::PoweringOff, E::OffSequenceFailed) => {
                Transition::to(S::Off, report(Op::Off, Status::Failure))
            }
            _ => return None,
        };
        Some(row)
    }

    fn perform(
        &mut self,
        action: TransportAction,
        bus: &mut Bus<'_>,
    ) -> Result<Step<TransportEvent>, Fault> {
        match action {
            TransportAction::StartOnSequence => self.start_on_sequence(bus),
            TransportAction::AbortOnSequence => self.abort_on_sequence(bus),
            TransportAction::StartOffSequence => self.start_off_sequence(bus),
            TransportAction::Report(report) => Ok(self.report(report, bus)),
        }
    }

    fn mark_async(&mut self) {
        self.async_completion = true;
    }

    fn observe(
        &self,
        bus: &mut Bus<'_>,
        from: TransportState,
        event: TransportEvent,
        to: TransportState,
    ) {
        bus.record(TransitionKind::Transport { from, event, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_always_lands_in_off() {
        let aborted = TransportLifecycleManager::transition(
            TransportState::AbortingOn,
            TransportEvent::OnSequenceAborted,
        )
        .expect("aborting accepts the aborted outcome");
        assert_eq!(aborted.next, TransportState::AbortedPoweringOff);

        for event in [
            TransportEvent::OffSequenceComplete,
            TransportEvent::OffSequenceFailed,
        ] {
            let row = TransportLifecycleManager::transition(TransportState::AbortedPoweringOff, event)
                .unwrap_or_else(|| panic!("{event:?} rejected after abort"));
            assert_eq!(row.next, TransportState::Off);
        }
    }

    #[test]
    fn on_failed_is_terminal() {
        for event in TransportEvent::ALL {
            assert!(
                TransportLifecycleManager::transition(TransportState::OnFailed, event).is_none(),
                "{event:?} accepted after a failed bring-up"
            );
        }
    }

    #[test]
    fn in_progress_matches_running_states() {
        let running: heapless::Vec<TransportState, 7> = TransportState::ALL
            .into_iter()
            .filter(|state| state.is_in_progress())
            .collect();
        assert_eq!(
            running.as_slice(),
            &[
                TransportState::PoweringOn,
                TransportState::PoweringOff,
                TransportState::AbortingOn,
                TransportState::AbortedPoweringOff,
            ]
        );
    }
}
