//! Transport bring-up: link on, version read, init script, link settings.
//!
//! Every forward step can be aborted. Steps that wait on the link defer the
//! abort until the pending reply arrives; the init script is asked to stop at
//! its next command boundary. An aborted sequence always finishes with
//! [`OnSequenceOutcome::Aborted`], whatever the link reports afterwards.

use crate::controller::bus::{Bus, Notice};
use crate::dispatch::{Completion, DispatchError, Fault, StateMachine, Step, Transition, dispatch};
use crate::hci::{
    ChipVersion, EventRoute, HCI_SUCCESS, HciEvent, HciStatus, LocalVersion, READ_LOCAL_VERSION,
    RouteLease,
};
use crate::script::{ScriptProgress, script_name};
use crate::telemetry::TransitionKind;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OnSequenceState {
    Idle,
    TurningLinkOn,
    ReadingVersion,
    RunningInitScript,
    ConfiguringLink,
    AbortingLinkOn,
    AbortingVersionRead,
    AbortingInitScript,
    AbortingLinkConfig,
}

impl OnSequenceState {
    pub const ALL: [Self; 9] = [
        Self::Idle,
        Self::TurningLinkOn,
        Self::ReadingVersion,
        Self::RunningInitScript,
        Self::ConfiguringLink,
        Self::AbortingLinkOn,
        Self::AbortingVersionRead,
        Self::AbortingInitScript,
        Self::AbortingLinkConfig,
    ];

    /// Returns `true` while an abort is being wound down.
    #[must_use]
    pub const fn is_aborting(self) -> bool {
        matches!(
            self,
            Self::AbortingLinkOn
                | Self::AbortingVersionRead
                | Self::AbortingInitScript
                | Self::AbortingLinkConfig
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OnSequenceEvent {
    Start,
    Abort,
    LinkReady,
    CommandComplete,
    ParamsApplied,
    ScriptDone,
    LinkConfigured,
    Failed,
}

impl OnSequenceEvent {
    pub const ALL: [Self; 8] = [
        Self::Start,
        Self::Abort,
        Self::LinkReady,
        Self::CommandComplete,
        Self::ParamsApplied,
        Self::ScriptDone,
        Self::LinkConfigured,
        Self::Failed,
    ];

    /// Maps a link event to the event this sequencer understands.
    #[must_use]
    pub fn from_hci(event: &HciEvent) -> Option<Self> {
        let event = match event {
            HciEvent::TransportOnCompleted { status } => {
                Self::on_status(*status, Self::LinkReady)
            }
            HciEvent::CommandComplete { status, .. } => {
                Self::on_status(*status, Self::CommandComplete)
            }
            HciEvent::TransportParamsApplied => Self::ParamsApplied,
            HciEvent::LinkConfigured { status } => Self::on_status(*status, Self::LinkConfigured),
            HciEvent::TransportOffCompleted { .. } => return None,
        };
        Some(event)
    }

    const fn on_status(status: u8, success: Self) -> Self {
        if status == HCI_SUCCESS {
            success
        } else {
            Self::Failed
        }
    }
}

/// How a bring-up ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OnSequenceOutcome {
    Ready,
    Failed,
    Aborted,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OnSequenceAction {
    TurnLinkOn,
    ReadVersion,
    RunInitScript,
    FeedScript,
    FeedScriptParams,
    ConfigureLink,
    AbortScript,
    /// Wait for the reply already in flight before winding down.
    Defer,
    Finish(OnSequenceOutcome),
}

/// Drives the link from off to fully configured.
#[derive(Debug)]
pub struct TransportOnSequencer {
    state: OnSequenceState,
    async_completion: bool,
    lease: Option<RouteLease>,
    outcome: Option<OnSequenceOutcome>,
    version: Option<ChipVersion>,
}

impl TransportOnSequencer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: OnSequenceState::Idle,
            async_completion: false,
            lease: None,
            outcome: None,
            version: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> OnSequenceState {
        self.state
    }

    /// Result of the most recent sequence.
    #[must_use]
    pub const fn outcome(&self) -> Option<OnSequenceOutcome> {
        self.outcome
    }

    /// Version decoded during the most recent bring-up.
    #[must_use]
    pub const fn chip_version(&self) -> Option<ChipVersion> {
        self.version
    }

    pub(crate) fn start(
        &mut self,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<OnSequenceState, OnSequenceEvent>> {
        self.async_completion = false;
        self.outcome = None;
        dispatch(self, OnSequenceEvent::Start, bus)
    }

    pub(crate) fn abort(
        &mut self,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<OnSequenceState, OnSequenceEvent>> {
        self.async_completion = false;
        dispatch(self, OnSequenceEvent::Abort, bus)
    }

    pub(crate) fn handle_event(
        &mut self,
        event: OnSequenceEvent,
        bus: &mut Bus<'_>,
    ) -> Result<Completion, DispatchError<OnSequenceState, OnSequenceEvent>> {
        dispatch(self, event, bus)
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    fn turn_link_on(&mut self, bus: &mut Bus<'_>) -> Result<Step<OnSequenceEvent>, Fault> {
        if self.lease.is_some() {
            return Err(Fault("on-sequence already holds the event route"));
        }
        self.lease = Some(RouteLease::claim(bus.hci, EventRoute::PowerOnSequencer));

        Ok(match bus.hci.transport_on() {
            Ok(HciStatus::Pending) => Step::Pending,
            Ok(HciStatus::Complete) => Step::Raise(OnSequenceEvent::LinkReady),
            Err(error) => {
                log_warn!("chip {}: transport on failed: {:?}", bus.chip.0, error);
                Step::Raise(OnSequenceEvent::Failed)
            }
        })
    }

    fn read_version(bus: &mut Bus<'_>) -> Step<OnSequenceEvent> {
        match bus.hci.send_command(READ_LOCAL_VERSION, &[]) {
            Ok(HciStatus::Pending) => Step::Pending,
            Ok(HciStatus::Complete) => {
                log_warn!("chip {}: version read completed without a reply", bus.chip.0);
                Step::Raise(OnSequenceEvent::Failed)
            }
            Err(error) => {
                log_warn!("chip {}: version read failed: {:?}", bus.chip.0, error);
                Step::Raise(OnSequenceEvent::Failed)
            }
        }
    }

    fn run_init_script(&mut self, bus: &mut Bus<'_>) -> Result<Step<OnSequenceEvent>, Fault> {
        let Some(HciEvent::CommandComplete { opcode, params, .. }) = bus.inbound else {
            return Err(Fault("version reply missing from the delivered event"));
        };
        if *opcode != READ_LOCAL_VERSION {
            log_warn!("chip {}: unexpected reply to opcode {:?}", bus.chip.0, *opcode);
            return Ok(Step::Raise(OnSequenceEvent::Failed));
        }

        let version = match LocalVersion::parse(params)
            .and_then(|local| local.verify(bus.config.expected_manufacturer))
        {
            Ok(version) => version,
            Err(error) => {
                log_warn!("chip {}: unusable version reply: {:?}", bus.chip.0, error);
                return Ok(Step::Raise(OnSequenceEvent::Failed));
            }
        };
        self.version = Some(version);
        log_debug!("chip {}: version {:?}", bus.chip.0, version);

        let Some(name) = script_name(bus.config.script_prefix, version) else {
            log_warn!("chip {}: init script name does not fit", bus.chip.0);
            return Ok(Step::Raise(OnSequenceEvent::Failed));
        };
        let progress = bus.script.start(&name, bus.hci);
        Ok(Self::script_step(bus, progress))
    }

    fn feed_script(bus: &mut Bus<'_>) -> Result<Step<OnSequenceEvent>, Fault> {
        let Some(HciEvent::CommandComplete { status, params, .. }) = bus.inbound else {
            return Err(Fault("script reply missing from the delivered event"));
        };
        let progress = bus.script.command_completed(*status, params, bus.hci);
        Ok(Self::script_step(bus, progress))
    }

    fn script_step(bus: &Bus<'_>, progress: ScriptProgress) -> Step<OnSequenceEvent> {
        match progress {
            ScriptProgress::Running => Step::Pending,
            ScriptProgress::Finished(Ok(())) => Step::Done,
            ScriptProgress::Finished(Err(error)) => {
                log_warn!("chip {}: init script stopped: {:?}", bus.chip.0, error);
                Step::Raise(OnSequenceEvent::Failed)
            }
        }
    }

    fn configure_link(bus: &mut Bus<'_>) -> Step<OnSequenceEvent> {
        match bus.hci.configure_link() {
            Ok(HciStatus::Pending) => Step::Pending,
            Ok(HciStatus::Complete) => Step::Raise(OnSequenceEvent::LinkConfigured),
            Err(error) => {
                log_warn!("chip {}: link configuration failed: {:?}", bus.chip.0, error);
                Step::Raise(OnSequenceEvent::Failed)
            }
        }
    }

    fn abort_script(bus: &mut Bus<'_>) -> Step<OnSequenceEvent> {
        match bus.script.abort(bus.hci) {
            ScriptProgress::Running => Step::Pending,
            ScriptProgress::Finished(_) => Step::Done,
        }
    }

    fn finish(&mut self, outcome: OnSequenceOutcome, bus: &mut Bus<'_>) -> Step<OnSequenceEvent> {
        if let Some(lease) = self.lease.take() {
            lease.release(bus.hci);
        }
        self.outcome = Some(outcome);
        if self.async_completion {
            bus.mailbox.post(Notice::OnSequence(outcome));
        }
        Step::Done
    }
}

impl Default for TransportOnSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TransportOnSequencer {
    const TIER: &'static str = "on-sequence";

    type State = OnSequenceState;
    type Event = OnSequenceEvent;
    type Action = OnSequenceAction;
    type Context<'c> = Bus<'c>;

    fn state(&self) -> OnSequenceState {
        self.state
    }

    fn enter(&mut self, next: OnSequenceState) {
        self.state = next;
    }

    fn transition(
        state: OnSequenceState,
        event: OnSequenceEvent,
    ) -> Option<Transition<OnSequenceState, OnSequenceEvent, OnSequenceAction>> {
        use OnSequenceAction as A;
        use OnSequenceEvent as E;
        use OnSequenceOutcome as O;
        use OnSequenceState as S;

        let row = match (state, event) {
            (S::Idle, E::Start) => Transition::to(S::TurningLinkOn, A::TurnLinkOn),
            (S::TurningLinkOn, E::LinkReady) => Transition::to(S::ReadingVersion, A::ReadVersion),
            (S::ReadingVersion, E::CommandComplete) => {
                Transition::to(S::RunningInitScript, A::RunInitScript).then(E::ScriptDone)
            }
            (S::RunningInitScript, E::CommandComplete) => {
                Transition::to(S::RunningInitScript, A::FeedScript).then(E::ScriptDone)
            }
            (S::RunningInitScript, E::ParamsApplied) => {
                Transition::to(S::RunningInitScript, A::FeedScriptParams).then(E::ScriptDone)
            }
            (S::RunningInitScript, E::ScriptDone) => {
                Transition::to(S::ConfiguringLink, A::ConfigureLink)
            }
            (S::ConfiguringLink, E::LinkConfigured) => {
                Transition::to(S::Idle, A::Finish(O::Ready))
            }
            (
                S::TurningLinkOn | S::ReadingVersion | S::RunningInitScript | S::ConfiguringLink,
                E::Failed,
            ) => Transition::to(S::Idle, A::Finish(O::Failed)),

            (S::TurningLinkOn, E::Abort) => Transition::to(S::AbortingLinkOn, A::Defer),
            (S::ReadingVersion, E::Abort) => Transition::to(S::AbortingVersionRead, A::Defer),
            (S::RunningInitScript, E::Abort) => {
                Transition::to(S::AbortingInitScript, A::AbortScript).then(E::ScriptDone)
            }
            (S::ConfiguringLink, E::Abort) => Transition::to(S::AbortingLinkConfig, A::Defer),

            (S::AbortingLinkOn, E::LinkReady)
            | (S::AbortingVersionRead, E::CommandComplete)
            | (S::AbortingInitScript, E::ScriptDone)
            | (S::AbortingLinkConfig, E::LinkConfigured) => {
                Transition::to(S::Idle, A::Finish(O::Aborted))
            }
            (S::AbortingInitScript, E::CommandComplete) => {
                Transition::to(S::AbortingInitScript, A::FeedScript).then(E::ScriptDone)
            }
            (S::AbortingInitScript, E::ParamsApplied) => {
                Transition::to(S::AbortingInitScript, A::FeedScriptParams).then(E::ScriptDone)
            }
            (
                S::AbortingLinkOn
                | S::AbortingVersionRead
                | S::AbortingInitScript
                | S::AbortingLinkConfig,
                E::Failed,
            ) => Transition::to(S::Idle, A::Finish(O::Aborted)),
            _ => return None,
        };
        Some(row)
    }

    fn perform(
        &mut self,
        action: OnSequenceAction,
        bus: &mut Bus<'_>,
    ) -> Result<Step<OnSequenceEvent>, Fault> {
        match action {
            OnSequenceAction::TurnLinkOn => self.turn_link_on(bus),
            OnSequenceAction::ReadVersion => Ok(Self::read_version(bus)),
            OnSequenceAction::RunInitScript => self.run_init_script(bus),
            OnSequenceAction::FeedScript => Self::feed_script(bus),
            OnSequenceAction::FeedScriptParams => {
                let progress = bus.script.params_applied(bus.hci);
                Ok(Self::script_step(bus, progress))
            }
            OnSequenceAction::ConfigureLink => Ok(Self::configure_link(bus)),
            OnSequenceAction::AbortScript => Ok(Self::abort_script(bus)),
            OnSequenceAction::Defer => Ok(Step::Pending),
            OnSequenceAction::Finish(outcome) => Ok(self.finish(outcome, bus)),
        }
    }

    fn mark_async(&mut self) {
        self.async_completion = true;
    }

    fn observe(
        &self,
        bus: &mut Bus<'_>,
        from: OnSequenceState,
        event: OnSequenceEvent,
        to: OnSequenceState,
    ) {
        bus.record(TransitionKind::OnSequence { from, event, to });
    }
}
