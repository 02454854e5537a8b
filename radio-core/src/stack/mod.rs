//! Per-stack lifecycle: the entry point protocol stacks talk to.
//!
//! A stack asserts its core's enable line, asks the arbiter for the shared
//! transport, and tells its client how the operation ended. Only one
//! operation may be in flight per stack; a second request is rejected rather
//! than queued.

use crate::arbiter::{ArbiterReply, ArbiterRequest, TransportArbiter};
use crate::controller::bus::{Bus, Delivery};
use crate::dispatch::{
    Completion, DispatchError, Fault, StateMachine, Status, Step, Transition, dispatch,
};
use crate::power::{CoreId, PowerSequencer};
use crate::telemetry::TransitionKind;
use crate::transport::TransportLifecycleManager;

pub use crate::dispatch::Status as StackStatus;

/// Number of stack kinds per chip.
pub const STACK_KINDS: usize = 3;

/// Logical radio subsystem sharing the chip.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackKind {
    Bluetooth,
    Fm,
    Gps,
}

impl StackKind {
    pub const ALL: [Self; STACK_KINDS] = [Self::Bluetooth, Self::Fm, Self::Gps];

    /// Position of this kind in per-chip tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Bluetooth => 0,
            Self::Fm => 1,
            Self::Gps => 2,
        }
    }

    /// Core whose enable line powers this stack.
    #[must_use]
    pub const fn core(self) -> CoreId {
        match self {
            Self::Bluetooth => CoreId::Bt,
            Self::Fm => CoreId::Fm,
            Self::Gps => CoreId::Gps,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackState {
    Off,
    PoweringOn,
    On,
    PoweringOff,
    AbortingOn,
    /// Power-up or power-down failed; the enable line has been released.
    FatalError,
}

impl StackState {
    pub const ALL: [Self; 6] = [
        Self::Off,
        Self::PoweringOn,
        Self::On,
        Self::PoweringOff,
        Self::AbortingOn,
        Self::FatalError,
    ];

    /// Returns `true` when no operation is in flight and the core is unpowered.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Off | Self::FatalError)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEvent {
    On,
    Off,
    OnAbort,
    TransportOnComplete,
    TransportOnFailed,
    TransportOffComplete,
    TransportOffFailed,
    TransportOnAbortComplete,
    TransportOnAbortFailed,
}

impl StackEvent {
    pub const ALL: [Self; 9] = [
        Self::On,
        Self::Off,
        Self::OnAbort,
        Self::TransportOnComplete,
        Self::TransportOnFailed,
        Self::TransportOffComplete,
        Self::TransportOffFailed,
        Self::TransportOnAbortComplete,
        Self::TransportOnAbortFailed,
    ];
}

/// Operation a notification reports on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEventType {
    OnComplete,
    OnAbortComplete,
    OffComplete,
}

/// Completion delivered to a stack's client.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StackNotification {
    pub stack: StackKind,
    pub event: StackEventType,
    pub status: StackStatus,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackAction {
    PowerUp,
    AbortPowerUp,
    PowerDown,
    CompleteOn,
    FailOn,
    CompleteAbort(Status),
    CompleteOff(Status),
}

/// Everything a stack touches while handling one event.
pub struct StackContext<'c> {
    pub(crate) bus: Bus<'c>,
    pub(crate) arbiter: &'c mut TransportArbiter,
    pub(crate) transport: &'c mut TransportLifecycleManager,
    pub(crate) power: &'c mut dyn PowerSequencer,
    /// Set once the chip-identified notice has been issued.
    pub(crate) identified: &'c mut bool,
}

/// Lifecycle of one stack on one chip.
#[derive(Debug)]
pub struct StackLifecycleManager {
    kind: StackKind,
    state: StackState,
    async_completion: bool,
    enable_asserted: bool,
    last_status: Option<Status>,
}

impl StackLifecycleManager {
    #[must_use]
    pub const fn new(kind: StackKind) -> Self {
        Self {
            kind,
            state: StackState::Off,
            async_completion: false,
            enable_asserted: false,
            last_status: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> StackKind {
        self.kind
    }

    #[must_use]
    pub const fn state(&self) -> StackState {
        self.state
    }

    #[must_use]
    pub const fn enable_asserted(&self) -> bool {
        self.enable_asserted
    }

    /// Status of the last operation that finished.
    #[must_use]
    pub const fn last_status(&self) -> Option<Status> {
        self.last_status
    }

    /// Runs a client request (`On`, `Off` or `OnAbort`).
    pub(crate) fn request(
        &mut self,
        event: StackEvent,
        ctx: &mut StackContext<'_>,
    ) -> Result<Completion, DispatchError<StackState, StackEvent>> {
        self.async_completion = false;
        self.last_status = None;
        dispatch(self, event, ctx)
    }

    /// Applies a transport completion relayed by the arbiter.
    pub(crate) fn transport_event(
        &mut self,
        event: StackEvent,
        ctx: &mut StackContext<'_>,
    ) -> Result<Completion, DispatchError<StackState, StackEvent>> {
        dispatch(self, event, ctx)
    }

    /// Returns a settled stack to `Off`.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.kind);
    }

    fn power_up(&mut self, ctx: &mut StackContext<'_>) -> Step<StackEvent> {
        let chip = ctx.bus.chip;
        if let Err(error) = ctx.power.assert_enable(chip, self.kind.core()) {
            log_warn!("chip {}: enable for {:?} failed: {:?}", chip.0, self.kind, error);
            return Step::Raise(StackEvent::TransportOnFailed);
        }
        self.enable_asserted = true;
        ctx.bus.record(TransitionKind::EnableAsserted(self.kind));

        self.ask_arbiter(ArbiterRequest::On, StackEvent::TransportOnFailed, ctx)
    }

    fn ask_arbiter(
        &self,
        request: ArbiterRequest,
        failure: StackEvent,
        ctx: &mut StackContext<'_>,
    ) -> Step<StackEvent> {
        match ctx
            .arbiter
            .request(self.kind, request, ctx.transport, &mut ctx.bus)
        {
            ArbiterReply::Pending => Step::Pending,
            ArbiterReply::Complete(Status::Success) => Step::Done,
            ArbiterReply::Complete(Status::Failure) => Step::Raise(failure),
        }
    }

    fn release_enable(&mut self, ctx: &mut StackContext<'_>) {
        if !self.enable_asserted {
            return;
        }
        let chip = ctx.bus.chip;
        if let Err(error) = ctx.power.deassert_enable(chip, self.kind.core()) {
            log_warn!("chip {}: release of {:?} failed: {:?}", chip.0, self.kind, error);
        }
        self.enable_asserted = false;
        ctx.bus.record(TransitionKind::EnableReleased(self.kind));
    }

    fn announce_chip(ctx: &mut StackContext<'_>) {
        if *ctx.identified {
            return;
        }
        *ctx.identified = true;
        if let Some(version) = ctx.transport.chip_version() {
            log_info!("chip {}: identified as {:?}", ctx.bus.chip.0, version);
            ctx.bus.record(TransitionKind::ChipIdentified(version));
            ctx.bus.mailbox.deliver(Delivery::ChipIdentified(version));
        }
    }

    fn notify(&mut self, event: StackEventType, status: Status, ctx: &mut StackContext<'_>) {
        self.last_status = Some(status);
        let notification = StackNotification {
            stack: self.kind,
            event,
            status,
        };
        match status {
            Status::Success => log_info!("chip {}: {:?}", ctx.bus.chip.0, notification),
            Status::Failure => log_warn!("chip {}: {:?}", ctx.bus.chip.0, notification),
        }
        if self.async_completion {
            ctx.bus.record(TransitionKind::Notified(notification));
            ctx.bus.mailbox.deliver(Delivery::Client(notification));
        }
    }
}

impl StateMachine for StackLifecycleManager {
    const TIER: &'static str = "stack";

    type State = StackState;
    type Event = StackEvent;
    type Action = StackAction;
    type Context<'c> = StackContext<'c>;

    fn state(&self) -> StackState {
        self.state
    }

    fn enter(&mut self, next: StackState) {
        self.state = next;
    }

    fn transition(
        state: StackState,
        event: StackEvent,
    ) -> Option<Transition<StackState, StackEvent, StackAction>> {
        use StackAction as A;
        use StackEvent as E;
        use StackState as S;

        let row = match (state, event) {
            (S::Off, E::On) => Transition::to(S::PoweringOn, A::PowerUp).then(E::TransportOnComplete),
            (S::PoweringOn, E::OnAbort) => {
                Transition::to(S::AbortingOn, A::AbortPowerUp).then(E::TransportOnAbortComplete)
            }
            (S::PoweringOn, E::TransportOnComplete) => Transition::to(S::On, A::CompleteOn),
            (S::PoweringOn, E::TransportOnFailed) => Transition::to(S::FatalError, A::FailOn),
            (S::AbortingOn, E::TransportOnAbortComplete) => {
                Transition::to(S::Off, A::CompleteAbort(Status::Success))
            }
            (S::AbortingOn, E::TransportOnAbortFailed) => {
                Transition::to(S::Off, A::CompleteAbort(Status::Failure))
            }
            (S::On, E::Off) => {
                Transition::to(S::PoweringOff, A::PowerDown).then(E::TransportOffComplete)
            }
            (S::PoweringOff, E::TransportOffComplete) => {
                Transition::to(S::Off, A::CompleteOff(Status::Success))
            }
            (S::PoweringOff, E::TransportOffFailed) => {
                Transition::to(S::FatalError, A::CompleteOff(Status::Failure))
            }
            _ => return None,
        };
        Some(row)
    }

    fn perform(
        &mut self,
        action: StackAction,
        ctx: &mut StackContext<'_>,
    ) -> Result<Step<StackEvent>, Fault> {
        let step = match action {
            StackAction::PowerUp => self.power_up(ctx),
            StackAction::AbortPowerUp => {
                self.ask_arbiter(ArbiterRequest::OnAbort, StackEvent::TransportOnAbortFailed, ctx)
            }
            StackAction::PowerDown => {
                self.ask_arbiter(ArbiterRequest::Off, StackEvent::TransportOffFailed, ctx)
            }
            StackAction::CompleteOn => {
                Self::announce_chip(ctx);
                self.notify(StackEventType::OnComplete, Status::Success, ctx);
                Step::Done
            }
            StackAction::FailOn => {
                self.release_enable(ctx);
                self.notify(StackEventType::OnComplete, Status::Failure, ctx);
                Step::Done
            }
            StackAction::CompleteAbort(status) => {
                self.release_enable(ctx);
                self.notify(StackEventType::OnAbortComplete, status, ctx);
                Step::Done
            }
            StackAction::CompleteOff(status) => {
                self.release_enable(ctx);
                self.notify(StackEventType::OffComplete, status, ctx);
                Step::Done
            }
        };
        Ok(step)
    }

    fn mark_async(&mut self) {
        self.async_completion = true;
    }

    fn observe(
        &self,
        ctx: &mut StackContext<'_>,
        from: StackState,
        event: StackEvent,
        to: StackState,
    ) {
        ctx.bus.record(TransitionKind::Stack {
            stack: self.kind,
            from,
            event,
            to,
        });
    }
}
