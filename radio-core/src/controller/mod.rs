//! Registry of chips and the public entry points used by protocol stacks.
//!
//! Every chip lives behind its own critical-section mutex. One external call
//! (a stack request, an HCI event, a query) takes the lock once, runs the
//! whole synchronous chain across the tiers, drains the chip's notice mailbox
//! and releases the lock. Client callbacks and the chip-identified notice are
//! handed out afterwards, one at a time, with the chip unlocked so a callback
//! may call straight back into the controller.

pub mod bus;

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Vec;

use crate::arbiter::TransportArbiter;
use crate::dispatch::{Completion, Status, invariant_violated};
use crate::hci::{ChipVersion, HciEvent, HciLink, TEXAS_INSTRUMENTS};
use crate::power::PowerSequencer;
use crate::script::InitScriptRunner;
use crate::stack::{
    STACK_KINDS, StackContext, StackEvent, StackKind, StackLifecycleManager, StackNotification,
    StackState,
};
use crate::telemetry::{Journal, TransitionKind};
use crate::transport::{TransportLifecycleManager, TransportState};

use self::bus::{Bus, Delivery, Mailbox, Notice, Pick};

/// Default number of chips a controller can hold.
pub const MAX_CHIPS: usize = 1;

/// Identifies one physical chip.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChipId(pub u8);

/// Settings applied by the bring-up sequence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BringUpConfig {
    /// Manufacturer the version reply must report; `None` accepts any.
    pub expected_manufacturer: Option<u16>,
    /// Prefix of the init script file name.
    pub script_prefix: &'static str,
}

impl BringUpConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            expected_manufacturer: Some(TEXAS_INSTRUMENTS),
            script_prefix: "tiinit_",
        }
    }

    #[must_use]
    pub const fn with_expected_manufacturer(mut self, manufacturer: Option<u16>) -> Self {
        self.expected_manufacturer = manufacturer;
        self
    }

    #[must_use]
    pub const fn with_script_prefix(mut self, prefix: &'static str) -> Self {
        self.script_prefix = prefix;
        self
    }
}

impl Default for BringUpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors returned by controller operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerError {
    /// The request is not valid in the current state; nothing changed.
    ImproperState,
    /// The operation finished synchronously and the hardware failed.
    HardwareFailure,
    UnknownChip,
    DuplicateChip,
    RegistryFull,
    AlreadyRegistered,
    NotRegistered,
    /// The handle belongs to an earlier registration.
    StaleHandle,
    VersionUnavailable,
    /// No sequencer holds the HCI event route.
    UnclaimedEvent,
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ControllerError::ImproperState => "request not valid in the current state",
            ControllerError::HardwareFailure => "hardware failure",
            ControllerError::UnknownChip => "unknown chip",
            ControllerError::DuplicateChip => "chip already registered",
            ControllerError::RegistryFull => "chip registry is full",
            ControllerError::AlreadyRegistered => "stack already has a client",
            ControllerError::NotRegistered => "stack has no client",
            ControllerError::StaleHandle => "stack handle is stale",
            ControllerError::VersionUnavailable => "chip version not read yet",
            ControllerError::UnclaimedEvent => "no sequencer is waiting for HCI events",
        };
        f.write_str(text)
    }
}

impl core::error::Error for ControllerError {}

/// Capability returned by [`RadioController::register_stack`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StackHandle {
    chip: ChipId,
    kind: StackKind,
    generation: u16,
}

impl StackHandle {
    #[must_use]
    pub const fn chip(&self) -> ChipId {
        self.chip
    }

    #[must_use]
    pub const fn kind(&self) -> StackKind {
        self.kind
    }
}

/// Receives completions of operations that returned [`Completion::Pending`].
pub trait StackClient {
    fn on_completion(&mut self, notification: StackNotification);
}

impl<F> StackClient for F
where
    F: FnMut(StackNotification),
{
    fn on_completion(&mut self, notification: StackNotification) {
        self(notification);
    }
}

/// Told once per chip when the first stack reaches `On`.
pub trait ChipObserver {
    fn chip_identified(&mut self, chip: ChipId, version: ChipVersion);
}

impl ChipObserver for () {
    fn chip_identified(&mut self, _chip: ChipId, _version: ChipVersion) {}
}

impl<F> ChipObserver for F
where
    F: FnMut(ChipId, ChipVersion),
{
    fn chip_identified(&mut self, chip: ChipId, version: ChipVersion) {
        self(chip, version);
    }
}

struct ClientSlot<C> {
    registered: bool,
    generation: u16,
    /// `None` while the client's callback is running.
    client: Option<C>,
}

impl<C> ClientSlot<C> {
    const fn empty() -> Self {
        Self {
            registered: false,
            generation: 0,
            client: None,
        }
    }
}

/// Callback taken out of the chip so it can run unlocked.
enum Ready<C, O> {
    Client {
        kind: StackKind,
        generation: u16,
        client: C,
        notification: StackNotification,
    },
    Observer {
        observer: O,
        chip: ChipId,
        version: ChipVersion,
    },
}

struct Chip<H, P, S, C, O> {
    id: ChipId,
    config: BringUpConfig,
    hci: H,
    power: P,
    script: S,
    observer: Option<O>,
    stacks: [StackLifecycleManager; STACK_KINDS],
    clients: [ClientSlot<C>; STACK_KINDS],
    arbiter: TransportArbiter,
    transport: TransportLifecycleManager,
    mailbox: Mailbox,
    journal: Journal,
    identified: bool,
}

impl<H, P, S, C, O> Chip<H, P, S, C, O>
where
    H: HciLink,
    P: PowerSequencer,
    S: InitScriptRunner,
    C: StackClient,
    O: ChipObserver,
{
    fn new(id: ChipId, hci: H, power: P, script: S, observer: O, config: BringUpConfig) -> Self {
        Self {
            id,
            config,
            hci,
            power,
            script,
            observer: Some(observer),
            stacks: StackKind::ALL.map(StackLifecycleManager::new),
            clients: [ClientSlot::empty(), ClientSlot::empty(), ClientSlot::empty()],
            arbiter: TransportArbiter::new(),
            transport: TransportLifecycleManager::new(),
            mailbox: Mailbox::new(),
            journal: Journal::new(),
            identified: false,
        }
    }

    /// Runs `f` against a fresh context, then drains the notices it produced.
    fn run<R>(
        &mut self,
        inbound: Option<&HciEvent>,
        f: impl FnOnce(&mut [StackLifecycleManager; STACK_KINDS], &mut StackContext<'_>) -> R,
    ) -> R {
        let Self {
            id,
            config,
            hci,
            power,
            script,
            stacks,
            arbiter,
            transport,
            mailbox,
            journal,
            identified,
            ..
        } = self;

        let mut ctx = StackContext {
            bus: Bus {
                chip: *id,
                config: *config,
                hci,
                script,
                mailbox,
                journal,
                inbound,
            },
            arbiter,
            transport,
            power,
            identified,
        };

        let result = f(&mut *stacks, &mut ctx);
        drain(stacks, &mut ctx);
        result
    }

    fn check_handle(&self, handle: StackHandle) -> Result<usize, ControllerError> {
        let index = handle.kind.index();
        let slot = &self.clients[index];
        if !slot.registered {
            return Err(ControllerError::NotRegistered);
        }
        if slot.generation != handle.generation {
            return Err(ControllerError::StaleHandle);
        }
        Ok(index)
    }

    fn register(&mut self, kind: StackKind, client: C) -> Result<StackHandle, ControllerError> {
        let slot = &mut self.clients[kind.index()];
        if slot.registered {
            return Err(ControllerError::AlreadyRegistered);
        }
        slot.registered = true;
        slot.generation = slot.generation.wrapping_add(1);
        slot.client = Some(client);
        Ok(StackHandle {
            chip: self.id,
            kind,
            generation: slot.generation,
        })
    }

    fn deregister(&mut self, handle: StackHandle) -> Result<(), ControllerError> {
        let index = self.check_handle(handle)?;
        if !self.stacks[index].state().is_settled() {
            return Err(ControllerError::ImproperState);
        }
        let slot = &mut self.clients[index];
        slot.registered = false;
        slot.client = None;
        Ok(())
    }

    fn client_call(
        &mut self,
        handle: StackHandle,
        event: StackEvent,
    ) -> Result<Completion, ControllerError> {
        let index = self.check_handle(handle)?;
        let result = self.run(None, |stacks, ctx| stacks[index].request(event, ctx));

        match result {
            Err(rejected) => {
                log_debug!("chip {}: {}", self.id.0, rejected);
                Err(ControllerError::ImproperState)
            }
            Ok(Completion::Pending) => Ok(Completion::Pending),
            Ok(Completion::Success) => match self.stacks[index].last_status() {
                Some(Status::Failure) => Err(ControllerError::HardwareFailure),
                _ => Ok(Completion::Success),
            },
        }
    }

    fn hci_event(&mut self, event: &HciEvent) -> Result<Completion, ControllerError> {
        self.run(Some(event), |_, ctx| {
            ctx.transport.deliver_hci_event(event, &mut ctx.bus)
        })
    }

    fn chip_version(&self, handle: StackHandle) -> Result<ChipVersion, ControllerError> {
        self.check_handle(handle)?;
        if !self.identified {
            return Err(ControllerError::VersionUnavailable);
        }
        self.transport
            .chip_version()
            .ok_or(ControllerError::VersionUnavailable)
    }

    fn reinitialize(&mut self) -> Result<(), ControllerError> {
        let transport_idle = matches!(
            self.transport.state(),
            TransportState::Off | TransportState::OnFailed
        );
        let stacks_settled = self.stacks.iter().all(|stack| stack.state().is_settled());
        if !transport_idle || !stacks_settled || !self.arbiter.is_idle() {
            return Err(ControllerError::ImproperState);
        }

        for stack in &mut self.stacks {
            stack.reset();
        }
        self.arbiter.reset();
        self.transport.reset();
        self.identified = false;
        self.journal.record(TransitionKind::Reinitialized);
        log_info!("chip {}: reinitialized", self.id.0);
        Ok(())
    }

    /// Takes the oldest delivery whose recipient is free to run it.
    ///
    /// A client still inside an earlier callback keeps its notifications
    /// queued, in order, without holding back other recipients.
    fn take_delivery(&mut self) -> Option<Ready<C, O>> {
        let Self {
            id,
            clients,
            observer,
            mailbox,
            ..
        } = self;

        let delivery = mailbox.select_delivery(|delivery| match delivery {
            Delivery::Client(notification) => {
                let slot = &clients[notification.stack.index()];
                if !slot.registered {
                    log_debug!("chip {}: dropped {:?}", id.0, notification);
                    Pick::Drop
                } else if slot.client.is_some() {
                    Pick::Take
                } else {
                    Pick::Keep
                }
            }
            Delivery::ChipIdentified(_) if observer.is_some() => Pick::Take,
            Delivery::ChipIdentified(_) => Pick::Keep,
        })?;

        match delivery {
            Delivery::Client(notification) => {
                let kind = notification.stack;
                let slot = &mut clients[kind.index()];
                let client = slot.client.take()?;
                Some(Ready::Client {
                    kind,
                    generation: slot.generation,
                    client,
                    notification,
                })
            }
            Delivery::ChipIdentified(version) => Some(Ready::Observer {
                observer: observer.take()?,
                chip: *id,
                version,
            }),
        }
    }

    fn restore_client(&mut self, kind: StackKind, generation: u16, client: C) {
        let slot = &mut self.clients[kind.index()];
        if slot.registered && slot.generation == generation && slot.client.is_none() {
            slot.client = Some(client);
        }
    }
}

/// Feeds queued child-to-parent notices to their parents until none remain.
fn drain(stacks: &mut [StackLifecycleManager; STACK_KINDS], ctx: &mut StackContext<'_>) {
    ctx.bus.inbound = None;
    while let Some(notice) = ctx.bus.mailbox.next_notice() {
        match notice {
            Notice::OnSequence(outcome) => {
                if ctx.transport.on_sequence_finished(outcome, &mut ctx.bus).is_err() {
                    invariant_violated("transport rejected a bring-up outcome");
                }
            }
            Notice::OffSequence(status) => {
                if ctx.transport.off_sequence_finished(status, &mut ctx.bus).is_err() {
                    invariant_violated("transport rejected a shutdown outcome");
                }
            }
            Notice::Transport(report) => {
                ctx.arbiter
                    .transport_finished(report, ctx.transport, &mut ctx.bus);
            }
            Notice::Stack { stack, event } => {
                if stacks[stack.index()].transport_event(event, ctx).is_err() {
                    invariant_violated("stack rejected a transport completion");
                }
            }
        }
    }
}

type ChipCell<H, P, S, C, O> = Mutex<CriticalSectionRawMutex, RefCell<Chip<H, P, S, C, O>>>;

/// Owns every chip and serializes access to each of them.
pub struct RadioController<H, P, S, C, O = (), const CHIPS: usize = MAX_CHIPS> {
    chips: Vec<(ChipId, ChipCell<H, P, S, C, O>), CHIPS>,
}

impl<H, P, S, C, O, const CHIPS: usize> RadioController<H, P, S, C, O, CHIPS> {
    #[must_use]
    pub const fn new() -> Self {
        Self { chips: Vec::new() }
    }

    /// Identifiers of the registered chips, in registration order.
    pub fn chips(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.chips.iter().map(|(id, _)| *id)
    }
}

impl<H, P, S, C, O, const CHIPS: usize> Default for RadioController<H, P, S, C, O, CHIPS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, P, S, C, O, const CHIPS: usize> RadioController<H, P, S, C, O, CHIPS>
where
    H: HciLink,
    P: PowerSequencer,
    S: InitScriptRunner,
    C: StackClient,
    O: ChipObserver,
{
    /// Adds a chip with its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::DuplicateChip`] when `id` is taken and
    /// [`ControllerError::RegistryFull`] when no slot is left.
    pub fn add_chip(
        &mut self,
        id: ChipId,
        hci: H,
        power: P,
        script: S,
        observer: O,
        config: BringUpConfig,
    ) -> Result<(), ControllerError> {
        if self.chips.iter().any(|(existing, _)| *existing == id) {
            return Err(ControllerError::DuplicateChip);
        }
        let chip = Chip::new(id, hci, power, script, observer, config);
        self.chips
            .push((id, Mutex::new(RefCell::new(chip))))
            .map_err(|_| ControllerError::RegistryFull)
    }

    /// Attaches `client` to the `kind` stack of `chip`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::UnknownChip`] or
    /// [`ControllerError::AlreadyRegistered`].
    pub fn register_stack(
        &self,
        chip: ChipId,
        kind: StackKind,
        client: C,
    ) -> Result<StackHandle, ControllerError> {
        self.call(chip, |chip| chip.register(kind, client))?
    }

    /// Detaches the client; the stack must be `Off` or `FatalError`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ImproperState`] while the stack is powered
    /// or mid-operation.
    pub fn deregister_stack(&self, handle: StackHandle) -> Result<(), ControllerError> {
        self.call(handle.chip, |chip| chip.deregister(handle))?
    }

    /// Powers the stack up.
    ///
    /// # Errors
    ///
    /// [`ControllerError::ImproperState`] unless the stack is `Off`;
    /// [`ControllerError::HardwareFailure`] when bring-up failed inside the call.
    pub fn stack_on(&self, handle: StackHandle) -> Result<Completion, ControllerError> {
        self.call(handle.chip, |chip| chip.client_call(handle, StackEvent::On))?
    }

    /// Cancels a bring-up in progress. The stack always ends `Off`.
    ///
    /// # Errors
    ///
    /// [`ControllerError::ImproperState`] unless the stack is `PoweringOn`.
    pub fn stack_on_abort(&self, handle: StackHandle) -> Result<Completion, ControllerError> {
        self.call(handle.chip, |chip| chip.client_call(handle, StackEvent::OnAbort))?
    }

    /// Powers the stack down.
    ///
    /// # Errors
    ///
    /// [`ControllerError::ImproperState`] unless the stack is `On`;
    /// [`ControllerError::HardwareFailure`] when shutdown failed inside the call.
    pub fn stack_off(&self, handle: StackHandle) -> Result<Completion, ControllerError> {
        self.call(handle.chip, |chip| chip.client_call(handle, StackEvent::Off))?
    }

    /// # Errors
    ///
    /// Fails for unknown chips and stale or unregistered handles.
    pub fn state(&self, handle: StackHandle) -> Result<StackState, ControllerError> {
        self.call(handle.chip, |chip| {
            chip.check_handle(handle)
                .map(|index| chip.stacks[index].state())
        })?
    }

    /// Version read during the first successful bring-up.
    ///
    /// # Errors
    ///
    /// [`ControllerError::VersionUnavailable`] before any stack reached `On`.
    pub fn chip_version(&self, handle: StackHandle) -> Result<ChipVersion, ControllerError> {
        self.call(handle.chip, |chip| chip.chip_version(handle))?
    }

    /// # Errors
    ///
    /// [`ControllerError::UnknownChip`].
    pub fn transport_state(&self, chip: ChipId) -> Result<TransportState, ControllerError> {
        self.call(chip, |chip| chip.transport.state())
    }

    /// Delivers an event raised by the HCI link driver.
    ///
    /// # Errors
    ///
    /// [`ControllerError::UnclaimedEvent`] when no sequencer holds the event
    /// route, [`ControllerError::ImproperState`] when the holder cannot use it.
    pub fn handle_hci_event(
        &self,
        chip: ChipId,
        event: &HciEvent,
    ) -> Result<Completion, ControllerError> {
        self.call(chip, |chip| chip.hci_event(event))?
    }

    /// Returns a chip to its initial state after a failed bring-up.
    ///
    /// # Errors
    ///
    /// [`ControllerError::ImproperState`] while any stack is powered or busy.
    pub fn reinitialize(&self, chip: ChipId) -> Result<(), ControllerError> {
        self.call(chip, Chip::reinitialize)?
    }

    /// Runs `f` with read access to the chip's transition journal.
    ///
    /// # Errors
    ///
    /// [`ControllerError::UnknownChip`].
    pub fn with_journal<R>(
        &self,
        chip: ChipId,
        f: impl FnOnce(&Journal) -> R,
    ) -> Result<R, ControllerError> {
        self.call(chip, |chip| f(&chip.journal))
    }

    fn cell(&self, chip: ChipId) -> Result<&ChipCell<H, P, S, C, O>, ControllerError> {
        self.chips
            .iter()
            .find(|(id, _)| *id == chip)
            .map(|(_, cell)| cell)
            .ok_or(ControllerError::UnknownChip)
    }

    fn call<R>(
        &self,
        chip: ChipId,
        f: impl FnOnce(&mut Chip<H, P, S, C, O>) -> R,
    ) -> Result<R, ControllerError> {
        let cell = self.cell(chip)?;
        let result = Self::locked(cell, f);
        Self::flush(cell);
        Ok(result)
    }

    fn locked<R>(
        cell: &ChipCell<H, P, S, C, O>,
        f: impl FnOnce(&mut Chip<H, P, S, C, O>) -> R,
    ) -> R {
        cell.lock(|chip| {
            let Ok(mut chip) = chip.try_borrow_mut() else {
                invariant_violated("chip re-entered from a collaborator");
            };
            f(&mut chip)
        })
    }

    /// Hands out queued callbacks with the chip unlocked.
    fn flush(cell: &ChipCell<H, P, S, C, O>) {
        while let Some(ready) = Self::locked(cell, |chip| chip.take_delivery()) {
            match ready {
                Ready::Client {
                    kind,
                    generation,
                    mut client,
                    notification,
                } => {
                    client.on_completion(notification);
                    Self::locked(cell, |chip| chip.restore_client(kind, generation, client));
                }
                Ready::Observer {
                    mut observer,
                    chip,
                    version,
                } => {
                    observer.chip_identified(chip, version);
                    Self::locked(cell, |chip| chip.observer = Some(observer));
                }
            }
        }
    }
}
