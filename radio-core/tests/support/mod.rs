#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use radio_core::hci::{HCI_SUCCESS, READ_LOCAL_VERSION, TEXAS_INSTRUMENTS};
use radio_core::{
    BringUpConfig, ChipId, ChipObserver, ChipVersion, Completion, CoreId, EventRoute, HciError,
    HciEvent, HciLink, HciStatus, InitScriptRunner, PowerError, PowerSequencer, RadioController,
    ScriptError, ScriptProgress, StackClient, StackHandle, StackKind, StackNotification,
};

pub const CHIP: ChipId = ChipId(0);
pub const STACK_ROUTE: EventRoute = EventRoute::Client(1);
pub const VENDOR_OPCODE: u16 = 0xFF36;

/// LMP subversion of project 7, version 2.26.
pub const SUBVERSION: u16 = (7 << 10) | (2 << 7) | 26;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkCall {
    TransportOn,
    TransportOff,
    ConfigureLink,
    Command(u16),
}

/// Everything the mocks observed, shared through `Rc<RefCell<_>>`.
pub struct Bench {
    pub route: EventRoute,
    pub link_calls: Vec<LinkCall>,
    pub on_reply: Result<HciStatus, HciError>,
    pub off_reply: Result<HciStatus, HciError>,
    pub configure_reply: Result<HciStatus, HciError>,
    pub asserted: Vec<CoreId>,
    pub released: Vec<CoreId>,
    pub fail_assert: bool,
    pub scripts: Vec<String>,
    pub notifications: Vec<StackNotification>,
    pub identified: Vec<(ChipId, ChipVersion)>,
}

impl Bench {
    fn new() -> Self {
        Self {
            route: STACK_ROUTE,
            link_calls: Vec::new(),
            on_reply: Ok(HciStatus::Pending),
            off_reply: Ok(HciStatus::Pending),
            configure_reply: Ok(HciStatus::Pending),
            asserted: Vec::new(),
            released: Vec::new(),
            fail_assert: false,
            scripts: Vec::new(),
            notifications: Vec::new(),
            identified: Vec::new(),
        }
    }

    pub fn count(&self, call: LinkCall) -> usize {
        self.link_calls.iter().filter(|seen| **seen == call).count()
    }

    /// Makes every link request complete inside the call.
    pub fn synchronous(&mut self) {
        self.on_reply = Ok(HciStatus::Complete);
        self.off_reply = Ok(HciStatus::Complete);
        self.configure_reply = Ok(HciStatus::Complete);
    }
}

pub type Probe = Rc<RefCell<Bench>>;

pub fn bench() -> Probe {
    Rc::new(RefCell::new(Bench::new()))
}

pub struct MockLink(pub Probe);

impl HciLink for MockLink {
    fn transport_on(&mut self) -> Result<HciStatus, HciError> {
        let mut bench = self.0.borrow_mut();
        bench.link_calls.push(LinkCall::TransportOn);
        bench.on_reply
    }

    fn transport_off(&mut self) -> Result<HciStatus, HciError> {
        let mut bench = self.0.borrow_mut();
        bench.link_calls.push(LinkCall::TransportOff);
        bench.off_reply
    }

    fn configure_link(&mut self) -> Result<HciStatus, HciError> {
        let mut bench = self.0.borrow_mut();
        bench.link_calls.push(LinkCall::ConfigureLink);
        bench.configure_reply
    }

    fn send_command(&mut self, opcode: u16, _params: &[u8]) -> Result<HciStatus, HciError> {
        self.0.borrow_mut().link_calls.push(LinkCall::Command(opcode));
        Ok(HciStatus::Pending)
    }

    fn replace_event_route(&mut self, route: EventRoute) -> EventRoute {
        std::mem::replace(&mut self.0.borrow_mut().route, route)
    }

    fn event_route(&self) -> EventRoute {
        self.0.borrow().route
    }
}

pub struct MockPower(pub Probe);

impl PowerSequencer for MockPower {
    fn assert_enable(&mut self, _chip: ChipId, core: CoreId) -> Result<(), PowerError> {
        let mut bench = self.0.borrow_mut();
        if bench.fail_assert {
            return Err(PowerError::LineFault(core));
        }
        bench.asserted.push(core);
        Ok(())
    }

    fn deassert_enable(&mut self, _chip: ChipId, core: CoreId) -> Result<(), PowerError> {
        self.0.borrow_mut().released.push(core);
        Ok(())
    }
}

/// Init script made of `steps` vendor commands.
pub struct MockScript {
    probe: Probe,
    steps: usize,
    remaining: usize,
    aborting: bool,
    abort_at_once: bool,
}

impl MockScript {
    pub fn new(probe: Probe, steps: usize) -> Self {
        Self {
            probe,
            steps,
            remaining: 0,
            aborting: false,
            abort_at_once: false,
        }
    }

    /// Gives up as soon as it is told to abort, even with a command in flight.
    pub fn abort_at_once(mut self) -> Self {
        self.abort_at_once = true;
        self
    }

    fn send_next(&mut self, hci: &mut dyn HciLink) -> ScriptProgress {
        match hci.send_command(VENDOR_OPCODE, &[]) {
            Ok(_) => ScriptProgress::Running,
            Err(_) => ScriptProgress::Finished(Err(ScriptError::CommandFailed(0xff))),
        }
    }
}

impl InitScriptRunner for MockScript {
    fn start(&mut self, name: &str, hci: &mut dyn HciLink) -> ScriptProgress {
        self.probe.borrow_mut().scripts.push(name.to_string());
        self.remaining = self.steps;
        self.aborting = false;
        if self.remaining == 0 {
            return ScriptProgress::Finished(Ok(()));
        }
        self.send_next(hci)
    }

    fn command_completed(
        &mut self,
        _status: u8,
        _params: &[u8],
        hci: &mut dyn HciLink,
    ) -> ScriptProgress {
        self.remaining = self.remaining.saturating_sub(1);
        if self.aborting {
            self.aborting = false;
            return ScriptProgress::Finished(Err(ScriptError::Aborted));
        }
        if self.remaining == 0 {
            return ScriptProgress::Finished(Ok(()));
        }
        self.send_next(hci)
    }

    fn params_applied(&mut self, _hci: &mut dyn HciLink) -> ScriptProgress {
        ScriptProgress::Running
    }

    fn abort(&mut self, _hci: &mut dyn HciLink) -> ScriptProgress {
        if self.remaining > 0 && !self.abort_at_once {
            self.aborting = true;
            ScriptProgress::Running
        } else {
            ScriptProgress::Finished(Err(ScriptError::Aborted))
        }
    }
}

pub struct Recorder(pub Probe);

impl StackClient for Recorder {
    fn on_completion(&mut self, notification: StackNotification) {
        self.0.borrow_mut().notifications.push(notification);
    }
}

pub struct Identify(pub Probe);

impl ChipObserver for Identify {
    fn chip_identified(&mut self, chip: ChipId, version: ChipVersion) {
        self.0.borrow_mut().identified.push((chip, version));
    }
}

pub type Controller = RadioController<MockLink, MockPower, MockScript, Recorder, Identify>;

/// Builds a one-chip controller whose init script has `script_steps` commands.
pub fn rig(script_steps: usize) -> (Controller, Probe) {
    rig_with(BringUpConfig::new(), |probe| MockScript::new(probe, script_steps))
}

pub fn rig_with(
    config: BringUpConfig,
    script: impl FnOnce(Probe) -> MockScript,
) -> (Controller, Probe) {
    let probe = bench();
    let mut controller = Controller::new();
    controller
        .add_chip(
            CHIP,
            MockLink(probe.clone()),
            MockPower(probe.clone()),
            script(probe.clone()),
            Identify(probe.clone()),
            config,
        )
        .expect("first chip fits");
    (controller, probe)
}

pub fn register(controller: &Controller, probe: &Probe, kind: StackKind) -> StackHandle {
    controller
        .register_stack(CHIP, kind, Recorder(probe.clone()))
        .expect("stack registers")
}

pub fn version_reply() -> HciEvent {
    version_reply_from(TEXAS_INSTRUMENTS)
}

pub fn version_reply_from(manufacturer: u16) -> HciEvent {
    let mut params = [0u8; 12];
    params[0] = 1;
    params[1..3].copy_from_slice(&READ_LOCAL_VERSION.to_le_bytes());
    params[3] = HCI_SUCCESS;
    params[8..10].copy_from_slice(&manufacturer.to_le_bytes());
    params[10..12].copy_from_slice(&SUBVERSION.to_le_bytes());
    HciEvent::command_complete(READ_LOCAL_VERSION, HCI_SUCCESS, &params)
}

pub fn script_reply() -> HciEvent {
    HciEvent::command_complete(VENDOR_OPCODE, HCI_SUCCESS, &[])
}

pub fn deliver(controller: &Controller, event: &HciEvent) -> Completion {
    controller
        .handle_hci_event(CHIP, event)
        .unwrap_or_else(|err| panic!("{event:?} rejected: {err}"))
}

/// Walks a pending bring-up through link on, version read, `script_steps`
/// script replies and link configuration.
pub fn finish_bring_up(controller: &Controller, script_steps: usize) {
    deliver(controller, &HciEvent::TransportOnCompleted { status: HCI_SUCCESS });
    deliver(controller, &version_reply());
    for _ in 0..script_steps {
        deliver(controller, &script_reply());
    }
    deliver(controller, &HciEvent::LinkConfigured { status: HCI_SUCCESS });
}

pub fn finish_shutdown(controller: &Controller) {
    deliver(
        controller,
        &HciEvent::TransportOffCompleted { status: HCI_SUCCESS },
    );
}
