mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use radio_core::hci::HCI_SUCCESS;
use radio_core::{
    BringUpConfig, Completion, ControllerError, CoreId, EventRoute, HciError, HciEvent, HciLink,
    HciStatus, NoInitScript, NoopPowerSequencer, RadioController, StackClient, StackEventType,
    StackHandle, StackKind, StackNotification, StackState, StackStatus, TransportState,
};

use support::{
    CHIP, LinkCall, MockLink, MockPower, MockScript, Probe, deliver, finish_bring_up,
    finish_shutdown, register, rig, version_reply,
};

fn completed(stack: StackKind, event: StackEventType, status: StackStatus) -> StackNotification {
    StackNotification {
        stack,
        event,
        status,
    }
}

#[test]
fn requests_during_bring_up_are_served_in_arrival_order() {
    let (controller, probe) = rig(1);
    let bt = register(&controller, &probe, StackKind::Bluetooth);
    let fm = register(&controller, &probe, StackKind::Fm);
    let gps = register(&controller, &probe, StackKind::Gps);

    assert_eq!(controller.stack_on(bt), Ok(Completion::Pending));
    assert_eq!(controller.stack_on(gps), Ok(Completion::Pending));
    assert_eq!(controller.stack_on(fm), Ok(Completion::Pending));
    assert_eq!(probe.borrow().count(LinkCall::TransportOn), 1);

    finish_bring_up(&controller, 1);

    for handle in [bt, fm, gps] {
        assert_eq!(controller.state(handle), Ok(StackState::On));
    }
    let bench = probe.borrow();
    assert_eq!(
        bench.notifications,
        vec![
            completed(StackKind::Bluetooth, StackEventType::OnComplete, StackStatus::Success),
            completed(StackKind::Gps, StackEventType::OnComplete, StackStatus::Success),
            completed(StackKind::Fm, StackEventType::OnComplete, StackStatus::Success),
        ]
    );
    assert_eq!(bench.count(LinkCall::TransportOn), 1);
    assert_eq!(bench.identified.len(), 1);
}

#[test]
fn on_queued_behind_shutdown_restarts_the_link() {
    let (controller, probe) = rig(0);
    let bt = register(&controller, &probe, StackKind::Bluetooth);

    controller.stack_on(bt).expect("off accepts on");
    finish_bring_up(&controller, 0);
    assert_eq!(controller.stack_off(bt), Ok(Completion::Pending));

    let fm = register(&controller, &probe, StackKind::Fm);
    assert_eq!(controller.stack_on(fm), Ok(Completion::Pending));
    assert_eq!(controller.transport_state(CHIP), Ok(TransportState::PoweringOff));

    finish_shutdown(&controller);
    assert_eq!(controller.state(bt), Ok(StackState::Off));
    assert_eq!(controller.state(fm), Ok(StackState::PoweringOn));
    assert_eq!(controller.transport_state(CHIP), Ok(TransportState::PoweringOn));

    finish_bring_up(&controller, 0);
    assert_eq!(controller.state(fm), Ok(StackState::On));

    let bench = probe.borrow();
    assert_eq!(bench.count(LinkCall::TransportOn), 2);
    assert_eq!(bench.count(LinkCall::TransportOff), 1);
    assert_eq!(
        bench.notifications,
        vec![
            completed(StackKind::Bluetooth, StackEventType::OnComplete, StackStatus::Success),
            completed(StackKind::Bluetooth, StackEventType::OffComplete, StackStatus::Success),
            completed(StackKind::Fm, StackEventType::OnComplete, StackStatus::Success),
        ]
    );
}

#[test]
fn failed_bring_up_fails_every_waiting_stack() {
    let (controller, probe) = rig(0);
    let bt = register(&controller, &probe, StackKind::Bluetooth);
    let fm = register(&controller, &probe, StackKind::Fm);
    let gps = register(&controller, &probe, StackKind::Gps);

    controller.stack_on(bt).expect("off accepts on");
    controller.stack_on(fm).expect("off accepts on");
    deliver(&controller, &HciEvent::TransportOnCompleted { status: 0x0c });

    assert_eq!(controller.transport_state(CHIP), Ok(TransportState::OnFailed));
    assert_eq!(controller.state(bt), Ok(StackState::FatalError));
    assert_eq!(controller.state(fm), Ok(StackState::FatalError));
    {
        let bench = probe.borrow();
        assert_eq!(
            bench.notifications,
            vec![
                completed(StackKind::Bluetooth, StackEventType::OnComplete, StackStatus::Failure),
                completed(StackKind::Fm, StackEventType::OnComplete, StackStatus::Failure),
            ]
        );
        assert_eq!(bench.released, vec![CoreId::Bt, CoreId::Fm]);
    }

    // A failed transport refuses later requests without retrying the link.
    assert_eq!(
        controller.stack_on(gps),
        Err(ControllerError::HardwareFailure)
    );
    assert_eq!(controller.state(gps), Ok(StackState::FatalError));
    let bench = probe.borrow();
    assert_eq!(bench.count(LinkCall::TransportOn), 1);
    assert_eq!(bench.released, vec![CoreId::Bt, CoreId::Fm, CoreId::Gps]);
}

type Callback = Box<dyn FnMut(StackNotification)>;
type ReentrantController = RadioController<MockLink, MockPower, MockScript, Callback>;

fn reentrant_rig() -> (Rc<ReentrantController>, Probe) {
    let probe = support::bench();
    let mut controller = ReentrantController::new();
    controller
        .add_chip(
            CHIP,
            MockLink(probe.clone()),
            MockPower(probe.clone()),
            MockScript::new(probe.clone(), 0),
            (),
            BringUpConfig::new(),
        )
        .expect("first chip fits");
    (Rc::new(controller), probe)
}

fn feed(controller: &ReentrantController, events: &[HciEvent]) {
    for event in events {
        controller
            .handle_hci_event(CHIP, event)
            .unwrap_or_else(|err| panic!("{event:?} rejected: {err}"));
    }
}

fn bring_up_replies() -> [HciEvent; 3] {
    [
        HciEvent::TransportOnCompleted {
            status: HCI_SUCCESS,
        },
        version_reply(),
        HciEvent::LinkConfigured {
            status: HCI_SUCCESS,
        },
    ]
}

const LINK_DOWN: HciEvent = HciEvent::TransportOffCompleted {
    status: HCI_SUCCESS,
};

#[test]
fn client_may_call_back_into_the_controller() {
    let (controller, _probe) = reentrant_rig();

    let handle: Rc<Cell<Option<StackHandle>>> = Rc::new(Cell::new(None));
    let replies: Rc<RefCell<Vec<(StackNotification, Option<Result<Completion, ControllerError>>)>>> =
        Rc::new(RefCell::new(Vec::new()));

    let client: Callback = {
        let controller = Rc::downgrade(&controller);
        let handle = handle.clone();
        let replies = replies.clone();
        Box::new(move |notification: StackNotification| {
            let reply = match (controller.upgrade(), handle.get()) {
                (Some(controller), Some(handle))
                    if notification.event == StackEventType::OnComplete =>
                {
                    Some(controller.stack_off(handle))
                }
                _ => None,
            };
            replies.borrow_mut().push((notification, reply));
        })
    };
    let bt = controller
        .register_stack(CHIP, StackKind::Bluetooth, client)
        .expect("stack registers");
    handle.set(Some(bt));

    controller.stack_on(bt).expect("off accepts on");
    feed(&controller, &bring_up_replies());

    assert_eq!(controller.state(bt), Ok(StackState::PoweringOff));
    feed(&controller, &[LINK_DOWN]);

    assert_eq!(controller.state(bt), Ok(StackState::Off));
    assert_eq!(
        *replies.borrow(),
        vec![
            (
                completed(StackKind::Bluetooth, StackEventType::OnComplete, StackStatus::Success),
                Some(Ok(Completion::Pending)),
            ),
            (
                completed(StackKind::Bluetooth, StackEventType::OffComplete, StackStatus::Success),
                None,
            ),
        ]
    );
}

#[test]
fn busy_client_does_not_hold_back_other_stacks() {
    // More completions than the delivery queue holds.
    const CYCLES: usize = 20;

    let (controller, probe) = reentrant_rig();
    let seen: Rc<RefCell<Vec<StackNotification>>> = Rc::default();
    let bt_handle: Rc<Cell<Option<StackHandle>>> = Rc::default();
    let fm_handle: Rc<Cell<Option<StackHandle>>> = Rc::default();

    let fm_client: Callback = {
        let seen = seen.clone();
        Box::new(move |notification: StackNotification| seen.borrow_mut().push(notification))
    };
    // Bluetooth shuts down and then cycles FM from inside its own callback.
    let bt_client: Callback = {
        let controller = Rc::downgrade(&controller);
        let seen = seen.clone();
        let bt_handle = bt_handle.clone();
        let fm_handle = fm_handle.clone();
        Box::new(move |notification: StackNotification| {
            seen.borrow_mut().push(notification);
            if notification.event != StackEventType::OnComplete {
                return;
            }
            let (Some(controller), Some(bt), Some(fm)) =
                (controller.upgrade(), bt_handle.get(), fm_handle.get())
            else {
                return;
            };
            assert_eq!(controller.stack_off(bt), Ok(Completion::Pending));
            feed(&controller, &[LINK_DOWN]);
            for _ in 0..CYCLES {
                assert_eq!(controller.stack_on(fm), Ok(Completion::Pending));
                feed(&controller, &bring_up_replies());
                assert_eq!(controller.stack_off(fm), Ok(Completion::Pending));
                feed(&controller, &[LINK_DOWN]);
            }
        })
    };
    let bt = controller
        .register_stack(CHIP, StackKind::Bluetooth, bt_client)
        .expect("stack registers");
    let fm = controller
        .register_stack(CHIP, StackKind::Fm, fm_client)
        .expect("stack registers");
    bt_handle.set(Some(bt));
    fm_handle.set(Some(fm));

    assert_eq!(controller.stack_on(bt), Ok(Completion::Pending));
    feed(&controller, &bring_up_replies());

    assert_eq!(controller.state(bt), Ok(StackState::Off));
    assert_eq!(controller.state(fm), Ok(StackState::Off));
    assert_eq!(controller.transport_state(CHIP), Ok(TransportState::Off));
    assert_eq!(probe.borrow().count(LinkCall::TransportOn), CYCLES + 1);

    let mut expected = vec![completed(
        StackKind::Bluetooth,
        StackEventType::OnComplete,
        StackStatus::Success,
    )];
    for _ in 0..CYCLES {
        expected.push(completed(StackKind::Fm, StackEventType::OnComplete, StackStatus::Success));
        expected.push(completed(StackKind::Fm, StackEventType::OffComplete, StackStatus::Success));
    }
    expected.push(completed(
        StackKind::Bluetooth,
        StackEventType::OffComplete,
        StackStatus::Success,
    ));
    assert_eq!(*seen.borrow(), expected);
}

/// Link whose requests all finish inside the call, except commands.
struct SyncLink {
    route: EventRoute,
}

impl HciLink for SyncLink {
    fn transport_on(&mut self) -> Result<HciStatus, HciError> {
        Ok(HciStatus::Complete)
    }

    fn transport_off(&mut self) -> Result<HciStatus, HciError> {
        Ok(HciStatus::Complete)
    }

    fn configure_link(&mut self) -> Result<HciStatus, HciError> {
        Ok(HciStatus::Complete)
    }

    fn send_command(&mut self, _opcode: u16, _params: &[u8]) -> Result<HciStatus, HciError> {
        Ok(HciStatus::Pending)
    }

    fn replace_event_route(&mut self, route: EventRoute) -> EventRoute {
        std::mem::replace(&mut self.route, route)
    }

    fn event_route(&self) -> EventRoute {
        self.route
    }
}

struct Tally(Arc<AtomicUsize>);

impl StackClient for Tally {
    fn on_completion(&mut self, _notification: StackNotification) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn concurrent_callers_see_consistent_state() {
    const ROUNDS: usize = 200;

    let notified = Arc::new(AtomicUsize::new(0));
    let mut controller =
        RadioController::<SyncLink, NoopPowerSequencer, NoInitScript, Tally>::new();
    controller
        .add_chip(
            CHIP,
            SyncLink {
                route: EventRoute::Unclaimed,
            },
            NoopPowerSequencer,
            NoInitScript,
            (),
            BringUpConfig::new(),
        )
        .expect("first chip fits");

    let [bt, fm, gps] = StackKind::ALL.map(|kind| {
        controller
            .register_stack(CHIP, kind, Tally(notified.clone()))
            .expect("stack registers")
    });

    assert_eq!(controller.stack_on(bt), Ok(Completion::Pending));
    controller
        .handle_hci_event(CHIP, &version_reply())
        .expect("bring-up accepts the version reply");
    assert_eq!(controller.state(bt), Ok(StackState::On));

    std::thread::scope(|scope| {
        for handle in [fm, gps] {
            let controller = &controller;
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    assert_eq!(controller.stack_on(handle), Ok(Completion::Success));
                    assert_eq!(controller.stack_off(handle), Ok(Completion::Success));
                }
            });
        }
    });

    assert_eq!(controller.state(fm), Ok(StackState::Off));
    assert_eq!(controller.state(gps), Ok(StackState::Off));
    assert_eq!(controller.state(bt), Ok(StackState::On));
    assert_eq!(controller.transport_state(CHIP), Ok(TransportState::On));
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}
