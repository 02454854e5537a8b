#![no_std]

// Lifecycle control for combination radio chips whose Bluetooth, FM and GPS
// cores share one HCI transport and one set of enable lines.
//
// The crate avoids the standard library so the same state machines can run in
// a host daemon, in firmware, or under the emulator.

#[macro_use]
pub mod telemetry;

pub mod arbiter;
pub mod controller;
pub mod dispatch;
pub mod hci;
pub mod power;
pub mod script;
pub mod sequencer;
pub mod stack;
pub mod transport;

pub use controller::{
    BringUpConfig, ChipId, ChipObserver, ControllerError, MAX_CHIPS, RadioController, StackClient,
    StackHandle,
};
pub use dispatch::{Completion, Status};
pub use hci::{ChipVersion, EventRoute, HciError, HciEvent, HciLink, HciStatus};
pub use power::{CoreId, NoopPowerSequencer, PowerError, PowerSequencer};
pub use script::{InitScriptRunner, NoInitScript, ScriptError, ScriptProgress};
pub use stack::{StackEventType, StackKind, StackNotification, StackState, StackStatus};
pub use telemetry::{Journal, TransitionKind, TransitionRecord};
pub use transport::TransportState;
