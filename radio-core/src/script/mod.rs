//! Vendor init-script execution during bring-up.
//!
//! After the chip reports its version the on-sequencer asks the runner to
//! play the matching init script. The runner issues HCI commands through the
//! link and is fed every reply until it reports completion.

use core::fmt::{self, Write as _};

use heapless::String;

use crate::hci::{ChipVersion, HciLink};

/// Longest script file name the controller will build.
pub const MAX_SCRIPT_NAME: usize = 48;

/// Script file name, e.g. `tiinit_7.2.26.bts`.
pub type ScriptName = String<MAX_SCRIPT_NAME>;

/// Why an init script did not finish.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScriptError {
    NotFound,
    Malformed,
    /// A script command was answered with a failing HCI status.
    CommandFailed(u8),
    Aborted,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::NotFound => f.write_str("init script not found"),
            ScriptError::Malformed => f.write_str("init script is malformed"),
            ScriptError::CommandFailed(status) => {
                write!(f, "init script command failed (status {status:#04x})")
            }
            ScriptError::Aborted => f.write_str("init script aborted"),
        }
    }
}

impl core::error::Error for ScriptError {}

/// Progress reported after each runner step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScriptProgress {
    /// Waiting for the reply to a command that was just sent.
    Running,
    Finished(Result<(), ScriptError>),
}

/// Plays init scripts over the HCI link.
pub trait InitScriptRunner {
    fn start(&mut self, name: &str, hci: &mut dyn HciLink) -> ScriptProgress;

    /// Feeds the reply to the last script command.
    fn command_completed(&mut self, status: u8, params: &[u8], hci: &mut dyn HciLink)
    -> ScriptProgress;

    /// The link acknowledged a transport parameter change made by the script.
    fn params_applied(&mut self, hci: &mut dyn HciLink) -> ScriptProgress;

    /// Stops at the next command boundary.
    fn abort(&mut self, hci: &mut dyn HciLink) -> ScriptProgress;
}

/// Runner for chips that need no init script.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoInitScript;

impl InitScriptRunner for NoInitScript {
    fn start(&mut self, _name: &str, _hci: &mut dyn HciLink) -> ScriptProgress {
        ScriptProgress::Finished(Ok(()))
    }

    fn command_completed(
        &mut self,
        _status: u8,
        _params: &[u8],
        _hci: &mut dyn HciLink,
    ) -> ScriptProgress {
        ScriptProgress::Finished(Ok(()))
    }

    fn params_applied(&mut self, _hci: &mut dyn HciLink) -> ScriptProgress {
        ScriptProgress::Finished(Ok(()))
    }

    fn abort(&mut self, _hci: &mut dyn HciLink) -> ScriptProgress {
        ScriptProgress::Finished(Err(ScriptError::Aborted))
    }
}

/// Builds `"{prefix}{project}.{major}.{minor}.bts"`.
///
/// Returns `None` when the name does not fit in [`ScriptName`].
#[must_use]
pub fn script_name(prefix: &str, version: ChipVersion) -> Option<ScriptName> {
    let mut name = ScriptName::new();
    write!(
        name,
        "{prefix}{}.{}.{}.bts",
        version.project_type, version.version_major, version.version_minor
    )
    .ok()?;
    Some(name)
}
