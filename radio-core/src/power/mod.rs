//! Hardware enable lines for the chip's radio cores.

use core::fmt;

use crate::controller::ChipId;

/// Radio core with its own enable line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CoreId {
    Bt,
    Fm,
    Gps,
}

/// Failure reported by the power collaborator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerError {
    /// The line could not be driven.
    LineFault(CoreId),
    /// The chip is not known to the collaborator.
    UnknownChip(ChipId),
}

impl fmt::Display for PowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerError::LineFault(core) => write!(f, "enable line for {core:?} did not respond"),
            PowerError::UnknownChip(chip) => write!(f, "no enable lines for chip {}", chip.0),
        }
    }
}

impl core::error::Error for PowerError {}

/// Drives per-core enable lines.
///
/// Cores may share a physical pin; reference counting shared pins is the
/// collaborator's job.
pub trait PowerSequencer {
    /// Powers the core up.
    ///
    /// # Errors
    ///
    /// Returns [`PowerError`] when the line cannot be driven.
    fn assert_enable(&mut self, chip: ChipId, core: CoreId) -> Result<(), PowerError>;

    /// Powers the core down.
    ///
    /// # Errors
    ///
    /// Returns [`PowerError`] when the line cannot be driven.
    fn deassert_enable(&mut self, chip: ChipId, core: CoreId) -> Result<(), PowerError>;
}

/// Power sequencer for boards whose enable lines are hard-wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPowerSequencer;

impl PowerSequencer for NoopPowerSequencer {
    fn assert_enable(&mut self, _chip: ChipId, _core: CoreId) -> Result<(), PowerError> {
        Ok(())
    }

    fn deassert_enable(&mut self, _chip: ChipId, _core: CoreId) -> Result<(), PowerError> {
        Ok(())
    }
}
