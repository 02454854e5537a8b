//! Contract with the HCI transport driver.
//!
//! The controller never frames HCI packets itself. It asks the link to switch
//! the transport on or off, to issue commands, and to hand incoming events to
//! whichever sequencer currently holds the event route.

use core::fmt;

use heapless::Vec;

/// Maximum parameter bytes retained from a Command Complete event.
pub const MAX_HCI_PARAMS: usize = 32;

/// HCI status byte reported for success.
pub const HCI_SUCCESS: u8 = 0x00;

/// Opcode of the Read Local Version Information command.
pub const READ_LOCAL_VERSION: u16 = 0x1001;

/// Manufacturer identifier reported by the supported chip family.
pub const TEXAS_INSTRUMENTS: u16 = 13;

/// Parameter bytes carried by a Command Complete event.
pub type HciParams = Vec<u8, MAX_HCI_PARAMS>;

/// Immediate result of a link request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciStatus {
    /// The result will arrive later as an [`HciEvent`].
    Pending,
    /// The request completed inside the call.
    Complete,
}

/// Link-level failure reported inline by a request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciError {
    NotConnected,
    Busy,
    Rejected(u8),
}

impl fmt::Display for HciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HciError::NotConnected => f.write_str("HCI transport is not connected"),
            HciError::Busy => f.write_str("HCI transport is busy"),
            HciError::Rejected(status) => write!(f, "HCI request rejected (status {status:#04x})"),
        }
    }
}

impl core::error::Error for HciError {}

/// Event delivered by the link driver to the controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HciEvent {
    TransportOnCompleted { status: u8 },
    TransportOffCompleted { status: u8 },
    CommandComplete {
        opcode: u16,
        status: u8,
        params: HciParams,
    },
    TransportParamsApplied,
    LinkConfigured { status: u8 },
}

impl HciEvent {
    /// Builds a Command Complete event, truncating parameters that do not fit.
    ///
    /// Truncation is logged at warn level; the receiver sees the first
    /// [`MAX_HCI_PARAMS`] bytes.
    #[must_use]
    pub fn command_complete(opcode: u16, status: u8, params: &[u8]) -> Self {
        let keep = params.len().min(MAX_HCI_PARAMS);
        if keep < params.len() {
            log_warn!(
                "command {:#x} reply truncated from {} to {} bytes",
                opcode,
                params.len(),
                keep
            );
        }
        let mut buffer = HciParams::new();
        // `keep` never exceeds the buffer capacity.
        let _ = buffer.extend_from_slice(&params[..keep]);
        HciEvent::CommandComplete {
            opcode,
            status,
            params: buffer,
        }
    }
}

/// Receiver the link driver hands events to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventRoute {
    Unclaimed,
    /// Installed by the protocol stack that normally owns the link.
    Client(u16),
    PowerOnSequencer,
    PowerOffSequencer,
}

/// Link operations the sequencers depend on.
pub trait HciLink {
    fn transport_on(&mut self) -> Result<HciStatus, HciError>;

    fn transport_off(&mut self) -> Result<HciStatus, HciError>;

    /// Applies the post-script link settings.
    fn configure_link(&mut self) -> Result<HciStatus, HciError>;

    /// Sends a command; its reply arrives as [`HciEvent::CommandComplete`].
    fn send_command(&mut self, opcode: u16, params: &[u8]) -> Result<HciStatus, HciError>;

    /// Installs `route` and returns the route it replaced.
    fn replace_event_route(&mut self, route: EventRoute) -> EventRoute;

    fn event_route(&self) -> EventRoute;
}

/// Saved event route that must be handed back when a sequence finishes.
#[derive(Debug, Eq, PartialEq)]
#[must_use = "a route lease must be released to restore the previous receiver"]
pub struct RouteLease {
    claimed: EventRoute,
    previous: EventRoute,
}

impl RouteLease {
    /// Redirects link events to `route`, remembering the previous receiver.
    pub fn claim(link: &mut dyn HciLink, route: EventRoute) -> Self {
        let previous = link.replace_event_route(route);
        Self {
            claimed: route,
            previous,
        }
    }

    #[must_use]
    pub const fn claimed(&self) -> EventRoute {
        self.claimed
    }

    #[must_use]
    pub const fn previous(&self) -> EventRoute {
        self.previous
    }

    /// Restores the previous receiver.
    pub fn release(self, link: &mut dyn HciLink) {
        let displaced = link.replace_event_route(self.previous);
        if displaced != self.claimed {
            log_warn!(
                "event route changed under lease: expected {:?}, found {:?}",
                self.claimed,
                displaced
            );
        }
    }
}

/// Identity decoded from the LMP subversion of the local version reply.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChipVersion {
    pub project_type: u16,
    pub version_major: u16,
    pub version_minor: u16,
}

impl ChipVersion {
    #[must_use]
    pub const fn from_lmp_subversion(subversion: u16) -> Self {
        let mut version_major = (subversion & 0x0380) >> 7;
        if subversion & 0x8000 != 0 {
            version_major |= 0x08;
        }
        Self {
            project_type: (subversion & 0x7C00) >> 10,
            version_major,
            version_minor: subversion & 0x007F,
        }
    }
}

impl fmt::Display for ChipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.project_type, self.version_major, self.version_minor
        )
    }
}

/// Fields of interest from a Read Local Version reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LocalVersion {
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

/// Why a Read Local Version reply could not be used.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VersionError {
    Truncated { len: usize },
    UnexpectedManufacturer { found: u16, expected: u16 },
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::Truncated { len } => {
                write!(f, "local version reply truncated at {len} bytes")
            }
            VersionError::UnexpectedManufacturer { found, expected } => {
                write!(f, "manufacturer {found} does not match expected {expected}")
            }
        }
    }
}

impl core::error::Error for VersionError {}

const MANUFACTURER_OFFSET: usize = 8;
const SUBVERSION_OFFSET: usize = 10;

impl LocalVersion {
    /// Parses the Command Complete parameter block of Read Local Version.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::Truncated`] when the block is too short.
    pub fn parse(params: &[u8]) -> Result<Self, VersionError> {
        let field = |offset: usize| {
            params
                .get(offset..offset + 2)
                .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
                .ok_or(VersionError::Truncated { len: params.len() })
        };
        Ok(Self {
            manufacturer: field(MANUFACTURER_OFFSET)?,
            lmp_subversion: field(SUBVERSION_OFFSET)?,
        })
    }

    /// Checks the manufacturer when an expectation is configured.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::UnexpectedManufacturer`] on mismatch.
    pub fn verify(self, expected: Option<u16>) -> Result<ChipVersion, VersionError> {
        match expected {
            Some(expected) if expected != self.manufacturer => {
                Err(VersionError::UnexpectedManufacturer {
                    found: self.manufacturer,
                    expected,
                })
            }
            _ => Ok(ChipVersion::from_lmp_subversion(self.lmp_subversion)),
        }
    }
}
