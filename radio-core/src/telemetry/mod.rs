//! Logging macros and the per-chip transition journal.
//!
//! Log output follows the target: the `defmt` feature forwards to `defmt`, the
//! `log` feature forwards to the `log` facade, and without either feature the
//! macros only type-check their arguments. The journal is a fixed-capacity
//! ring that keeps the most recent lifecycle transitions of one chip so hosts
//! can inspect what the state machines did without enabling logging.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered};

use crate::arbiter::QueuedRequest;
use crate::hci::ChipVersion;
use crate::sequencer::off::{OffSequenceEvent, OffSequenceState};
use crate::sequencer::on::{OnSequenceEvent, OnSequenceState};
use crate::stack::{StackEvent, StackKind, StackNotification, StackState};
use crate::transport::{TransportEvent, TransportState};

macro_rules! log_at {
    ($defmt:ident, $log:ident, $($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::$defmt!($($arg)*);
        #[cfg(feature = "log")]
        ::log::$log!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "log")))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => { log_at!(debug, debug, $($arg)*) };
}

macro_rules! log_info {
    ($($arg:tt)*) => { log_at!(info, info, $($arg)*) };
}

macro_rules! log_warn {
    ($($arg:tt)*) => { log_at!(warn, warn, $($arg)*) };
}

macro_rules! log_error {
    ($($arg:tt)*) => { log_at!(error, error, $($arg)*) };
}

/// Bound shared by every value that appears in log statements.
#[cfg(feature = "defmt")]
pub trait Traceable: fmt::Debug + defmt::Format {}

#[cfg(feature = "defmt")]
impl<T> Traceable for T where T: fmt::Debug + defmt::Format {}

/// Bound shared by every value that appears in log statements.
#[cfg(not(feature = "defmt"))]
pub trait Traceable: fmt::Debug {}

#[cfg(not(feature = "defmt"))]
impl<T> Traceable for T where T: fmt::Debug {}

/// Identifier assigned to each journal record.
pub type EventId = u32;

/// Number of transitions retained per chip.
pub const JOURNAL_CAPACITY: usize = 64;

/// One observable step taken by a chip's lifecycle machinery.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionKind {
    Stack {
        stack: StackKind,
        from: StackState,
        event: StackEvent,
        to: StackState,
    },
    Transport {
        from: TransportState,
        event: TransportEvent,
        to: TransportState,
    },
    OnSequence {
        from: OnSequenceState,
        event: OnSequenceEvent,
        to: OnSequenceState,
    },
    OffSequence {
        from: OffSequenceState,
        event: OffSequenceEvent,
        to: OffSequenceState,
    },
    /// A request was parked behind the transition currently in progress.
    Queued {
        stack: StackKind,
        request: QueuedRequest,
    },
    EnableAsserted(StackKind),
    EnableReleased(StackKind),
    ChipIdentified(ChipVersion),
    Notified(StackNotification),
    Reinitialized,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Stack {
                stack,
                from,
                event,
                to,
            } => write!(f, "stack {stack:?} {from:?} --{event:?}--> {to:?}"),
            TransitionKind::Transport { from, event, to } => {
                write!(f, "transport {from:?} --{event:?}--> {to:?}")
            }
            TransitionKind::OnSequence { from, event, to } => {
                write!(f, "on-sequence {from:?} --{event:?}--> {to:?}")
            }
            TransitionKind::OffSequence { from, event, to } => {
                write!(f, "off-sequence {from:?} --{event:?}--> {to:?}")
            }
            TransitionKind::Queued { stack, request } => {
                write!(f, "queued {request:?} for {stack:?}")
            }
            TransitionKind::EnableAsserted(stack) => write!(f, "enable asserted {stack:?}"),
            TransitionKind::EnableReleased(stack) => write!(f, "enable released {stack:?}"),
            TransitionKind::ChipIdentified(version) => write!(f, "chip identified {version}"),
            TransitionKind::Notified(notification) => write!(
                f,
                "notified {:?} {:?} {:?}",
                notification.stack, notification.event, notification.status
            ),
            TransitionKind::Reinitialized => f.write_str("reinitialized"),
        }
    }
}

/// Journal entry stored in the ring buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransitionRecord {
    pub id: EventId,
    pub kind: TransitionKind,
}

/// Records lifecycle transitions into a fixed-size ring buffer.
pub struct TransitionJournal<const CAPACITY: usize = JOURNAL_CAPACITY> {
    ring: HistoryBuf<TransitionRecord, CAPACITY>,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> TransitionJournal<CAPACITY> {
    /// Creates an empty journal.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Appends a record and returns its identifier.
    pub fn record(&mut self, kind: TransitionKind) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.ring.write(TransitionRecord { id, kind });
        id
    }

    /// Returns the retained records in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TransitionRecord> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent record, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&TransitionRecord> {
        self.ring.recent()
    }

    /// Returns the number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Counts retained records matching `predicate`.
    pub fn count_matching<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&TransitionKind) -> bool,
    {
        self.oldest_first()
            .filter(|record| predicate(&record.kind))
            .count()
    }
}

impl<const CAPACITY: usize> Default for TransitionJournal<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

/// Journal type used by every chip.
pub type Journal = TransitionJournal<JOURNAL_CAPACITY>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_keep_chronological_order_and_wrap() {
        let mut journal = TransitionJournal::<2>::new();

        let first = journal.record(TransitionKind::EnableAsserted(StackKind::Bluetooth));
        let second = journal.record(TransitionKind::EnableAsserted(StackKind::Fm));
        let third = journal.record(TransitionKind::EnableReleased(StackKind::Bluetooth));

        assert_eq!((first, second, third), (0, 1, 2));
        assert_eq!(journal.len(), 2);

        let ids: heapless::Vec<EventId, 2> =
            journal.oldest_first().map(|record| record.id).collect();
        assert_eq!(ids.as_slice(), &[1, 2]);
        assert_eq!(
            journal.latest().map(|record| record.kind),
            Some(TransitionKind::EnableReleased(StackKind::Bluetooth))
        );
    }

    #[test]
    fn count_matching_filters_by_kind() {
        let mut journal = Journal::new();
        journal.record(TransitionKind::EnableAsserted(StackKind::Gps));
        journal.record(TransitionKind::Reinitialized);
        journal.record(TransitionKind::EnableAsserted(StackKind::Gps));

        let asserted = journal.count_matching(|kind| {
            matches!(kind, TransitionKind::EnableAsserted(StackKind::Gps))
        });
        assert_eq!(asserted, 2);
        assert!(!journal.is_empty());
    }
}
