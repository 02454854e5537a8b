//! Per-call view of a chip's shared collaborators and its notice mailbox.

use heapless::Deque;

use crate::controller::{BringUpConfig, ChipId};
use crate::dispatch::{Status, invariant_violated};
use crate::hci::{ChipVersion, HciEvent, HciLink};
use crate::script::InitScriptRunner;
use crate::sequencer::on::OnSequenceOutcome;
use crate::stack::{StackEvent, StackKind, StackNotification};
use crate::telemetry::{Journal, TransitionKind};
use crate::transport::TransportReport;

/// Capacity of each mailbox queue.
pub const NOTICE_CAPACITY: usize = 16;

/// Completion handed from a child tier to its parent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Notice {
    OnSequence(OnSequenceOutcome),
    OffSequence(Status),
    Transport(TransportReport),
    Stack { stack: StackKind, event: StackEvent },
}

/// Callback owed to code outside the chip.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    Client(StackNotification),
    ChipIdentified(ChipVersion),
}

/// Verdict on one queued delivery, see [`Mailbox::select_delivery`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Pick {
    Take,
    /// The recipient is busy; leave the entry for a later pass.
    Keep,
    /// The recipient is gone.
    Drop,
}

/// FIFO queues that replace direct child-to-parent calls.
pub struct Mailbox {
    notices: Deque<Notice, NOTICE_CAPACITY>,
    deliveries: Deque<Delivery, NOTICE_CAPACITY>,
}

impl Mailbox {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            notices: Deque::new(),
            deliveries: Deque::new(),
        }
    }

    pub(crate) fn post(&mut self, notice: Notice) {
        if self.notices.push_back(notice).is_err() {
            invariant_violated("notice mailbox overflow");
        }
    }

    pub(crate) fn next_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    pub(crate) fn deliver(&mut self, delivery: Delivery) {
        if self.deliveries.push_back(delivery).is_err() {
            invariant_violated("delivery queue overflow");
        }
    }

    /// Removes the oldest delivery `pick` accepts.
    ///
    /// Entries marked [`Pick::Drop`] are discarded. Entries marked
    /// [`Pick::Keep`], and accepted entries behind the chosen one, stay queued
    /// in their original order.
    pub(crate) fn select_delivery(
        &mut self,
        mut pick: impl FnMut(&Delivery) -> Pick,
    ) -> Option<Delivery> {
        let mut chosen = None;
        for _ in 0..self.deliveries.len() {
            let Some(delivery) = self.deliveries.pop_front() else {
                break;
            };
            match pick(&delivery) {
                Pick::Take if chosen.is_none() => chosen = Some(delivery),
                Pick::Drop => {}
                Pick::Take | Pick::Keep => self.deliver(delivery),
            }
        }
        chosen
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed context threaded through the transport and sequencer tiers.
pub struct Bus<'c> {
    pub(crate) chip: ChipId,
    pub(crate) config: BringUpConfig,
    pub(crate) hci: &'c mut dyn HciLink,
    pub(crate) script: &'c mut dyn InitScriptRunner,
    pub(crate) mailbox: &'c mut Mailbox,
    pub(crate) journal: &'c mut Journal,
    /// HCI event being delivered by the current call, if any.
    pub(crate) inbound: Option<&'c HciEvent>,
}

impl Bus<'_> {
    pub(crate) fn record(&mut self, kind: TransitionKind) {
        self.journal.record(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{StackEventType, StackStatus};

    fn client(stack: StackKind, event: StackEventType) -> Delivery {
        Delivery::Client(StackNotification {
            stack,
            event,
            status: StackStatus::Success,
        })
    }

    fn recipient(delivery: &Delivery) -> Option<StackKind> {
        match delivery {
            Delivery::Client(notification) => Some(notification.stack),
            Delivery::ChipIdentified(_) => None,
        }
    }

    #[test]
    fn busy_recipient_does_not_block_the_queue() {
        let mut mailbox = Mailbox::new();
        mailbox.deliver(client(StackKind::Bluetooth, StackEventType::OffComplete));
        mailbox.deliver(client(StackKind::Fm, StackEventType::OnComplete));
        mailbox.deliver(client(StackKind::Bluetooth, StackEventType::OnComplete));
        mailbox.deliver(client(StackKind::Fm, StackEventType::OffComplete));

        let skip_bt = |delivery: &Delivery| match recipient(delivery) {
            Some(StackKind::Bluetooth) => Pick::Keep,
            _ => Pick::Take,
        };
        assert_eq!(
            mailbox.select_delivery(skip_bt),
            Some(client(StackKind::Fm, StackEventType::OnComplete))
        );
        assert_eq!(
            mailbox.select_delivery(skip_bt),
            Some(client(StackKind::Fm, StackEventType::OffComplete))
        );
        assert_eq!(mailbox.select_delivery(skip_bt), None);

        // Bluetooth entries kept their relative order.
        assert_eq!(
            mailbox.select_delivery(|_| Pick::Take),
            Some(client(StackKind::Bluetooth, StackEventType::OffComplete))
        );
        assert_eq!(
            mailbox.select_delivery(|_| Pick::Take),
            Some(client(StackKind::Bluetooth, StackEventType::OnComplete))
        );
    }

    #[test]
    fn dropped_entries_leave_the_queue() {
        let mut mailbox = Mailbox::new();
        mailbox.deliver(client(StackKind::Gps, StackEventType::OnComplete));
        mailbox.deliver(Delivery::ChipIdentified(ChipVersion::from_lmp_subversion(0)));

        let drop_gps = |delivery: &Delivery| match recipient(delivery) {
            Some(StackKind::Gps) => Pick::Drop,
            _ => Pick::Take,
        };
        assert!(matches!(
            mailbox.select_delivery(drop_gps),
            Some(Delivery::ChipIdentified(_))
        ));
        assert_eq!(mailbox.select_delivery(|_| Pick::Take), None);
    }
}
