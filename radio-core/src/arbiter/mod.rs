//! Multiplexes the stacks of one chip onto the shared transport.
//!
//! The transport runs one sequence at a time. Requests that arrive while a
//! sequence is running wait in a FIFO and are replayed when it finishes. The
//! arbiter counts powered stacks so the link is brought up by the first `On`
//! and shut down by the last `Off` only.

use heapless::Deque;

use crate::controller::bus::{Bus, Notice};
use crate::dispatch::{Completion, Status, invariant_violated};
use crate::stack::{STACK_KINDS, StackEvent, StackKind};
use crate::telemetry::TransitionKind;
use crate::transport::{TransportLifecycleManager, TransportOperation, TransportReport, TransportState};

/// Request issued by the stack tier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArbiterRequest {
    On,
    Off,
    OnAbort,
}

/// Request kinds that can wait in the queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueuedRequest {
    On,
    Off,
}

/// Entry waiting for the transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingRequest {
    pub stack: StackKind,
    pub request: QueuedRequest,
    /// The requesting stack already returned `Pending` and expects a notice.
    pub async_completion: bool,
}

/// Immediate answer to a stack request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArbiterReply {
    Pending,
    Complete(Status),
}

/// Serializes transport access for the stacks of one chip.
#[derive(Debug)]
pub struct TransportArbiter {
    active: Option<StackKind>,
    powered_stacks: u8,
    pending: Deque<PendingRequest, STACK_KINDS>,
}

impl TransportArbiter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: None,
            powered_stacks: 0,
            pending: Deque::new(),
        }
    }

    #[must_use]
    pub const fn powered_stacks(&self) -> u8 {
        self.powered_stacks
    }

    /// Waiting requests, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending.iter()
    }

    /// Returns `true` when nothing is running or waiting.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    pub(crate) fn request(
        &mut self,
        stack: StackKind,
        request: ArbiterRequest,
        transport: &mut TransportLifecycleManager,
        bus: &mut Bus<'_>,
    ) -> ArbiterReply {
        if transport.is_in_progress() {
            if self.active == Some(stack) {
                let operation = match request {
                    ArbiterRequest::On => TransportOperation::On,
                    ArbiterRequest::Off => TransportOperation::Off,
                    ArbiterRequest::OnAbort => TransportOperation::Abort,
                };
                return self.forward(operation, transport, bus);
            }
            return match request {
                ArbiterRequest::On => self.park(stack, QueuedRequest::On, bus),
                ArbiterRequest::Off => self.park(stack, QueuedRequest::Off, bus),
                ArbiterRequest::OnAbort => {
                    if !self.withdraw(stack) {
                        invariant_violated("abort for a stack with no queued bring-up");
                    }
                    log_debug!("chip {}: withdrew queued on for {:?}", bus.chip.0, stack);
                    ArbiterReply::Complete(Status::Success)
                }
            };
        }

        let request = match request {
            ArbiterRequest::On => QueuedRequest::On,
            ArbiterRequest::Off => QueuedRequest::Off,
            ArbiterRequest::OnAbort => invariant_violated("abort while the transport is idle"),
        };
        self.enqueue(PendingRequest {
            stack,
            request,
            async_completion: false,
        });
        self.service_pending(transport, bus)
    }

    /// Applies an asynchronous transport report and replays waiting requests.
    pub(crate) fn transport_finished(
        &mut self,
        report: TransportReport,
        transport: &mut TransportLifecycleManager,
        bus: &mut Bus<'_>,
    ) {
        let Some(stack) = self.active.take() else {
            invariant_violated("transport report with no active stack");
        };
        self.settle(report);
        bus.mailbox.post(Notice::Stack {
            stack,
            event: stack_event(report),
        });
        let _ = self.service_pending(transport, bus);
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    fn park(&mut self, stack: StackKind, request: QueuedRequest, bus: &mut Bus<'_>) -> ArbiterReply {
        self.enqueue(PendingRequest {
            stack,
            request,
            async_completion: true,
        });
        bus.record(TransitionKind::Queued { stack, request });
        log_debug!("chip {}: queued {:?} for {:?}", bus.chip.0, request, stack);
        ArbiterReply::Pending
    }

    fn enqueue(&mut self, entry: PendingRequest) {
        if self.pending.iter().any(|queued| queued.stack == entry.stack) {
            invariant_violated("stack already has a queued request");
        }
        if self.pending.push_back(entry).is_err() {
            invariant_violated("arbiter queue overflow");
        }
    }

    /// Removes the queued `On` of `stack`, keeping the order of the rest.
    fn withdraw(&mut self, stack: StackKind) -> bool {
        let mut found = false;
        for _ in 0..self.pending.len() {
            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            if !found && entry.stack == stack && entry.request == QueuedRequest::On {
                found = true;
                continue;
            }
            if self.pending.push_back(entry).is_err() {
                invariant_violated("arbiter queue overflow");
            }
        }
        found
    }

    fn service_pending(
        &mut self,
        transport: &mut TransportLifecycleManager,
        bus: &mut Bus<'_>,
    ) -> ArbiterReply {
        let mut reply = ArbiterReply::Complete(Status::Success);
        while let Some(entry) = self.pending.pop_front() {
            reply = match entry.request {
                QueuedRequest::On => self.grant_on(entry, transport, bus),
                QueuedRequest::Off => self.grant_off(entry, transport, bus),
            };
            if reply == ArbiterReply::Pending {
                self.active = Some(entry.stack);
                for waiting in self.pending.iter_mut() {
                    waiting.async_completion = true;
                }
                break;
            }
        }
        reply
    }

    fn grant_on(
        &mut self,
        entry: PendingRequest,
        transport: &mut TransportLifecycleManager,
        bus: &mut Bus<'_>,
    ) -> ArbiterReply {
        let reply = if transport.state() == TransportState::OnFailed {
            ArbiterReply::Complete(Status::Failure)
        } else if self.powered_stacks == 0 {
            Self::forward_to(TransportOperation::On, transport, bus)
        } else {
            ArbiterReply::Complete(Status::Success)
        };

        if let ArbiterReply::Complete(status) = reply {
            if status.is_success() {
                self.powered_stacks = self.powered_stacks.saturating_add(1);
            }
            if entry.async_completion {
                let report = TransportReport::new(TransportOperation::On, status);
                Self::notify(entry.stack, stack_event(report), bus);
            }
        }
        reply
    }

    fn grant_off(
        &mut self,
        entry: PendingRequest,
        transport: &mut TransportLifecycleManager,
        bus: &mut Bus<'_>,
    ) -> ArbiterReply {
        let reply = if self.powered_stacks == 1 {
            Self::forward_to(TransportOperation::Off, transport, bus)
        } else {
            ArbiterReply::Complete(Status::Success)
        };

        if let ArbiterReply::Complete(status) = reply {
            self.powered_stacks = self.powered_stacks.saturating_sub(1);
            if entry.async_completion {
                let report = TransportReport::new(TransportOperation::Off, status);
                Self::notify(entry.stack, stack_event(report), bus);
            }
        }
        reply
    }

    /// Forwards a request from the active stack while a sequence is running.
    fn forward(
        &mut self,
        operation: TransportOperation,
        transport: &mut TransportLifecycleManager,
        bus: &mut Bus<'_>,
    ) -> ArbiterReply {
        let reply = Self::forward_to(operation, transport, bus);
        if let ArbiterReply::Complete(status) = reply {
            self.active = None;
            self.settle(TransportReport::new(operation, status));
            let _ = self.service_pending(transport, bus);
        }
        reply
    }

    fn forward_to(
        operation: TransportOperation,
        transport: &mut TransportLifecycleManager,
        bus: &mut Bus<'_>,
    ) -> ArbiterReply {
        match transport.request(operation, bus) {
            Ok(Completion::Pending) => ArbiterReply::Pending,
            Ok(Completion::Success) => match transport.last_report() {
                Some(report) => ArbiterReply::Complete(report.status),
                None => invariant_violated("transport finished without a report"),
            },
            Err(_) => invariant_violated("transport rejected a request the arbiter granted"),
        }
    }

    fn settle(&mut self, report: TransportReport) {
        match (report.operation, report.status) {
            (TransportOperation::On, Status::Success) => {
                self.powered_stacks = self.powered_stacks.saturating_add(1);
            }
            (TransportOperation::Off, _) => {
                self.powered_stacks = self.powered_stacks.saturating_sub(1);
            }
            _ => {}
        }
    }

    fn notify(stack: StackKind, event: StackEvent, bus: &mut Bus<'_>) {
        bus.mailbox.post(Notice::Stack { stack, event });
    }
}

impl Default for TransportArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Stack-tier event announcing a finished transport operation.
#[must_use]
pub const fn stack_event(report: TransportReport) -> StackEvent {
    match (report.operation, report.status) {
        (TransportOperation::On, Status::Success) => StackEvent::TransportOnComplete,
        (TransportOperation::On, Status::Failure) => StackEvent::TransportOnFailed,
        (TransportOperation::Off, Status::Success) => StackEvent::TransportOffComplete,
        (TransportOperation::Off, Status::Failure) => StackEvent::TransportOffFailed,
        (TransportOperation::Abort, Status::Success) => StackEvent::TransportOnAbortComplete,
        (TransportOperation::Abort, Status::Failure) => StackEvent::TransportOnAbortFailed,
    }
}
