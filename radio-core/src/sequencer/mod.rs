//! HCI-level bring-up and shutdown sequences owned by the transport.

pub mod off;
pub mod on;

pub use off::{OffSequenceEvent, OffSequenceState, TransportOffSequencer};
pub use on::{OnSequenceEvent, OnSequenceOutcome, OnSequenceState, TransportOnSequencer};
