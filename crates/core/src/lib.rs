pub mod config;
pub mod domain;
pub mod errors;
pub mod schedule;

pub use chrono;

pub use domain::booking::{Booking, BookingDetails, BookingId, BookingStatus};
pub use domain::message::{
    ClaimOutcome, InboundEvent, MessageStatus, QueuedMessage, QueuedMessageId, SubmitOutcome,
};
pub use errors::{AllocationError, CoordinatorError, DomainError, MirrorSyncError};
pub use schedule::SlotGrid;
