use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

use crate::domain::booking::BookingId;
use crate::domain::message::{MessageStatus, QueuedMessageId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid message transition from {from:?} to {to:?}")]
    InvalidStatusTransition { from: MessageStatus, to: MessageStatus },
}

/// Allocator outcomes. `Conflict` is a business result surfaced to the turn
/// processor, not a system fault; `Store` means the database of record could
/// not be reached and the whole turn fails.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("slot conflict for {specialist} on {date} at {start_time}")]
    Conflict { specialist: String, date: NaiveDate, start_time: NaiveTime },
    #[error("booking {0} not found")]
    NotFound(BookingId),
    #[error("store unavailable: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("queued message {0} not found")]
    ItemNotFound(QueuedMessageId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("store unavailable: {0}")]
    Store(String),
}

/// Failure talking to the spreadsheet mirror. Never fails the surrounding
/// booking operation; the periodic reconciliation pass is the retry path.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("mirror sync failed: {0}")]
pub struct MirrorSyncError(pub String);

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::{AllocationError, DomainError};
    use crate::domain::message::MessageStatus;

    #[test]
    fn conflict_message_names_the_slot() {
        let error = AllocationError::Conflict {
            specialist: "Anna".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 9, 1).expect("valid date"),
            start_time: NaiveTime::parse_from_str("10:00", "%H:%M").expect("valid time"),
        };
        assert_eq!(error.to_string(), "slot conflict for Anna on 2026-09-01 at 10:00:00");
    }

    #[test]
    fn invalid_transition_keeps_both_states() {
        let error = DomainError::InvalidStatusTransition {
            from: MessageStatus::Completed,
            to: MessageStatus::Processing,
        };
        assert!(error.to_string().contains("Completed"));
        assert!(error.to_string().contains("Processing"));
    }
}
