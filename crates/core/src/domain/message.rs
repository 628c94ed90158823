use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuedMessageId(pub String);

impl std::fmt::Display for QueuedMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a queued inbound message. `Superseded` is terminal: a newer
/// message for the same client has taken over the turn, so this row can never
/// win arbitration again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Superseded,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Superseded)
    }

    /// The closed transition table enforced by the coordinator. Terminal
    /// states have no outward edges.
    pub fn can_transition(&self, to: MessageStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Superseded)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Cancelled)
                | (Self::Processing, Self::Superseded)
        )
    }
}

/// One logical inbound turn as persisted in `queued_messages`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: QueuedMessageId,
    pub project_id: String,
    pub client_id: String,
    pub original_text: String,
    pub aggregated_text: String,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw inbound delivery from a channel adapter. `retry` with
/// `delivery_count == 0` marks a duplicate delivery of a turn that already
/// completed on the channel side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub project_id: String,
    pub client_id: String,
    pub text: String,
    pub retry: bool,
    pub delivery_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Duplicate delivery of an already-handled turn; no row was created.
    Skipped,
    Queued(QueuedMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Win,
    Lose,
}

#[cfg(test)]
mod tests {
    use super::MessageStatus;

    #[test]
    fn message_status_round_trips_from_storage_encoding() {
        let cases = [
            MessageStatus::Pending,
            MessageStatus::Processing,
            MessageStatus::Completed,
            MessageStatus::Cancelled,
            MessageStatus::Superseded,
        ];

        for status in cases {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use MessageStatus::*;

        assert!(Pending.can_transition(Processing));
        assert!(Pending.can_transition(Cancelled));
        assert!(Pending.can_transition(Superseded));
        assert!(!Pending.can_transition(Completed));

        assert!(Processing.can_transition(Completed));
        assert!(Processing.can_transition(Cancelled));
        assert!(Processing.can_transition(Superseded));
        assert!(!Processing.can_transition(Pending));

        for terminal in [Completed, Cancelled, Superseded] {
            assert!(terminal.is_terminal());
            for target in [Pending, Processing, Completed, Cancelled, Superseded] {
                assert!(!terminal.can_transition(target));
            }
        }
    }
}
