use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingId(pub String);

impl std::fmt::Display for BookingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Client-facing metadata attached to a booking. None of it participates in
/// conflict checks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    pub client_name: Option<String>,
    pub service: Option<String>,
    pub client_phone: Option<String>,
}

/// One reserved appointment: `duration_slots` contiguous slots starting at
/// `start_time` on `date` for one specialist. Cancellation is a status flip,
/// never a hard delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub project_id: String,
    pub specialist: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_slots: u32,
    pub client_id: String,
    pub details: BookingDetails,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Start times of every slot this booking occupies.
    pub fn covered_slots(&self, slot_minutes: u32) -> Vec<NaiveTime> {
        (0..self.duration_slots)
            .map(|i| self.start_time + chrono::Duration::minutes(i64::from(i * slot_minutes)))
            .collect()
    }

    pub fn end_time(&self, slot_minutes: u32) -> NaiveTime {
        self.start_time + chrono::Duration::minutes(i64::from(self.duration_slots * slot_minutes))
    }
}
