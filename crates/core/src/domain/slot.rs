use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An appointment window offered by the scheduling provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Slot {
    pub fn starts_within(&self, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> bool {
        self.start >= range_start && self.start <= range_end
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub contact_id: String,
    pub slot: Slot,
    pub name: String,
    pub email: String,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConfirmation {
    pub appointment_id: String,
    pub slot: Slot,
}
