use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// An open appointment slot offered by the booking backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    pub doctor: String,
    pub specialty: String,
    pub start: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub reference: String,
    pub doctor: String,
    pub specialty: String,
    pub start: NaiveDateTime,
    pub patient_name: String,
    pub reason: Option<String>,
    pub status: AppointmentStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cancelled" => AppointmentStatus::Cancelled,
            _ => AppointmentStatus::Confirmed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub name: String,
    pub specialty: String,
    pub languages: Vec<String>,
}
