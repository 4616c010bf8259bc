use serde::{Deserialize, Serialize};

/// Classification of a single inbound message. Produced once per message by
/// the classifier; the flags may contradict each other (model output), so the
/// router resolves precedence rather than trusting any single combination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Intent {
    pub needs_info: bool,
    pub needs_booking: bool,
    pub is_greeting: bool,
}

impl Intent {
    /// A pure greeting gets the static welcome without invoking any handler.
    pub fn greeting_only(&self) -> bool {
        self.is_greeting && !self.needs_info && !self.needs_booking
    }

    pub fn unroutable(&self) -> bool {
        !self.is_greeting && !self.needs_info && !self.needs_booking
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingAction {
    Book,
    Cancel,
    Reschedule,
    #[default]
    Unknown,
}

/// Fields the booking handler extracts from one user turn. Everything is
/// optional; the pipeline stage decides which fields are actually needed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingRequest {
    pub action: BookingAction,
    pub credential_fragment: Option<String>,
    pub phone: Option<String>,
    pub doctor: Option<String>,
    pub specialty: Option<String>,
    pub date: Option<String>,
    pub date_to: Option<String>,
    pub time: Option<String>,
    pub patient_name: Option<String>,
    pub reason: Option<String>,
    pub appointment_ref: Option<String>,
}

/// What the info handler extracts from an information question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoQuery {
    pub topic: String,
    pub specialty: Option<String>,
    pub language: Option<String>,
}
