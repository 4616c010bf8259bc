pub mod appointment;
pub mod intent;
pub mod session;

pub use appointment::{Appointment, AppointmentStatus, Doctor, Slot};
pub use intent::{BookingAction, BookingRequest, InfoQuery, Intent};
pub use session::{BookingSession, IdentityProof, PipelineStage, VerificationStatus};
