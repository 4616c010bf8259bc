use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::Connection;

use crate::db::queries;
use crate::models::{Appointment, AppointmentStatus, Doctor, Slot};

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

/// The booking system boundary. Reads (verify, availability) are idempotent;
/// `commit_booking` is not and callers must never re-invoke it automatically.
#[async_trait]
pub trait BookingBackend: Send + Sync {
    async fn verify_identity(
        &self,
        credential_fragment: &str,
        phone: &str,
    ) -> anyhow::Result<VerifyOutcome>;

    async fn check_availability(
        &self,
        specialty: Option<&str>,
        doctor: Option<&str>,
        from: &NaiveDateTime,
        to: &NaiveDateTime,
    ) -> anyhow::Result<Vec<Slot>>;

    async fn commit_booking(
        &self,
        doctor: &str,
        start: &NaiveDateTime,
        patient_name: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<String>;

    async fn cancel_booking(&self, reference: &str) -> anyhow::Result<()>;

    async fn reschedule_booking(
        &self,
        reference: &str,
        start: &NaiveDateTime,
    ) -> anyhow::Result<String>;

    async fn clinic_info(&self, topic: &str) -> anyhow::Result<String>;

    async fn search_doctors(
        &self,
        specialty: Option<&str>,
        language: Option<&str>,
    ) -> anyhow::Result<Vec<Doctor>>;
}

const HOURS_INFO: &str = "We're open Sunday to Thursday 8:00 AM - 8:00 PM, \
Friday 8:00 AM - 6:00 PM, and Saturday 8:00 AM - 4:00 PM.";

const INSURANCE_INFO: &str = "We accept ADNIC, Daman, AXA Gulf, Oman Insurance, \
MetLife Alico, Neuron, Nextcare, and Cigna.";

const SERVICES_INFO: &str = "Our services: cardiology, pediatrics, internal \
medicine, 24/7 emergency, laboratory, and imaging.";

const LOCATION_INFO: &str = "You'll find us at Al Maryah Island, Abu Dhabi. \
Free parking is available in the building garage and the clinic is wheelchair \
accessible.";

const CONTACT_INFO: &str = "Call us at +971 2 501 9999 or email \
info@clinic.example.com.";

/// Sqlite-backed stand-in for the clinic's booking system.
pub struct ClinicBackend {
    db: Arc<Mutex<Connection>>,
}

impl ClinicBackend {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn new_reference() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("APT-{}", id[..8].to_uppercase())
    }
}

#[async_trait]
impl BookingBackend for ClinicBackend {
    async fn verify_identity(
        &self,
        credential_fragment: &str,
        _phone: &str,
    ) -> anyhow::Result<VerifyOutcome> {
        // Format checks happen upstream; this models the registry lookup.
        if credential_fragment == "00000" {
            return Ok(VerifyOutcome {
                ok: false,
                reason: Some("ID not found in the patient registry".to_string()),
            });
        }
        Ok(VerifyOutcome {
            ok: true,
            reason: None,
        })
    }

    async fn check_availability(
        &self,
        specialty: Option<&str>,
        doctor: Option<&str>,
        from: &NaiveDateTime,
        to: &NaiveDateTime,
    ) -> anyhow::Result<Vec<Slot>> {
        let db = self.db.lock().unwrap();
        queries::open_slots(&db, specialty, doctor, from, to)
    }

    async fn commit_booking(
        &self,
        doctor: &str,
        start: &NaiveDateTime,
        patient_name: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<String> {
        let db = self.db.lock().unwrap();

        let doctor_row = queries::get_doctor(&db, doctor)?
            .ok_or_else(|| anyhow::anyhow!("unknown doctor: {doctor}"))?;

        let open = queries::open_slots(&db, None, Some(&doctor_row.name), start, start)?;
        if open.is_empty() {
            anyhow::bail!(
                "the {} slot with {} is no longer available",
                start.format("%Y-%m-%d %H:%M"),
                doctor_row.name
            );
        }

        let now = chrono::Utc::now().naive_utc();
        let appointment = Appointment {
            reference: Self::new_reference(),
            doctor: doctor_row.name,
            specialty: doctor_row.specialty,
            start: *start,
            patient_name: patient_name.to_string(),
            reason: reason.map(|r| r.to_string()),
            status: AppointmentStatus::Confirmed,
            created_at: now,
            updated_at: now,
        };
        queries::create_appointment(&db, &appointment)?;

        tracing::info!(reference = %appointment.reference, doctor = %appointment.doctor, "appointment booked");
        Ok(appointment.reference)
    }

    async fn cancel_booking(&self, reference: &str) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        let cancelled =
            queries::update_appointment_status(&db, reference, &AppointmentStatus::Cancelled)?;
        if !cancelled {
            anyhow::bail!("appointment {reference} not found");
        }
        tracing::info!(reference, "appointment cancelled");
        Ok(())
    }

    async fn reschedule_booking(
        &self,
        reference: &str,
        start: &NaiveDateTime,
    ) -> anyhow::Result<String> {
        let db = self.db.lock().unwrap();

        let appointment = queries::get_appointment(&db, reference)?
            .ok_or_else(|| anyhow::anyhow!("appointment {reference} not found"))?;
        if appointment.status == AppointmentStatus::Cancelled {
            anyhow::bail!("appointment {reference} was cancelled and cannot be rescheduled");
        }

        let open = queries::open_slots(&db, None, Some(&appointment.doctor), start, start)?;
        if open.is_empty() {
            anyhow::bail!(
                "no open {} slot with {}",
                start.format("%Y-%m-%d %H:%M"),
                appointment.doctor
            );
        }

        queries::update_appointment_start(&db, reference, start)?;
        tracing::info!(reference, "appointment rescheduled");
        Ok(reference.to_string())
    }

    async fn clinic_info(&self, topic: &str) -> anyhow::Result<String> {
        let info = match topic {
            "hours" => HOURS_INFO,
            "insurance" => INSURANCE_INFO,
            "services" => SERVICES_INFO,
            "location" => LOCATION_INFO,
            "contact" => CONTACT_INFO,
            _ => {
                return Ok(format!(
                    "{HOURS_INFO}\n{LOCATION_INFO}\n{SERVICES_INFO}\n{CONTACT_INFO}"
                ))
            }
        };
        Ok(info.to_string())
    }

    async fn search_doctors(
        &self,
        specialty: Option<&str>,
        language: Option<&str>,
    ) -> anyhow::Result<Vec<Doctor>> {
        let db = self.db.lock().unwrap();
        queries::search_doctors(&db, specialty, language)
    }
}
