use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::json;

use crate::config::AppConfig;
use crate::errors::AgentError;
use crate::models::{BookingSession, IdentityProof, PipelineStage, Slot, VerificationStatus};
use crate::services::tools::{Operation, ToolInvoker, ToolOutput};

/// Local phone format rule, checked before any verification tool call.
#[derive(Debug, Clone)]
pub struct PhoneRule {
    prefix: String,
    min_digits: usize,
    max_digits: usize,
}

impl PhoneRule {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            prefix: config.phone_prefix.clone(),
            min_digits: config.phone_min_digits,
            max_digits: config.phone_max_digits,
        }
    }

    pub fn matches(&self, phone: &str) -> bool {
        let Some(rest) = phone.strip_prefix(&self.prefix) else {
            return false;
        };
        let digits = rest.chars().filter(|c| c.is_ascii_digit()).count();
        digits == rest.len() && digits >= self.min_digits && digits <= self.max_digits
    }

    pub fn describe(&self) -> String {
        format!(
            "{}<{}-{} digits>",
            self.prefix, self.min_digits, self.max_digits
        )
    }
}

#[derive(Debug, Clone)]
pub struct AvailabilityQuery {
    pub specialty: Option<String>,
    pub doctor: Option<String>,
    pub from: NaiveDate,
    pub to: Option<NaiveDate>,
}

/// Outcome of one pipeline step, always carrying the user-facing text.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Stage advanced.
    Advanced(String),
    /// Stage unchanged; the user should correct or complete their input.
    Prompt(String),
    /// Availability returned no slots: a valid outcome, stage unchanged.
    NoAvailability(String),
    /// Booking committed; pipeline is Done.
    Completed { reference: String, message: String },
    /// Stage moved to Failed.
    Failed(String),
}

impl StepOutcome {
    pub fn message(&self) -> &str {
        match self {
            StepOutcome::Advanced(m)
            | StepOutcome::Prompt(m)
            | StepOutcome::NoAvailability(m)
            | StepOutcome::Failed(m) => m,
            StepOutcome::Completed { message, .. } => message,
        }
    }
}

/// The Verify → CheckAvailability → Commit state machine.
///
/// Each step asserts its stage-entry invariant and returns
/// `ContractViolation`, leaving the session untouched, when driven out of
/// order. The ordering guarantee is enforced here, not by handler goodwill.
pub struct Pipeline<'a> {
    tools: &'a ToolInvoker,
    phone_rule: &'a PhoneRule,
}

impl<'a> Pipeline<'a> {
    pub fn new(tools: &'a ToolInvoker, phone_rule: &'a PhoneRule) -> Self {
        Self { tools, phone_rule }
    }

    /// Verification stage. Local format validation is fail-fast: a malformed
    /// credential or phone never reaches the backend. Failed attempts stay in
    /// `Verification`; retries model the user re-entering data and are
    /// unlimited.
    pub async fn submit_identity(
        &self,
        session: &mut BookingSession,
        credential_fragment: &str,
        phone: &str,
    ) -> Result<StepOutcome, AgentError> {
        if session.stage != PipelineStage::Verification {
            return Err(AgentError::ContractViolation(format!(
                "submit_identity called in stage {}",
                session.stage.as_str()
            )));
        }

        let credential = credential_fragment.trim();
        if credential.len() != 5 || !credential.chars().all(|c| c.is_ascii_digit()) {
            return Ok(StepOutcome::Prompt(
                "The ID fragment should be exactly the last 5 digits of your Emirates ID. \
                 Could you re-enter it?"
                    .to_string(),
            ));
        }

        let phone = phone.trim();
        if !self.phone_rule.matches(phone) {
            return Ok(StepOutcome::Prompt(format!(
                "That phone number doesn't look right. Please use the format {}.",
                self.phone_rule.describe()
            )));
        }

        let result = self
            .tools
            .invoke(
                Operation::VerifyIdentity,
                json!({ "credential_fragment": credential, "phone": phone }),
            )
            .await;

        match result {
            Ok(ToolOutput::Verification { ok: true, .. }) => {
                session.verification = VerificationStatus::Verified;
                session.identity = Some(IdentityProof {
                    credential_fragment: credential.to_string(),
                    phone: phone.to_string(),
                });
                session.stage = PipelineStage::Availability;
                tracing::info!(conversation = %session.conversation_id, "identity verified");
                Ok(StepOutcome::Advanced(
                    "You're verified. Which doctor or specialty would you like to see, \
                     and on what date (YYYY-MM-DD)?"
                        .to_string(),
                ))
            }
            Ok(ToolOutput::Verification { ok: false, reason }) => {
                session.verification = VerificationStatus::Failed;
                let reason = reason.unwrap_or_else(|| "verification was declined".to_string());
                Ok(StepOutcome::Prompt(format!(
                    "I couldn't verify you: {reason}. Please double-check the digits and try again."
                )))
            }
            Ok(_) => Err(AgentError::ContractViolation(
                "verify_identity returned a non-verification result".to_string(),
            )),
            Err(e) if e.is_tool_failure() => {
                // Stay in Verification: the user can simply resend their
                // details once the service is reachable.
                tracing::warn!(error = %e, "verification tool unavailable");
                Ok(StepOutcome::Prompt(
                    "I couldn't reach the verification service just now. \
                     Please send your details once more in a moment."
                        .to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Availability stage. Zero open slots is a valid outcome that keeps the
    /// stage; only a tool failure moves the pipeline to `Failed`.
    pub async fn check_availability(
        &self,
        session: &mut BookingSession,
        query: &AvailabilityQuery,
    ) -> Result<StepOutcome, AgentError> {
        if session.stage != PipelineStage::Availability {
            return Err(AgentError::ContractViolation(format!(
                "check_availability called in stage {}",
                session.stage.as_str()
            )));
        }

        let mut args = serde_json::Map::new();
        args.insert("date_from".to_string(), json!(query.from.format("%Y-%m-%d").to_string()));
        if let Some(to) = &query.to {
            args.insert("date_to".to_string(), json!(to.format("%Y-%m-%d").to_string()));
        }
        if let Some(specialty) = &query.specialty {
            args.insert("specialty".to_string(), json!(specialty));
        }
        if let Some(doctor) = &query.doctor {
            args.insert("doctor".to_string(), json!(doctor));
        }

        let result = self
            .tools
            .invoke(Operation::CheckAvailability, serde_json::Value::Object(args))
            .await;

        match result {
            Ok(ToolOutput::Slots(slots)) if !slots.is_empty() => {
                let listing = format_slots(&slots);
                session.candidate_slots = slots;
                session.stage = PipelineStage::Commit;
                Ok(StepOutcome::Advanced(format!(
                    "Here's what's open:\n{listing}\nWhich time works for you?"
                )))
            }
            Ok(ToolOutput::Slots(_)) => Ok(StepOutcome::NoAvailability(
                "There are no open slots matching that request. \
                 Would you like to try another date or doctor?"
                    .to_string(),
            )),
            Ok(_) => Err(AgentError::ContractViolation(
                "check_availability returned a non-slot result".to_string(),
            )),
            Err(e) if e.is_tool_failure() => {
                if matches!(e, AgentError::Timeout { .. }) {
                    tracing::warn!(conversation = %session.conversation_id, "availability check timed out");
                } else {
                    tracing::warn!(conversation = %session.conversation_id, error = %e, "availability check failed");
                }
                session.stage = PipelineStage::Failed;
                Ok(StepOutcome::Failed(
                    "The scheduling system is unavailable right now, so I had to stop \
                     this booking. Please try again shortly."
                        .to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Pick one of the candidate slots recorded by the availability step.
    /// Returns `None` when nothing matches; the handler re-prompts.
    pub fn select_slot(
        &self,
        session: &mut BookingSession,
        date: Option<NaiveDate>,
        time: NaiveTime,
        doctor: Option<&str>,
    ) -> Result<Option<Slot>, AgentError> {
        if session.stage != PipelineStage::Commit {
            return Err(AgentError::ContractViolation(format!(
                "select_slot called in stage {}",
                session.stage.as_str()
            )));
        }

        let chosen = session
            .candidate_slots
            .iter()
            .find(|slot| {
                slot.start.time() == time
                    && date.map_or(true, |d| slot.start.date() == d)
                    && doctor.map_or(true, |d| slot.doctor.eq_ignore_ascii_case(d))
            })
            .cloned();

        if let Some(slot) = &chosen {
            session.selected_slot = Some(slot.clone());
        }
        Ok(chosen)
    }

    /// Commit stage. Entry invariant: identity verified and a slot selected.
    /// A violation is a programming error, not user input; the session is
    /// left at its last valid stage. Commit is never retried automatically;
    /// a failure surfaces the backend's reason verbatim.
    pub async fn commit(
        &self,
        session: &mut BookingSession,
        patient_name: &str,
        reason: Option<&str>,
    ) -> Result<StepOutcome, AgentError> {
        if session.stage != PipelineStage::Commit {
            return Err(AgentError::ContractViolation(format!(
                "commit called in stage {}",
                session.stage.as_str()
            )));
        }
        if session.verification != VerificationStatus::Verified || session.identity.is_none() {
            return Err(AgentError::ContractViolation(
                "commit attempted without verified identity".to_string(),
            ));
        }
        let Some(slot) = session.selected_slot.clone() else {
            return Err(AgentError::ContractViolation(
                "commit attempted without a selected slot".to_string(),
            ));
        };

        let result = self
            .tools
            .invoke(
                Operation::CommitBooking,
                json!({
                    "doctor": slot.doctor,
                    "start": slot.start.format("%Y-%m-%d %H:%M").to_string(),
                    "patient_name": patient_name,
                    "reason": reason,
                }),
            )
            .await;

        match result {
            Ok(ToolOutput::Appointment { reference }) => {
                session.stage = PipelineStage::Done;
                session.appointment_ref = Some(reference.clone());
                tracing::info!(
                    conversation = %session.conversation_id,
                    reference = %reference,
                    "booking committed"
                );
                let message = format!(
                    "Your appointment is confirmed: {} on {} at {}.\nConfirmation code: {reference}",
                    slot.doctor,
                    slot.start.format("%Y-%m-%d"),
                    slot.start.format("%H:%M"),
                );
                Ok(StepOutcome::Completed { reference, message })
            }
            Ok(_) => Err(AgentError::ContractViolation(
                "commit_booking returned a non-appointment result".to_string(),
            )),
            Err(AgentError::ToolFailure { reason, .. }) => {
                session.stage = PipelineStage::Failed;
                Ok(StepOutcome::Failed(format!(
                    "The booking could not be completed: {reason}"
                )))
            }
            Err(AgentError::Timeout { .. }) => {
                tracing::warn!(conversation = %session.conversation_id, "commit timed out");
                session.stage = PipelineStage::Failed;
                Ok(StepOutcome::Failed(
                    "The booking system did not respond in time. The appointment was NOT \
                     retried to avoid a duplicate booking — please check with the clinic \
                     before trying again."
                        .to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel an existing appointment. Only reachable for a verified session;
    /// the booking handler re-enters Verification otherwise.
    pub async fn cancel_existing(
        &self,
        session: &mut BookingSession,
        reference: &str,
    ) -> Result<StepOutcome, AgentError> {
        if session.verification != VerificationStatus::Verified {
            return Err(AgentError::ContractViolation(
                "cancel attempted without verified identity".to_string(),
            ));
        }

        let result = self
            .tools
            .invoke(Operation::CancelBooking, json!({ "reference": reference }))
            .await;

        match result {
            Ok(ToolOutput::Cancelled) => {
                if session.appointment_ref.as_deref() == Some(reference) {
                    session.appointment_ref = None;
                }
                Ok(StepOutcome::Advanced(format!(
                    "Appointment {reference} has been cancelled."
                )))
            }
            Ok(_) => Err(AgentError::ContractViolation(
                "cancel_booking returned an unexpected result".to_string(),
            )),
            Err(e) if e.is_tool_failure() => {
                let reason = tool_reason(&e);
                Ok(StepOutcome::Prompt(format!(
                    "I couldn't cancel that appointment: {reason}. \
                     Please check the confirmation code."
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Reschedule an existing appointment to a new start time. Keeps the same
    /// confirmation code.
    pub async fn reschedule_existing(
        &self,
        session: &mut BookingSession,
        reference: &str,
        start: NaiveDateTime,
    ) -> Result<StepOutcome, AgentError> {
        if session.verification != VerificationStatus::Verified {
            return Err(AgentError::ContractViolation(
                "reschedule attempted without verified identity".to_string(),
            ));
        }

        let result = self
            .tools
            .invoke(
                Operation::RescheduleBooking,
                json!({
                    "reference": reference,
                    "start": start.format("%Y-%m-%d %H:%M").to_string(),
                }),
            )
            .await;

        match result {
            Ok(ToolOutput::Appointment { reference }) => {
                session.appointment_ref = Some(reference.clone());
                Ok(StepOutcome::Advanced(format!(
                    "Appointment {reference} has been moved to {} at {}.",
                    start.format("%Y-%m-%d"),
                    start.format("%H:%M"),
                )))
            }
            Ok(_) => Err(AgentError::ContractViolation(
                "reschedule_booking returned an unexpected result".to_string(),
            )),
            Err(e) if e.is_tool_failure() => {
                let reason = tool_reason(&e);
                Ok(StepOutcome::Prompt(format!(
                    "I couldn't reschedule that appointment: {reason}."
                )))
            }
            Err(e) => Err(e),
        }
    }
}

fn tool_reason(e: &AgentError) -> String {
    match e {
        AgentError::ToolFailure { reason, .. } => reason.clone(),
        AgentError::Timeout { .. } => "the booking system did not respond in time".to_string(),
        other => other.to_string(),
    }
}

fn format_slots(slots: &[Slot]) -> String {
    slots
        .iter()
        .map(|slot| {
            format!(
                "- {} ({}) on {} at {}",
                slot.doctor,
                slot.specialty,
                slot.start.format("%Y-%m-%d"),
                slot.start.format("%H:%M"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::models::Doctor;
    use crate::services::tools::{BookingBackend, VerifyOutcome};

    #[derive(Default)]
    struct ScriptedBackend {
        verify_calls: Arc<AtomicUsize>,
        availability_calls: Arc<AtomicUsize>,
        commit_calls: Arc<AtomicUsize>,
        slots: Mutex<Vec<Slot>>,
        fail_availability: bool,
        fail_commit: Option<String>,
        slow_availability: bool,
        slow_commit: bool,
    }

    #[async_trait]
    impl BookingBackend for ScriptedBackend {
        async fn verify_identity(
            &self,
            credential_fragment: &str,
            _phone: &str,
        ) -> anyhow::Result<VerifyOutcome> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            if credential_fragment == "00000" {
                return Ok(VerifyOutcome {
                    ok: false,
                    reason: Some("ID not found".to_string()),
                });
            }
            Ok(VerifyOutcome {
                ok: true,
                reason: None,
            })
        }

        async fn check_availability(
            &self,
            _specialty: Option<&str>,
            _doctor: Option<&str>,
            _from: &NaiveDateTime,
            _to: &NaiveDateTime,
        ) -> anyhow::Result<Vec<Slot>> {
            self.availability_calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_availability {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if self.fail_availability {
                anyhow::bail!("scheduling service unreachable");
            }
            Ok(self.slots.lock().unwrap().clone())
        }

        async fn commit_booking(
            &self,
            _doctor: &str,
            _start: &NaiveDateTime,
            _patient_name: &str,
            _reason: Option<&str>,
        ) -> anyhow::Result<String> {
            self.commit_calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_commit {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if let Some(reason) = &self.fail_commit {
                anyhow::bail!("{reason}");
            }
            Ok("APT-AB12CD34".to_string())
        }

        async fn cancel_booking(&self, _reference: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn reschedule_booking(
            &self,
            reference: &str,
            _start: &NaiveDateTime,
        ) -> anyhow::Result<String> {
            Ok(reference.to_string())
        }

        async fn clinic_info(&self, _topic: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }

        async fn search_doctors(
            &self,
            _specialty: Option<&str>,
            _language: Option<&str>,
        ) -> anyhow::Result<Vec<Doctor>> {
            Ok(vec![])
        }
    }

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn cardiology_slot() -> Slot {
        Slot {
            doctor: "Dr. Amal Haddad".to_string(),
            specialty: "cardiology".to_string(),
            start: dt("2025-03-10 09:00"),
        }
    }

    fn phone_rule() -> PhoneRule {
        PhoneRule {
            prefix: "+".to_string(),
            min_digits: 11,
            max_digits: 15,
        }
    }

    fn setup(backend: ScriptedBackend) -> (ToolInvoker, PhoneRule) {
        (
            ToolInvoker::new(Box::new(backend), Duration::from_secs(5)),
            phone_rule(),
        )
    }

    fn query() -> AvailabilityQuery {
        AvailabilityQuery {
            specialty: Some("cardiology".to_string()),
            doctor: None,
            from: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            to: None,
        }
    }

    #[test]
    fn test_phone_rule() {
        let rule = phone_rule();
        assert!(rule.matches("+15551234567"));
        assert!(rule.matches("+971501234567"));
        assert!(!rule.matches("15551234567"));
        assert!(!rule.matches("+1555"));
        assert!(!rule.matches("+1555123456a"));
    }

    #[tokio::test]
    async fn test_short_credential_never_reaches_backend() {
        let backend = ScriptedBackend::default();
        let verify_calls = Arc::clone(&backend.verify_calls);
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        let outcome = pipeline
            .submit_identity(&mut session, "1234", "+15551234567")
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Prompt(_)));
        assert_eq!(session.stage, PipelineStage::Verification);
        assert_eq!(verify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_verification_retries_are_unbounded() {
        let backend = ScriptedBackend {
            slots: Mutex::new(vec![cardiology_slot()]),
            ..Default::default()
        };
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        for bad in ["1234", "123456", "12a45", "", "abcde"] {
            let outcome = pipeline
                .submit_identity(&mut session, bad, "+15551234567")
                .await
                .unwrap();
            assert!(matches!(outcome, StepOutcome::Prompt(_)));
            assert_eq!(session.stage, PipelineStage::Verification);
        }

        let outcome = pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Advanced(_)));
        assert_eq!(session.stage, PipelineStage::Availability);
        assert_eq!(session.verification, VerificationStatus::Verified);
    }

    #[tokio::test]
    async fn test_rejected_credential_stays_in_verification() {
        let backend = ScriptedBackend::default();
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        let outcome = pipeline
            .submit_identity(&mut session, "00000", "+15551234567")
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Prompt(_)));
        assert!(outcome.message().contains("ID not found"));
        assert_eq!(session.stage, PipelineStage::Verification);
        assert_eq!(session.verification, VerificationStatus::Failed);
    }

    #[tokio::test]
    async fn test_zero_slots_stays_in_availability() {
        let backend = ScriptedBackend::default();
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        let outcome = pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::NoAvailability(_)));
        assert_eq!(session.stage, PipelineStage::Availability);
    }

    #[tokio::test]
    async fn test_availability_tool_failure_fails_pipeline() {
        let backend = ScriptedBackend {
            fail_availability: true,
            ..Default::default()
        };
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        let outcome = pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert_eq!(session.stage, PipelineStage::Failed);
    }

    #[tokio::test]
    async fn test_commit_without_verification_is_contract_violation() {
        let backend = ScriptedBackend::default();
        let commit_calls = Arc::clone(&backend.commit_calls);
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);

        // Forge a session driven out of order: Commit stage, never verified.
        let mut session = BookingSession::new("c1");
        session.stage = PipelineStage::Commit;
        session.selected_slot = Some(cardiology_slot());

        let err = pipeline
            .commit(&mut session, "Hamza Al-Mansouri", None)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::ContractViolation(_)));
        // Session left at its last valid stage, no commit call made.
        assert_eq!(session.stage, PipelineStage::Commit);
        assert_eq!(commit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_commit_without_slot_is_contract_violation() {
        let backend = ScriptedBackend::default();
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);

        let mut session = BookingSession::new("c1");
        session.stage = PipelineStage::Commit;
        session.verification = VerificationStatus::Verified;
        session.identity = Some(IdentityProof {
            credential_fragment: "12345".to_string(),
            phone: "+15551234567".to_string(),
        });

        let err = pipeline.commit(&mut session, "X", None).await.unwrap_err();
        assert!(matches!(err, AgentError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn test_out_of_order_step_is_contract_violation() {
        let backend = ScriptedBackend::default();
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        // Availability before verification.
        let err = pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ContractViolation(_)));
        assert_eq!(session.stage, PipelineStage::Verification);
    }

    #[tokio::test]
    async fn test_full_booking_flow() {
        let backend = ScriptedBackend {
            slots: Mutex::new(vec![cardiology_slot()]),
            ..Default::default()
        };
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        let outcome = pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Advanced(_)));

        let outcome = pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Advanced(_)));
        assert!(outcome.message().contains("09:00"));
        assert_eq!(session.stage, PipelineStage::Commit);

        let chosen = pipeline
            .select_slot(
                &mut session,
                None,
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                None,
            )
            .unwrap();
        assert!(chosen.is_some());

        let outcome = pipeline
            .commit(&mut session, "Hamza Al-Mansouri", Some("checkup"))
            .await
            .unwrap();

        match outcome {
            StepOutcome::Completed { reference, message } => {
                assert!(!reference.is_empty());
                assert!(message.contains(&reference));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(session.stage, PipelineStage::Done);
        assert_eq!(session.appointment_ref.as_deref(), Some("APT-AB12CD34"));
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces_reason_verbatim() {
        let backend = ScriptedBackend {
            slots: Mutex::new(vec![cardiology_slot()]),
            fail_commit: Some("slot taken while you were deciding".to_string()),
            ..Default::default()
        };
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap();
        pipeline
            .select_slot(
                &mut session,
                None,
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                None,
            )
            .unwrap();

        let outcome = pipeline.commit(&mut session, "X", None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert!(outcome.message().contains("slot taken while you were deciding"));
        assert_eq!(session.stage, PipelineStage::Failed);
    }

    #[tokio::test]
    async fn test_availability_timeout_fails_pipeline() {
        let backend = ScriptedBackend {
            slots: Mutex::new(vec![cardiology_slot()]),
            slow_availability: true,
            ..Default::default()
        };
        let tools = ToolInvoker::new(Box::new(backend), Duration::from_millis(20));
        let rule = phone_rule();
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        let outcome = pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert_eq!(session.stage, PipelineStage::Failed);
    }

    #[tokio::test]
    async fn test_commit_timeout_fails_without_retry() {
        let backend = ScriptedBackend {
            slots: Mutex::new(vec![cardiology_slot()]),
            slow_commit: true,
            ..Default::default()
        };
        let commit_calls = Arc::clone(&backend.commit_calls);
        let tools = ToolInvoker::new(Box::new(backend), Duration::from_millis(20));
        let rule = phone_rule();
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap();
        pipeline
            .select_slot(
                &mut session,
                None,
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                None,
            )
            .unwrap();

        let outcome = pipeline
            .commit(&mut session, "Hamza Al-Mansouri", None)
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert!(outcome.message().contains("NOT"));
        assert_eq!(session.stage, PipelineStage::Failed);
        // Exactly one attempt: a timed-out commit is never re-sent.
        assert_eq!(commit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_select_slot_no_match() {
        let backend = ScriptedBackend {
            slots: Mutex::new(vec![cardiology_slot()]),
            ..Default::default()
        };
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        pipeline
            .submit_identity(&mut session, "12345", "+15551234567")
            .await
            .unwrap();
        pipeline
            .check_availability(&mut session, &query())
            .await
            .unwrap();

        let chosen = pipeline
            .select_slot(
                &mut session,
                None,
                NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
                None,
            )
            .unwrap();
        assert!(chosen.is_none());
        assert!(session.selected_slot.is_none());
    }

    #[tokio::test]
    async fn test_cancel_requires_verified_session() {
        let backend = ScriptedBackend::default();
        let (tools, rule) = setup(backend);
        let pipeline = Pipeline::new(&tools, &rule);
        let mut session = BookingSession::new("c1");

        let err = pipeline
            .cancel_existing(&mut session, "APT-AB12CD34")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ContractViolation(_)));
    }
}
