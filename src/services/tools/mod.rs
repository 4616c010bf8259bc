pub mod backend;

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::errors::AgentError;
use crate::models::{Doctor, Slot};

pub use backend::{BookingBackend, ClinicBackend, VerifyOutcome};

/// Named operations the core may invoke. Each has a fixed argument schema;
/// a call with missing, unknown, or malformed fields is rejected before any
/// backend work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    VerifyIdentity,
    CheckAvailability,
    CommitBooking,
    CancelBooking,
    RescheduleBooking,
    ClinicInfo,
    SearchDoctors,
}

struct FieldSpec {
    name: &'static str,
    required: bool,
}

const fn field(name: &'static str, required: bool) -> FieldSpec {
    FieldSpec { name, required }
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::VerifyIdentity => "verify_identity",
            Operation::CheckAvailability => "check_availability",
            Operation::CommitBooking => "commit_booking",
            Operation::CancelBooking => "cancel_booking",
            Operation::RescheduleBooking => "reschedule_booking",
            Operation::ClinicInfo => "clinic_info",
            Operation::SearchDoctors => "search_doctors",
        }
    }

    fn schema(&self) -> &'static [FieldSpec] {
        const VERIFY_IDENTITY: &[FieldSpec] =
            &[field("credential_fragment", true), field("phone", true)];
        const CHECK_AVAILABILITY: &[FieldSpec] = &[
            field("specialty", false),
            field("doctor", false),
            field("date_from", true),
            field("date_to", false),
        ];
        const COMMIT_BOOKING: &[FieldSpec] = &[
            field("doctor", true),
            field("start", true),
            field("patient_name", true),
            field("reason", false),
        ];
        const CANCEL_BOOKING: &[FieldSpec] = &[field("reference", true)];
        const RESCHEDULE_BOOKING: &[FieldSpec] =
            &[field("reference", true), field("start", true)];
        const CLINIC_INFO: &[FieldSpec] = &[field("topic", true)];
        const SEARCH_DOCTORS: &[FieldSpec] =
            &[field("specialty", false), field("language", false)];

        match self {
            Operation::VerifyIdentity => VERIFY_IDENTITY,
            Operation::CheckAvailability => CHECK_AVAILABILITY,
            Operation::CommitBooking => COMMIT_BOOKING,
            Operation::CancelBooking => CANCEL_BOOKING,
            Operation::RescheduleBooking => RESCHEDULE_BOOKING,
            Operation::ClinicInfo => CLINIC_INFO,
            Operation::SearchDoctors => SEARCH_DOCTORS,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ToolOutput {
    Verification { ok: bool, reason: Option<String> },
    Slots(Vec<Slot>),
    Appointment { reference: String },
    Cancelled,
    Info(String),
    Doctors(Vec<Doctor>),
}

pub struct ToolInvoker {
    backend: Box<dyn BookingBackend>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(backend: Box<dyn BookingBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Execute a named operation. Argument validation is fail-fast: nothing
    /// reaches the backend unless the full schema checks out, so a rejected
    /// call has no partial side effects.
    pub async fn invoke(&self, op: Operation, args: Value) -> Result<ToolOutput, AgentError> {
        let map = validate_args(op, &args)?;

        tracing::debug!(operation = op.name(), "invoking tool");

        let call = self.dispatch(op, &map);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation = op.name(), "tool call timed out");
                Err(AgentError::Timeout {
                    operation: op.name(),
                })
            }
        }
    }

    async fn dispatch(
        &self,
        op: Operation,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutput, AgentError> {
        let fail = |e: anyhow::Error| AgentError::ToolFailure {
            operation: op.name(),
            reason: e.to_string(),
        };

        match op {
            Operation::VerifyIdentity => {
                let outcome = self
                    .backend
                    .verify_identity(req(args, "credential_fragment"), req(args, "phone"))
                    .await
                    .map_err(fail)?;
                Ok(ToolOutput::Verification {
                    ok: outcome.ok,
                    reason: outcome.reason,
                })
            }
            Operation::CheckAvailability => {
                let from_date = parse_date(op, "date_from", req(args, "date_from"))?;
                let to_date = match opt(args, "date_to") {
                    Some(raw) => parse_date(op, "date_to", raw)?,
                    None => from_date,
                };
                let from = from_date.and_hms_opt(0, 0, 0).unwrap_or_default();
                let to = to_date.and_hms_opt(23, 59, 59).unwrap_or_default();

                let slots = self
                    .backend
                    .check_availability(opt(args, "specialty"), opt(args, "doctor"), &from, &to)
                    .await
                    .map_err(fail)?;
                Ok(ToolOutput::Slots(slots))
            }
            Operation::CommitBooking => {
                let start = parse_datetime(op, "start", req(args, "start"))?;
                let reference = self
                    .backend
                    .commit_booking(
                        req(args, "doctor"),
                        &start,
                        req(args, "patient_name"),
                        opt(args, "reason"),
                    )
                    .await
                    .map_err(fail)?;
                Ok(ToolOutput::Appointment { reference })
            }
            Operation::CancelBooking => {
                self.backend
                    .cancel_booking(req(args, "reference"))
                    .await
                    .map_err(fail)?;
                Ok(ToolOutput::Cancelled)
            }
            Operation::RescheduleBooking => {
                let start = parse_datetime(op, "start", req(args, "start"))?;
                let reference = self
                    .backend
                    .reschedule_booking(req(args, "reference"), &start)
                    .await
                    .map_err(fail)?;
                Ok(ToolOutput::Appointment { reference })
            }
            Operation::ClinicInfo => {
                let info = self
                    .backend
                    .clinic_info(req(args, "topic"))
                    .await
                    .map_err(fail)?;
                Ok(ToolOutput::Info(info))
            }
            Operation::SearchDoctors => {
                let doctors = self
                    .backend
                    .search_doctors(opt(args, "specialty"), opt(args, "language"))
                    .await
                    .map_err(fail)?;
                Ok(ToolOutput::Doctors(doctors))
            }
        }
    }
}

fn validate_args(
    op: Operation,
    args: &Value,
) -> Result<serde_json::Map<String, Value>, AgentError> {
    let invalid = |detail: String| AgentError::InvalidArgument {
        operation: op.name(),
        detail,
    };

    let map = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be an object".to_string()))?;

    let schema = op.schema();

    for key in map.keys() {
        if !schema.iter().any(|f| f.name == key) {
            return Err(invalid(format!("unknown field `{key}`")));
        }
    }

    for spec in schema {
        match map.get(spec.name) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::Null) | None if !spec.required => {}
            Some(_) => {
                return Err(invalid(format!("field `{}` must be a string", spec.name)));
            }
            None => {
                return Err(invalid(format!("missing required field `{}`", spec.name)));
            }
        }
    }

    Ok(map.clone())
}

/// Required string field; guaranteed present by `validate_args`.
fn req<'m>(args: &'m serde_json::Map<String, Value>, name: &str) -> &'m str {
    args.get(name).and_then(|v| v.as_str()).unwrap_or_default()
}

fn opt<'m>(args: &'m serde_json::Map<String, Value>, name: &str) -> Option<&'m str> {
    args.get(name).and_then(|v| v.as_str())
}

fn parse_date(op: Operation, name: &str, raw: &str) -> Result<NaiveDate, AgentError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| AgentError::InvalidArgument {
        operation: op.name(),
        detail: format!("field `{name}` must be a YYYY-MM-DD date, got `{raw}`"),
    })
}

fn parse_datetime(op: Operation, name: &str, raw: &str) -> Result<NaiveDateTime, AgentError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| AgentError::InvalidArgument {
            operation: op.name(),
            detail: format!("field `{name}` must be a YYYY-MM-DD HH:MM timestamp, got `{raw}`"),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Backend that counts calls so tests can assert fail-fast validation.
    struct CountingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BookingBackend for CountingBackend {
        async fn verify_identity(
            &self,
            _credential_fragment: &str,
            _phone: &str,
        ) -> anyhow::Result<VerifyOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn commit_booking(
            &self,
            _doctor: &str,
            _start: &NaiveDateTime,
            _patient_name: &str,
            _reason: Option<&str>,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("APT-TEST0000".to_string())
        }

        async fn cancel_booking(&self, _reference: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reschedule_booking(
            &self,
            reference: &str,
            _start: &NaiveDateTime,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(reference.to_string())
        }

        async fn clinic_info(&self, _topic: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("info".to_string())
        }

        async fn search_doctors(
            &self,
            _specialty: Option<&str>,
            _language: Option<&str>,
        ) -> anyhow::Result<Vec<Doctor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    fn invoker() -> (ToolInvoker, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = CountingBackend {
            calls: Arc::clone(&calls),
        };
        (
            ToolInvoker::new(Box::new(backend), Duration::from_secs(5)),
            calls,
        )
    }

    #[tokio::test]
    async fn test_missing_required_field_rejected_before_backend() {
        let (invoker, calls) = invoker();
        let err = invoker
            .invoke(Operation::VerifyIdentity, json!({"phone": "+15551234567"}))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::InvalidArgument { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_field_rejected() {
        let (invoker, calls) = invoker();
        let err = invoker
            .invoke(
                Operation::CancelBooking,
                json!({"reference": "APT-1", "force": "yes"}),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::InvalidArgument { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_date_rejected() {
        let (invoker, calls) = invoker();
        let err = invoker
            .invoke(
                Operation::CheckAvailability,
                json!({"date_from": "next tuesday"}),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::InvalidArgument { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_call_reaches_backend() {
        let (invoker, calls) = invoker();
        let output = invoker
            .invoke(
                Operation::VerifyIdentity,
                json!({"credential_fragment": "12345", "phone": "+15551234567"}),
            )
            .await
            .unwrap();

        assert!(matches!(output, ToolOutput::Verification { ok: true, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_operation_has_a_schema() {
        let ops = [
            Operation::VerifyIdentity,
            Operation::CheckAvailability,
            Operation::CommitBooking,
            Operation::CancelBooking,
            Operation::RescheduleBooking,
            Operation::ClinicInfo,
            Operation::SearchDoctors,
        ];
        for op in ops {
            assert!(!op.schema().is_empty(), "{} has no schema", op.name());
        }
        assert!(Operation::VerifyIdentity.schema().iter().all(|f| f.required));
        assert!(Operation::SearchDoctors.schema().iter().all(|f| !f.required));
    }

    #[tokio::test]
    async fn test_optional_fields_may_be_absent() {
        let (invoker, _) = invoker();
        let output = invoker
            .invoke(
                Operation::CheckAvailability,
                json!({"date_from": "2025-03-10"}),
            )
            .await
            .unwrap();
        assert!(matches!(output, ToolOutput::Slots(_)));
    }
}
