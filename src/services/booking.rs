use chrono::{NaiveDate, NaiveTime};

use crate::errors::AgentError;
use crate::models::{
    BookingAction, BookingRequest, BookingSession, PipelineStage, VerificationStatus,
};
use crate::services::ai::{extract_json_object, Message};
use crate::services::pipeline::{AvailabilityQuery, Pipeline, PhoneRule};
use crate::state::AppState;

const SYSTEM_PROMPT: &str = r#"You extract booking fields from a patient message to a clinic assistant.

Return ONLY valid JSON (no markdown, no explanation) with this exact structure:
{
  "action": "book|cancel|reschedule|unknown",
  "credential_fragment": "last 5 ID digits mentioned, or null",
  "phone": "phone number mentioned, or null",
  "doctor": "doctor name mentioned, or null",
  "specialty": "medical specialty mentioned, or null",
  "date": "requested date as YYYY-MM-DD, or null",
  "date_to": "end of a date range as YYYY-MM-DD, or null",
  "time": "requested time as HH:MM, or null",
  "patient_name": "patient full name, or null",
  "reason": "visit reason, or null",
  "appointment_ref": "confirmation code like APT-XXXXXXXX, or null"
}

Rules:
- "cancel"/"reschedule" only when the user wants to change an EXISTING appointment
- "book" for new appointments and for messages continuing a booking in progress
- "unknown" when none of the above fits
- Extract only what is actually present; never invent values"#;

const VERIFY_INTRO: &str = "To manage an appointment I first need to verify your identity. \
Please share the last 5 digits of your Emirates ID and your phone number.";

/// Stateful booking handler. Holds the per-conversation lock for the whole
/// turn so pipeline transitions are serialized per conversation, including
/// an in-flight commit, whose result is always saved before the lock drops.
pub async fn respond(
    state: &AppState,
    conversation_id: &str,
    text: &str,
) -> Result<String, AgentError> {
    let _guard = state.sessions.acquire(conversation_id).await;
    let mut session = state.sessions.load_or_new(conversation_id)?;

    let request = extract_request(state, &session, text).await?;
    tracing::debug!(
        conversation = conversation_id,
        stage = session.stage.as_str(),
        action = ?request.action,
        "booking turn"
    );

    let phone_rule = PhoneRule::from_config(&state.config);
    let pipeline = Pipeline::new(&state.tools, &phone_rule);

    let reply = drive(&pipeline, &mut session, &request).await?;

    session.last_activity = chrono::Utc::now().naive_utc();
    session.expires_at = session.last_activity + chrono::Duration::minutes(30);
    state.sessions.save(&session)?;

    Ok(reply)
}

async fn extract_request(
    state: &AppState,
    session: &BookingSession,
    text: &str,
) -> Result<BookingRequest, AgentError> {
    let stage_hint = format!(
        "\nContext: the booking flow for this conversation is at the `{}` step.",
        session.stage.as_str()
    );
    let system = format!("{SYSTEM_PROMPT}{stage_hint}");
    let messages = [Message::user(text)];

    let response = tokio::time::timeout(
        state.config.llm_timeout(),
        state.llm.chat(&system, &messages),
    )
    .await
    .map_err(|_| AgentError::Timeout {
        operation: "booking_extract",
    })?
    .map_err(|e| AgentError::Classification(e.to_string()))?;

    parse_request(&response)
}

fn parse_request(response: &str) -> Result<BookingRequest, AgentError> {
    let json = extract_json_object(response)
        .ok_or_else(|| AgentError::Classification("no JSON object in model reply".to_string()))?;
    serde_json::from_str::<BookingRequest>(json)
        .map_err(|e| AgentError::Classification(format!("malformed booking JSON: {e}")))
}

async fn drive(
    pipeline: &Pipeline<'_>,
    session: &mut BookingSession,
    request: &BookingRequest,
) -> Result<String, AgentError> {
    // Changes to an existing appointment come first: they bypass the
    // pipeline only for an already-verified session.
    match request.action {
        BookingAction::Cancel => return change_existing(pipeline, session, request, false).await,
        BookingAction::Reschedule => {
            return change_existing(pipeline, session, request, true).await
        }
        BookingAction::Book | BookingAction::Unknown => {}
    }

    if session.stage.is_terminal() {
        if request.action == BookingAction::Book {
            session.reset();
            return Ok(VERIFY_INTRO.to_string());
        }
        return Ok(match &session.appointment_ref {
            Some(reference) => format!(
                "Your appointment is confirmed (code {reference}). \
                 Say \"book\" to start a new one, or give me the code to cancel or reschedule."
            ),
            None => "That booking attempt is finished. Say \"book\" to start a new one.".to_string(),
        });
    }

    match session.stage {
        PipelineStage::Verification => verification_turn(pipeline, session, request).await,
        PipelineStage::Availability => availability_turn(pipeline, session, request).await,
        PipelineStage::Commit => commit_turn(pipeline, session, request).await,
        PipelineStage::Done | PipelineStage::Failed => unreachable!("terminal stages handled above"),
    }
}

async fn verification_turn(
    pipeline: &Pipeline<'_>,
    session: &mut BookingSession,
    request: &BookingRequest,
) -> Result<String, AgentError> {
    let (Some(credential), Some(phone)) = (&request.credential_fragment, &request.phone) else {
        return Ok(VERIFY_INTRO.to_string());
    };

    let outcome = pipeline.submit_identity(session, credential, phone).await?;
    Ok(outcome.message().to_string())
}

async fn availability_turn(
    pipeline: &Pipeline<'_>,
    session: &mut BookingSession,
    request: &BookingRequest,
) -> Result<String, AgentError> {
    if request.doctor.is_none() && request.specialty.is_none() {
        return Ok(
            "Which doctor or specialty would you like to see, and on what date (YYYY-MM-DD)?"
                .to_string(),
        );
    }
    let Some(date) = &request.date else {
        return Ok("What date should I check? Please use YYYY-MM-DD.".to_string());
    };

    let Some(from) = parse_date(date) else {
        return Ok(format!(
            "I couldn't read `{date}` as a date. Please use YYYY-MM-DD."
        ));
    };
    let to = match &request.date_to {
        Some(raw) => match parse_date(raw) {
            Some(d) => Some(d),
            None => {
                return Ok(format!(
                    "I couldn't read `{raw}` as a date. Please use YYYY-MM-DD."
                ))
            }
        },
        None => None,
    };

    let query = AvailabilityQuery {
        specialty: request.specialty.clone(),
        doctor: request.doctor.clone(),
        from,
        to,
    };

    let outcome = pipeline.check_availability(session, &query).await?;
    Ok(outcome.message().to_string())
}

async fn commit_turn(
    pipeline: &Pipeline<'_>,
    session: &mut BookingSession,
    request: &BookingRequest,
) -> Result<String, AgentError> {
    if let Some(raw) = &request.time {
        let Some(time) = parse_time(raw) else {
            return Ok(format!("I couldn't read `{raw}` as a time. Please use HH:MM."));
        };
        let date = request.date.as_deref().and_then(parse_date);
        let chosen = pipeline.select_slot(session, date, time, request.doctor.as_deref())?;
        if chosen.is_none() {
            return Ok(
                "That time isn't among the open slots I listed. Please pick one of them."
                    .to_string(),
            );
        }
    }

    if session.selected_slot.is_none() {
        return Ok("Which of the listed times works for you?".to_string());
    }

    let Some(patient_name) = &request.patient_name else {
        return Ok("Almost done — what's the patient's full name?".to_string());
    };

    let outcome = pipeline
        .commit(session, patient_name, request.reason.as_deref())
        .await?;
    Ok(outcome.message().to_string())
}

/// Cancel or reschedule an existing appointment. Verified sessions go
/// straight to the backend; anything else re-enters Verification.
async fn change_existing(
    pipeline: &Pipeline<'_>,
    session: &mut BookingSession,
    request: &BookingRequest,
    reschedule: bool,
) -> Result<String, AgentError> {
    let Some(reference) = &request.appointment_ref else {
        return Ok(
            "Please give me the confirmation code (it looks like APT-XXXXXXXX).".to_string(),
        );
    };

    if session.verification != VerificationStatus::Verified {
        session.reset();
        return Ok(format!("{VERIFY_INTRO} Then repeat your request."));
    }

    if !reschedule {
        let outcome = pipeline.cancel_existing(session, reference).await?;
        return Ok(outcome.message().to_string());
    }

    let (Some(date), Some(time)) = (&request.date, &request.time) else {
        return Ok(
            "What new date and time would you like? Please use YYYY-MM-DD and HH:MM.".to_string(),
        );
    };
    let (Some(date), Some(time)) = (parse_date(date), parse_time(time)) else {
        return Ok(
            "I couldn't read that date/time. Please use YYYY-MM-DD and HH:MM.".to_string(),
        );
    };

    let outcome = pipeline
        .reschedule_existing(session, reference, date.and_time(time))
        .await?;
    Ok(outcome.message().to_string())
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}
