use std::time::Duration;

use crate::errors::AgentError;
use crate::models::Intent;
use crate::services::ai::{extract_json_object, LlmProvider, Message};

const SYSTEM_PROMPT: &str = r#"You are the intent router for a clinic front-desk assistant. Classify the patient's latest message.

Return ONLY valid JSON (no markdown, no explanation) with this exact structure:
{
  "needs_info": false,
  "needs_booking": false,
  "is_greeting": false
}

Classification rules:
- "needs_info": true if the message asks about the clinic — hours, doctors, insurance, services, location, contact details
- "needs_booking": true if the message is an appointment action — check availability, book, cancel, reschedule — or supplies details for one (ID digits, phone number, dates, times, a chosen slot, a confirmation code)
- "is_greeting": true if the message is a greeting or pleasantry
- A single message can set more than one flag ("Do you take Medicare and can I book for Monday?" sets both needs_info and needs_booking)
"#;

/// Classify one message. The result is schema-guaranteed: if the model reply
/// cannot be parsed into all three flags this fails with
/// `AgentError::Classification`, never a guessed intent.
pub async fn classify(
    llm: &dyn LlmProvider,
    text: &str,
    booking_in_progress: bool,
    timeout: Duration,
) -> Result<Intent, AgentError> {
    let context = if booking_in_progress {
        "\nContext: this conversation has a booking flow in progress. Short answers carrying booking details (digits, phone numbers, dates, times, names) set needs_booking."
    } else {
        ""
    };
    let system = format!("{SYSTEM_PROMPT}{context}");
    let messages = [Message::user(text)];

    let response = tokio::time::timeout(timeout, llm.chat(&system, &messages))
        .await
        .map_err(|_| AgentError::Timeout {
            operation: "classify",
        })?
        .map_err(|e| AgentError::Classification(e.to_string()))?;

    parse_intent(&response)
}

fn parse_intent(response: &str) -> Result<Intent, AgentError> {
    let json = extract_json_object(response)
        .ok_or_else(|| AgentError::Classification("no JSON object in model reply".to_string()))?;

    serde_json::from_str::<Intent>(json)
        .map_err(|e| AgentError::Classification(format!("malformed intent JSON: {e}")))
}
