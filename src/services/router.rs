use crate::errors::AgentError;
use crate::models::Intent;
use crate::services::{booking, classifier, info};
use crate::state::AppState;

pub const WELCOME: &str = "Hello! Welcome to the clinic. I can help with information \
(hours, doctors, insurance, services, location) and with appointments \
(check availability, book, cancel, reschedule). What can I do for you?";

pub const FALLBACK: &str = "I'm not sure what you need. I can answer questions about \
the clinic or help you with an appointment — could you rephrase?";

pub const TRY_AGAIN: &str = "Sorry, I didn't catch that. Could you try again?";

const DEGRADED_INFO: &str = "(I couldn't answer the information part of your \
request right now — please ask again shortly.)";

const DEGRADED_BOOKING: &str = "(The booking assistant hit a problem — your \
appointment was not changed. Please try the booking part again shortly.)";

/// Entry point for one conversation turn.
pub async fn handle(state: &AppState, conversation_id: &str, text: &str) -> String {
    if let Err(e) = state.sessions.sweep_expired() {
        tracing::warn!(error = %e, "failed to sweep expired sessions");
    }

    let booking_in_progress = matches!(
        state.sessions.load(conversation_id),
        Ok(Some(session)) if !session.stage.is_terminal()
    );

    let intent = match classifier::classify(
        state.llm.as_ref(),
        text,
        booking_in_progress,
        state.config.llm_timeout(),
    )
    .await
    {
        Ok(intent) => intent,
        Err(e) => {
            // Conversation state untouched; the user just retries.
            tracing::warn!(conversation = conversation_id, error = %e, "classification failed");
            return TRY_AGAIN.to_string();
        }
    };

    tracing::info!(
        conversation = conversation_id,
        needs_info = intent.needs_info,
        needs_booking = intent.needs_booking,
        is_greeting = intent.is_greeting,
        "routing message"
    );

    route(state, conversation_id, text, intent).await
}

/// Precedence policy: greeting-only → welcome without any handler; otherwise
/// the flagged handlers run (concurrently when both, since they share no
/// mutable state) and their outputs merge in fixed Info-then-Booking order. One
/// handler failing never discards the other's answer.
pub async fn route(
    state: &AppState,
    conversation_id: &str,
    text: &str,
    intent: Intent,
) -> String {
    if intent.greeting_only() {
        return WELCOME.to_string();
    }
    if intent.unroutable() {
        return FALLBACK.to_string();
    }

    let info_fut = async {
        if intent.needs_info {
            Some(info::respond(state, text).await)
        } else {
            None
        }
    };
    let booking_fut = async {
        if intent.needs_booking {
            Some(booking::respond(state, conversation_id, text).await)
        } else {
            None
        }
    };

    let (info_result, booking_result) = tokio::join!(info_fut, booking_fut);
    merge(conversation_id, info_result, booking_result)
}

fn merge(
    conversation_id: &str,
    info: Option<Result<String, AgentError>>,
    booking: Option<Result<String, AgentError>>,
) -> String {
    let both = info.is_some() && booking.is_some();

    let info_text = info.map(|result| match result {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(conversation = conversation_id, error = %e, "info handler failed");
            DEGRADED_INFO.to_string()
        }
    });
    let booking_text = booking.map(|result| match result {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(conversation = conversation_id, error = %e, "booking handler failed");
            DEGRADED_BOOKING.to_string()
        }
    });

    match (info_text, booking_text) {
        (Some(info), Some(booking)) if both => {
            format!("[info] {info}\n\n[booking] {booking}")
        }
        (Some(text), None) | (None, Some(text)) => text,
        // Unreachable: route() only calls merge with at least one handler.
        _ => FALLBACK.to_string(),
    }
}
