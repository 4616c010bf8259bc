use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::db::queries;
use crate::errors::AgentError;
use crate::models::{Appointment, AppointmentStatus};
use crate::state::AppState;

/// Front-desk view of everything on the books.
pub async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Appointment>>, AgentError> {
    let db = state.db.lock().unwrap();
    let appointments = queries::list_appointments(&db)?;
    Ok(Json(appointments))
}

/// Staff-side cancel by confirmation code.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> Result<Response, AgentError> {
    let found = {
        let db = state.db.lock().unwrap();
        queries::update_appointment_status(&db, &reference, &AppointmentStatus::Cancelled)?
    };

    if found {
        Ok(Json(serde_json::json!({ "cancelled": reference })).into_response())
    } else {
        let body = serde_json::json!({ "error": "appointment not found" });
        Ok((StatusCode::NOT_FOUND, Json(body)).into_response())
    }
}
