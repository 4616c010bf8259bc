use crate::errors::AgentError;
use crate::models::{Doctor, InfoQuery};
use crate::services::ai::{extract_json_object, Message};
use crate::services::tools::{Operation, ToolOutput};
use crate::state::AppState;

const SYSTEM_PROMPT: &str = r#"You extract the topic of a clinic information question.

Return ONLY valid JSON (no markdown, no explanation) with this exact structure:
{
  "topic": "hours|insurance|services|location|contact|doctors|general",
  "specialty": "medical specialty mentioned, or null",
  "language": "preferred doctor language mentioned, or null"
}

Use "doctors" when the user asks about doctors, or mentions a specialty or a
language preference. Use "general" when unsure."#;

/// Stateless information handler: extracts the question's topic, then answers
/// from read-only clinic operations. Never touches booking state.
pub async fn respond(state: &AppState, text: &str) -> Result<String, AgentError> {
    let messages = [Message::user(text)];
    let response = tokio::time::timeout(
        state.config.llm_timeout(),
        state.llm.chat(SYSTEM_PROMPT, &messages),
    )
    .await
    .map_err(|_| AgentError::Timeout {
        operation: "info_extract",
    })?
    .map_err(|e| AgentError::Classification(e.to_string()))?;

    let query = parse_info_query(&response)?;

    answer(state, &query).await
}

async fn answer(state: &AppState, query: &InfoQuery) -> Result<String, AgentError> {
    let wants_doctors = query.topic == "doctors"
        || query.specialty.is_some()
        || query.language.is_some();

    if wants_doctors {
        let output = state
            .tools
            .invoke(
                Operation::SearchDoctors,
                serde_json::json!({
                    "specialty": query.specialty,
                    "language": query.language,
                }),
            )
            .await?;
        let ToolOutput::Doctors(doctors) = output else {
            return Err(AgentError::ContractViolation(
                "search_doctors returned a non-doctor result".to_string(),
            ));
        };
        return Ok(format_doctors(&doctors));
    }

    let topic = normalize_topic(&query.topic);
    let output = state
        .tools
        .invoke(Operation::ClinicInfo, serde_json::json!({ "topic": topic }))
        .await?;
    match output {
        ToolOutput::Info(info) => Ok(info),
        _ => Err(AgentError::ContractViolation(
            "clinic_info returned a non-info result".to_string(),
        )),
    }
}

fn parse_info_query(response: &str) -> Result<InfoQuery, AgentError> {
    let json = extract_json_object(response)
        .ok_or_else(|| AgentError::Classification("no JSON object in model reply".to_string()))?;
    serde_json::from_str::<InfoQuery>(json)
        .map_err(|e| AgentError::Classification(format!("malformed info query JSON: {e}")))
}

fn normalize_topic(topic: &str) -> &'static str {
    match topic {
        "hours" => "hours",
        "insurance" => "insurance",
        "services" => "services",
        "location" => "location",
        "contact" => "contact",
        _ => "general",
    }
}

fn format_doctors(doctors: &[Doctor]) -> String {
    if doctors.is_empty() {
        return "No doctors matched that search. We cover cardiology, pediatrics, \
                and internal medicine — would you like the full list?"
            .to_string();
    }

    let listing = doctors
        .iter()
        .map(|d| {
            format!(
                "- {} — {} ({})",
                d.name,
                d.specialty,
                d.languages.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("Here are our doctors:\n{listing}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_with_specialty() {
        let json = r#"{"topic":"doctors","specialty":"cardiology","language":null}"#;
        let query = parse_info_query(json).unwrap();
        assert_eq!(query.topic, "doctors");
        assert_eq!(query.specialty.as_deref(), Some("cardiology"));
    }

    #[test]
    fn test_parse_fenced_query() {
        let fenced = "```json\n{\"topic\":\"hours\",\"specialty\":null,\"language\":null}\n```";
        let query = parse_info_query(fenced).unwrap();
        assert_eq!(query.topic, "hours");
    }

    #[test]
    fn test_parse_prose_is_error() {
        assert!(matches!(
            parse_info_query("the user asks about hours"),
            Err(AgentError::Classification(_))
        ));
    }

    #[test]
    fn test_unknown_topic_normalizes_to_general() {
        assert_eq!(normalize_topic("pricing"), "general");
        assert_eq!(normalize_topic("hours"), "hours");
    }

    #[test]
    fn test_format_doctors_empty() {
        assert!(format_doctors(&[]).contains("No doctors matched"));
    }
}
