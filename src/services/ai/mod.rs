pub mod groq;
pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, system_prompt: &str, messages: &[Message]) -> anyhow::Result<String>;
}

/// Strip markdown code fences and locate the JSON object in a model reply.
/// Models regularly wrap JSON in ```json fences or lead with prose.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let cleaned = response
        .trim()
        .strip_prefix("```json")
        .or_else(|| response.trim().strip_prefix("```"))
        .unwrap_or(response.trim());
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    if cleaned.starts_with('{') && cleaned.ends_with('}') {
        return Some(cleaned);
    }

    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if start < end {
        Some(&cleaned[start..=end])
    } else {
        None
    }
}
