use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::config::AppConfig;
use crate::services::ai::LlmProvider;
use crate::services::sessions::SessionStore;
use crate::services::tools::ToolInvoker;

pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: AppConfig,
    pub llm: Box<dyn LlmProvider>,
    pub tools: ToolInvoker,
    pub sessions: SessionStore,
}
