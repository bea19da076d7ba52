use clap::Parser;

use crate::reconciler::ASSISTANT_NAME;

/// Model used when the assistant has to be created.
pub const DEFAULT_MODEL: &str = "gpt-4.1-2025-04-14";

/// Individual loading step with status
#[derive(Debug, Clone, PartialEq)]
pub struct LoadingStep {
    pub message: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    Pending,
    InProgress,
    Success,
    Failed(String),
}

impl StepStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            StepStatus::Pending => "    ",
            StepStatus::InProgress => "[WAIT]",
            StepStatus::Success => "[ OK ]",
            StepStatus::Failed(_) => "[FAIL]",
        }
    }

    pub fn color(&self) -> ratatui::style::Color {
        match self {
            StepStatus::Pending => ratatui::style::Color::DarkGray,
            StepStatus::InProgress => ratatui::style::Color::Yellow,
            StepStatus::Success => ratatui::style::Color::Green,
            StepStatus::Failed(_) => ratatui::style::Color::Red,
        }
    }
}

/// Stages of application startup, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    LoadingConfig,
    EnsuringVectorStore,
    EnsuringAssistant,
    CreatingThread,
}

impl LoadingState {
    pub const ALL: [LoadingState; 4] = [
        LoadingState::LoadingConfig,
        LoadingState::EnsuringVectorStore,
        LoadingState::EnsuringAssistant,
        LoadingState::CreatingThread,
    ];

    pub fn message(&self) -> &'static str {
        match self {
            LoadingState::LoadingConfig => "Loading persisted configuration",
            LoadingState::EnsuringVectorStore => "Verifying knowledge base vector store",
            LoadingState::EnsuringAssistant => "Verifying assistant",
            LoadingState::CreatingThread => "Opening conversation thread",
        }
    }
}

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Base URL of the assistant service
    #[clap(
        long,
        env = "APIMAP_SERVICE_URL",
        default_value = crate::client::DEFAULT_API_BASE
    )]
    pub service_url: String,

    /// API key for the assistant service
    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Model used if the assistant has to be created
    #[clap(long, env = "APIMAP_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Base URL of the graph-execution service. When set, responses are
    /// streamed from it instead of the assistant run loop.
    #[clap(long, env = "APIMAP_GRAPH_URL")]
    pub graph_url: Option<String>,

    /// API key for the graph-execution service
    #[clap(long, env = "APIMAP_GRAPH_API_KEY", hide_env_values = true)]
    pub graph_api_key: Option<String>,

    /// Graph assistant to run when --graph-url is set
    #[clap(long, env = "APIMAP_GRAPH_ASSISTANT", default_value = "agent")]
    pub graph_assistant: String,

    /// User id scoping graph threads
    #[clap(long, env = "APIMAP_USER", default_value = "local")]
    pub user: String,

    /// Conversation title
    #[clap(long, env = "APIMAP_TITLE", default_value = "API Mapping Assistant")]
    pub title: String,

    /// Debug mode to print all responses
    #[clap(long, default_value = "false")]
    pub debug: bool,
}

/// Greeting templates keyed by assistant name. The transcript shows the
/// matching greeting while it is empty.
const GREETINGS: &[(&str, &str)] = &[(ASSISTANT_NAME, WELCOME_GREETING)];

/// Assistants this deployment provisions. Every entry must have a greeting.
const KNOWN_ASSISTANTS: &[&str] = &[ASSISTANT_NAME];

pub const WELCOME_GREETING: &str = "Welcome to the API Mapping Assistant!

I help you map your business data to the compliance screening APIs:
  - analyze your data structure and recommend API mappings
  - explain API endpoints and their requirements
  - provide implementation guidance and best practices

To get started, attach your business data files with /attach <path>, then
ask away. Try: \"How do I map customer data to the screening API?\" or
\"What fields are required for entity screening?\"";

pub fn greeting_for(assistant_name: &str) -> Option<&'static str> {
    GREETINGS
        .iter()
        .find(|(name, _)| *name == assistant_name)
        .map(|(_, greeting)| *greeting)
}

/// Fail fast at startup if an assistant has no greeting template.
pub fn validate_greetings() -> anyhow::Result<()> {
    for name in KNOWN_ASSISTANTS {
        if greeting_for(name).is_none() {
            anyhow::bail!("No greeting template for assistant '{}'", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_assistant_has_a_greeting() {
        validate_greetings().unwrap();
    }

    #[test]
    fn test_unknown_assistant_has_no_greeting() {
        assert_eq!(greeting_for("Some Other Bot"), None);
    }
}
