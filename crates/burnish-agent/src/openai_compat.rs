use anyhow::Result;
use async_trait::async_trait;
use burnish_core::agent::{AgentBackend, ExecuteRequest, ScoutReport, ScoutRequest};
use burnish_core::types::{FailureReason, TicketOutcome};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Calls an OpenAI-compatible chat completions API (Kimi, or a locally
/// hosted model).
///
/// Chat-only: no tool calling, so these backends can scout but cannot
/// execute tickets. Useful for cheap wide scans and privacy-sensitive
/// setups where scouting must not leave the machine.
pub struct OpenAiCompatBackend {
    pub backend_name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl OpenAiCompatBackend {
    pub fn kimi(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend_name: "kimi".into(),
            base_url: "https://api.moonshot.ai/v1".into(),
            model: model.into(),
            api_key: api_key.into(),
            timeout_secs: 300,
        }
    }

    pub fn local(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend_name: "openai-local".into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: String::new(),
            timeout_secs: 300,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    async fn chat(&self, system: &str, user: String) -> Result<Option<String>> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system".into(),
                content: system.into(),
            });
        }
        messages.push(ChatMessage {
            role: "user".into(),
            content: user,
        });

        let body = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: false,
        };

        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;

        let mut request = client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(
                    backend = %self.backend_name,
                    timeout_secs = self.timeout_secs,
                    "chat request timed out"
                );
                return Ok(None);
            }
            Err(e) => {
                warn!(backend = %self.backend_name, "chat request failed: {e}");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            warn!(
                backend = %self.backend_name,
                status = %response.status(),
                "chat API returned an error"
            );
            return Ok(None);
        }

        let parsed: ChatResponse = response.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content))
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

const SCOUT_SYSTEM: &str = "You are a code-improvement scout. You receive a description of a \
repository slice and must propose concrete, small improvements in the requested JSON shape. \
You cannot run tools; reason from the information given.";

#[async_trait]
impl AgentBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    fn supports_execution(&self) -> bool {
        false
    }

    async fn scout(&self, req: &ScoutRequest) -> Result<ScoutReport> {
        let instruction = crate::instruction::build_scout_instruction(req);
        info!(
            backend = %self.backend_name,
            scope = %req.scope,
            model = %self.model,
            "calling chat API for scout"
        );
        match self.chat(SCOUT_SYSTEM, instruction).await? {
            Some(content) => Ok(crate::event::parse_scout_output(&content)),
            None => Ok(ScoutReport::default()),
        }
    }

    async fn execute(&self, req: &ExecuteRequest) -> Result<TicketOutcome> {
        warn!(
            backend = %self.backend_name,
            ticket = req.ticket.id,
            "chat-only backend cannot execute tickets"
        );
        Ok(TicketOutcome::failed(
            FailureReason::AgentError,
            format!("backend {} has no tool execution support", self.backend_name),
        ))
    }
}
