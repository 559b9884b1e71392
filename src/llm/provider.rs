use crate::config::{Config, LlmProviderKind};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in a conversation. `tool_call_id`/`tool_name` are set only on
/// `Role::Tool` messages, echoing back which call they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message { role: Role::System, content: content.into(), tool_call_id: None, tool_name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message { role: Role::User, content: content.into(), tool_call_id: None, tool_name: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message { role: Role::Assistant, content: content.into(), tool_call_id: None, tool_name: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }
}

/// A declarative tool exposed to the provider, translated from
/// [`crate::tools::ToolSpec`] by the Agent Controller.
#[derive(Debug, Clone)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ToolCalls,
    EndTurn,
    MaxTokens,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub assistant_text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

/// Provider-agnostic chat contract. Each implementation translates
/// `messages`/`tools` into its own wire format and back; none of them know
/// about the Agent Controller's loop.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ChatReply>;
}

/// Thin wrapper that selects a concrete provider from `Config`, enforces the
/// request timeout, and retries transient failures with backoff before
/// escalating to `LLMUnavailable`, the only error shape the Agent
/// Controller needs to special-case.
pub struct LlmAdapter {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
}

const MAX_LLM_ATTEMPTS: u32 = 3;

impl LlmAdapter {
    pub fn new(config: &Config) -> Self {
        let provider: Arc<dyn LlmProvider> = match config.llm_provider {
            LlmProviderKind::ProviderX => {
                Arc::new(ProviderXClient::new(config.llm_api_key.clone(), config.llm_model.clone()))
            }
            LlmProviderKind::ProviderY => {
                Arc::new(ProviderYClient::new(config.llm_api_key.clone(), config.llm_model.clone()))
            }
            LlmProviderKind::ProviderZ => {
                Arc::new(ProviderZClient::new(config.llm_api_key.clone(), config.llm_model.clone()))
            }
        };
        LlmAdapter { provider, timeout: config.llm_timeout }
    }

    pub fn with_provider(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        LlmAdapter { provider, timeout }
    }

    pub async fn chat(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ChatReply> {
        let mut attempt = 0u32;
        let mut backoff_ms = 200u64;

        loop {
            match tokio::time::timeout(self.timeout, self.provider.chat(messages, tools)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) if e.is_transient() => {
                    if attempt + 1 >= MAX_LLM_ATTEMPTS {
                        log::error!("LLM unavailable after {MAX_LLM_ATTEMPTS} attempts: {e}");
                        return Err(CoreError::LLMUnavailable(format!(
                            "exhausted retries: {e}"
                        )));
                    }
                    attempt += 1;
                    log::warn!("transient LLM error (attempt {attempt}): {e}");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    if attempt + 1 >= MAX_LLM_ATTEMPTS {
                        return Err(CoreError::LLMUnavailable(format!(
                            "request exceeded {:?} timeout",
                            self.timeout
                        )));
                    }
                    attempt += 1;
                    log::warn!("LLM call timed out (attempt {attempt})");
                }
            }
        }
    }
}

/// OpenAI-style `chat/completions` tool-calling dialect.
pub struct ProviderXClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ProviderXClient {
    pub fn new(api_key: String, model: String) -> Self {
        ProviderXClient {
            client: Client::new(),
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    fn encode_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::Tool => json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": m.content,
                }),
                _ => json!({ "role": role_str(m.role), "content": m.content }),
            })
            .collect()
    }

    fn encode_tools(tools: &[ToolDeclaration]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect()
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> CoreError {
    if status.as_u16() == 429 || status.is_server_error() {
        CoreError::LLMTransientError(format!("{status}: {body}"))
    } else {
        CoreError::LLMUnavailable(format!("{status}: {body}"))
    }
}

#[async_trait]
impl LlmProvider for ProviderXClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ChatReply> {
        let body = json!({
            "model": self.model,
            "messages": Self::encode_messages(messages),
            "tools": Self::encode_tools(tools),
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::LLMTransientError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }

        let payload: Value = response.json().await.map_err(|e| CoreError::LLMTransientError(e.to_string()))?;
        let choice = &payload["choices"][0];
        let message = &choice["message"];

        let assistant_text = message["content"].as_str().map(|s| s.to_string());
        let tool_calls = message["tool_calls"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc["id"].as_str().unwrap_or_default().to_string(),
                name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments_json: serde_json::from_str(tc["function"]["arguments"].as_str().unwrap_or("{}"))
                    .unwrap_or(Value::Null),
            })
            .collect::<Vec<_>>();

        let stop_reason = if !tool_calls.is_empty() {
            StopReason::ToolCalls
        } else if choice["finish_reason"].as_str() == Some("length") {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        };

        Ok(ChatReply {
            assistant_text,
            tool_calls,
            usage: Usage {
                prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            },
            stop_reason,
        })
    }
}

/// Anthropic-style `messages` API with `tool_use`/`tool_result` content blocks.
pub struct ProviderYClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ProviderYClient {
    pub fn new(api_key: String, model: String) -> Self {
        ProviderYClient {
            client: Client::new(),
            api_key,
            model,
            base_url: "https://api.anthropic.com/v1".to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for ProviderYClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ChatReply> {
        let system: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");

        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::Tool => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id,
                        "content": m.content,
                    }]
                }),
                _ => json!({ "role": role_str(m.role), "content": m.content }),
            })
            .collect();

        let tool_defs: Vec<Value> = tools
            .iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters_schema }))
            .collect();

        let body = json!({
            "model": self.model,
            "system": system,
            "messages": turns,
            "tools": tool_defs,
            "max_tokens": 4096,
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::LLMTransientError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }

        let payload: Value = response.json().await.map_err(|e| CoreError::LLMTransientError(e.to_string()))?;
        let blocks = payload["content"].as_array().cloned().unwrap_or_default();

        let mut assistant_text = None;
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => assistant_text = block["text"].as_str().map(|s| s.to_string()),
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments_json: block["input"].clone(),
                }),
                _ => {}
            }
        }

        let stop_reason = match payload["stop_reason"].as_str() {
            Some("tool_use") => StopReason::ToolCalls,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        Ok(ChatReply {
            assistant_text,
            tool_calls,
            usage: Usage {
                prompt_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            },
            stop_reason,
        })
    }
}

/// Gemini-style `generateContent` + `functionCall` parts. Reuses the wire
/// shape of the teacher's own document-extraction client almost verbatim;
/// same request envelope, same resumable-friendly error mapping, adapted
/// here to tool-calling chat turns instead of document Q&A.
pub struct ProviderZClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ProviderZClient {
    pub fn new(api_key: String, model: String) -> Self {
        ProviderZClient {
            client: Client::new(),
            api_key,
            model,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for ProviderZClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ChatReply> {
        let system_instruction: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");

        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::Tool => json!({
                    "role": "function",
                    "parts": [{
                        "functionResponse": {
                            "name": m.tool_name,
                            "response": { "content": m.content },
                        }
                    }]
                }),
                Role::Assistant => json!({ "role": "model", "parts": [{ "text": m.content }] }),
                _ => json!({ "role": "user", "parts": [{ "text": m.content }] }),
            })
            .collect();

        let function_declarations: Vec<Value> = tools
            .iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters_schema }))
            .collect();

        let body = json!({
            "system_instruction": { "parts": [{ "text": system_instruction }] },
            "contents": contents,
            "tools": [{ "functionDeclarations": function_declarations }],
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::LLMTransientError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }

        let payload: Value = response.json().await.map_err(|e| CoreError::LLMTransientError(e.to_string()))?;
        let parts = payload["candidates"][0]["content"]["parts"].as_array().cloned().unwrap_or_default();

        let mut assistant_text = None;
        let mut tool_calls = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if let Some(text) = part["text"].as_str() {
                assistant_text = Some(text.to_string());
            }
            if let Some(call) = part.get("functionCall") {
                tool_calls.push(ToolCall {
                    id: format!("call-{i}"),
                    name: call["name"].as_str().unwrap_or_default().to_string(),
                    arguments_json: call["args"].clone(),
                });
            }
        }

        let stop_reason = if !tool_calls.is_empty() { StopReason::ToolCalls } else { StopReason::EndTurn };

        Ok(ChatReply {
            assistant_text,
            tool_calls,
            usage: Usage {
                prompt_tokens: payload["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                completion_tokens: payload["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
            },
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyThenOk {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for FlakyThenOk {
        async fn chat(&self, _messages: &[Message], _tools: &[ToolDeclaration]) -> Result<ChatReply> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(CoreError::LLMTransientError("rate limited".into()));
            }
            Ok(ChatReply {
                assistant_text: Some("ok".into()),
                tool_calls: vec![],
                usage: Usage::default(),
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    struct AlwaysTransient;

    #[async_trait]
    impl LlmProvider for AlwaysTransient {
        async fn chat(&self, _messages: &[Message], _tools: &[ToolDeclaration]) -> Result<ChatReply> {
            Err(CoreError::LLMTransientError("still down".into()))
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let adapter = LlmAdapter::with_provider(
            Arc::new(FlakyThenOk { failures_left: AtomicU32::new(1) }),
            Duration::from_secs(1),
        );
        let reply = adapter.chat(&[Message::user("hi")], &[]).await.unwrap();
        assert_eq!(reply.assistant_text.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn exhausts_retries_into_llm_unavailable() {
        let adapter = LlmAdapter::with_provider(Arc::new(AlwaysTransient), Duration::from_secs(1));
        let result = adapter.chat(&[Message::user("hi")], &[]).await;
        assert!(matches!(result, Err(CoreError::LLMUnavailable(_))));
    }
}
