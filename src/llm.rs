//! Language-model completion service.
//!
//! Every pipeline stage talks to the model through the [`CompletionClient`]
//! trait, so the pipeline can be driven by the real HTTP client or by a
//! scripted fake in tests. [`OpenAiCompatibleClient`] speaks the OpenAI
//! chat-completions and audio-transcription wire formats, which Groq,
//! OpenAI, and most local servers accept.
//!
//! Calls are plain request/response. There is no retry here: stages decide
//! for themselves what a failure means (fail open, degrade, or end the
//! turn), and a silent retry would hide rate limiting from that decision.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("API key not found: set the {0} environment variable")]
    MissingCredentials(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Model returned an empty response")]
    EmptyResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments string, exactly as the model produced it.
    pub arguments: String,
}

/// A function the model may call.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// `data:` URL of an attached image (user messages only).
    pub image_url: Option<String>,
    /// Calls requested by an assistant message.
    pub tool_calls: Vec<ToolCall>,
    /// Which call a tool message answers.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image_url: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn user_with_image(content: impl Into<String>, image_url: String) -> Self {
        let mut msg = Self::new(ChatRole::User, content);
        msg.image_url = Some(image_url);
        msg
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(ChatRole::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(ChatRole::Tool, content);
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    fn to_openai_json(&self) -> Value {
        let content = match &self.image_url {
            Some(url) => json!([
                { "type": "text", "text": self.content },
                { "type": "image_url", "image_url": { "url": url } }
            ]),
            None => Value::String(self.content.clone()),
        };

        let mut msg = json!({ "role": self.role.as_str(), "content": content });
        if !self.tool_calls.is_empty() {
            msg["tool_calls"] = self
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments }
                    })
                })
                .collect();
        }
        if let Some(id) = &self.tool_call_id {
            msg["tool_call_id"] = Value::String(id.clone());
        }
        msg
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, temperature: f32, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens: None,
            messages,
            tools: Vec::new(),
        }
    }

    /// The first system message, used by fakes and logs to tell stages apart.
    pub fn system_prompt(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    fn to_openai_json(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": self.messages.iter().map(|m| m.to_openai_json()).collect::<Vec<_>>(),
        });
        if let Some(max) = self.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if !self.tools.is_empty() {
            body["tools"] = self
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    /// Text content, or [`LlmError::EmptyResponse`] if there is none.
    pub fn into_text(self) -> Result<String, LlmError> {
        match self.content {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(LlmError::EmptyResponse),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub model: String,
    pub audio: Vec<u8>,
    pub filename: String,
    pub prompt: String,
}

/// A language-model completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// Speech-to-text. Returns the plain transcript.
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String, LlmError>;
}

/// Client for OpenAI-compatible `/chat/completions` and
/// `/audio/transcriptions` endpoints.
pub struct OpenAiCompatibleClient {
    base_url: String,
    api_key_env: String,
    timeout_secs: Option<u64>,
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
            timeout_secs: config.timeout_secs,
            http: builder.build()?,
        })
    }

    fn api_key(&self) -> Result<String, LlmError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingCredentials(self.api_key_env.clone()))
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.timeout_secs.unwrap_or(0))
        } else {
            LlmError::Http(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LlmError::Status {
            status: status.as_u16(),
            body: body.chars().take(300).collect(),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request.to_openai_json())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response).await?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_chat_response(&json)
    }

    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String, LlmError> {
        let api_key = self.api_key()?;
        let part = reqwest::multipart::Part::bytes(request.audio.clone())
            .file_name(request.filename.clone())
            .mime_str(audio_mime(&request.filename))
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", request.model.clone())
            .text("prompt", request.prompt.clone())
            .text("response_format", "text");

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response).await?;

        let text = response
            .text()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}

fn audio_mime(filename: &str) -> &'static str {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "webm" => "audio/webm",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Extract content and tool calls from `choices[0].message`.
fn parse_chat_response(json: &Value) -> Result<Completion, LlmError> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message".to_string()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string());

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for call in calls {
            let function = call
                .get("function")
                .ok_or_else(|| LlmError::InvalidResponse("tool call without function".into()))?;
            let name = function
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| LlmError::InvalidResponse("tool call without name".into()))?;
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            tool_calls.push(ToolCall {
                id: call
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or(name)
                    .to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    if content.as_deref().map_or(true, |c| c.trim().is_empty()) && tool_calls.is_empty() {
        return Err(LlmError::EmptyResponse);
    }

    Ok(Completion {
        content,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_response() {
        let json = json!({ "choices": [ { "message": { "role": "assistant", "content": "SAFE_MATH" } } ] });
        assert_eq!(parse_chat_response(&json).unwrap(), Completion::text("SAFE_MATH"));
    }

    #[test]
    fn test_parse_tool_call_response() {
        let json = json!({ "choices": [ { "message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [ { "id": "call_1", "type": "function",
                "function": { "name": "calculate", "arguments": "{\"expression\":\"2+2\"}" } } ]
        } } ] });
        let c = parse_chat_response(&json).unwrap();
        assert!(c.content.is_none());
        assert_eq!(c.tool_calls[0].id, "call_1");
        assert_eq!(c.tool_calls[0].name, "calculate");
        assert_eq!(c.tool_calls[0].arguments, "{\"expression\":\"2+2\"}");
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        let empty = json!({ "choices": [ { "message": { "content": "" } } ] });
        assert!(matches!(parse_chat_response(&empty), Err(LlmError::EmptyResponse)));
        assert!(matches!(
            parse_chat_response(&json!({})),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_request_json_shape() {
        let mut req = CompletionRequest::new(
            "m",
            0.0,
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user_with_image("read", "data:image/png;base64,AAAA".to_string()),
            ],
        );
        req.max_tokens = Some(1024);
        req.tools.push(ToolDefinition {
            name: "calculate".into(),
            description: "d".into(),
            parameters: json!({ "type": "object" }),
        });
        let body = req.to_openai_json();
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(body["tools"][0]["function"]["name"], "calculate");
        assert_eq!(req.system_prompt(), "sys");
    }

    #[test]
    fn test_tool_messages_serialize_ids() {
        let call = ToolCall {
            id: "c1".into(),
            name: "calculate".into(),
            arguments: "{}".into(),
        };
        let a = ChatMessage::assistant("", vec![call]).to_openai_json();
        assert_eq!(a["tool_calls"][0]["function"]["name"], "calculate");
        let t = ChatMessage::tool_result("c1", "4").to_openai_json();
        assert_eq!(t["role"], "tool");
        assert_eq!(t["tool_call_id"], "c1");
    }

    #[tokio::test]
    async fn test_missing_key_is_missing_credentials() {
        let config = LlmConfig {
            api_key_env: "MATH_MENTOR_TEST_UNSET_KEY".to_string(),
            ..Default::default()
        };
        let client = OpenAiCompatibleClient::new(&config).unwrap();
        let req = CompletionRequest::new("m", 0.0, vec![ChatMessage::user("hi")]);
        assert!(matches!(
            client.complete(&req).await,
            Err(LlmError::MissingCredentials(_))
        ));
    }

    #[test]
    fn test_audio_mime() {
        assert_eq!(audio_mime("q.MP3"), "audio/mpeg");
        assert_eq!(audio_mime("q.m4a"), "audio/mp4");
        assert_eq!(audio_mime("q"), "application/octet-stream");
    }
}
