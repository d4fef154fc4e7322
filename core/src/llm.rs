//! Narrow interfaces to the two external collaborators, the text-completion
//! service used by generator tools and the planning loop, plus an
//! OpenAI-compatible client implementing both.

use crate::config::LlmSettings;
use crate::error::LlmError;
use crate::schema::ToolDescriptor;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// One synchronous prompt-in, text-out call.
pub trait TextCompletion {
    fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Decides the next step given the conversation so far and the tools on offer.
pub trait Planner {
    fn next_action(&mut self, request: &PlannerRequest<'_>) -> Result<PlannerAction, LlmError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PlannerRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolDescriptor],
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerAction {
    CallTools {
        thought: Option<String>,
        calls: Vec<ToolCall>,
    },
    Finish(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant_tool_calls(thought: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: thought,
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A tool call requested by the planner. `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Client for any `/chat/completions` endpoint (OpenAI, vLLM, Ollama, LiteLLM).
pub struct OpenAiClient {
    client: Client,
    settings: LlmSettings,
}

impl OpenAiClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| LlmError::Other(format!("failed to create HTTP client: {err}")))?;
        Ok(Self { client, settings })
    }

    fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ChoiceMessage, LlmError> {
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: messages.iter().map(wire_message).collect(),
            tools: tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
            temperature: Some(0.0),
        };

        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        debug!(model = %self.settings.model, messages = messages.len(), tools = tools.len(), "chat completion request");

        let mut req = self.client.post(&url).json(&request);
        if let Some(api_key) = &self.settings.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req
            .send()
            .map_err(|err| LlmError::Network(err.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().unwrap_or_default();
            return Err(match status {
                401 => LlmError::AuthenticationFailed,
                429 => LlmError::RateLimited,
                _ => LlmError::Api {
                    status,
                    message: text,
                },
            });
        }

        let body: ChatResponse = response
            .json()
            .map_err(|err| LlmError::Parse(err.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| LlmError::Other("no choices in response".to_string()))
    }
}

impl TextCompletion for OpenAiClient {
    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let message = self.chat(&[ChatMessage::user(prompt)], &[])?;
        Ok(message.content.unwrap_or_default())
    }
}

impl Planner for OpenAiClient {
    fn next_action(&mut self, request: &PlannerRequest<'_>) -> Result<PlannerAction, LlmError> {
        let message = self.chat(request.messages, request.tools)?;
        let wire_calls = message.tool_calls.unwrap_or_default();
        if wire_calls.is_empty() {
            return Ok(PlannerAction::Finish(message.content.unwrap_or_default()));
        }
        let calls = wire_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();
        Ok(PlannerAction::CallTools {
            thought: message.content.filter(|text| !text.trim().is_empty()),
            calls,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": message.role,
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_use_function_wire_shape() {
        let message = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "RunKubectlTool".to_string(),
                arguments: "{\"args\":\"get pods\"}".to_string(),
            }],
        );
        let wire = wire_message(&message);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "RunKubectlTool");
    }

    #[test]
    fn tool_results_carry_call_id() {
        let wire = wire_message(&ChatMessage::tool_result("call_9", "{\"return_code\":0}"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
    }

    #[test]
    fn response_without_tool_calls_deserializes() {
        let body: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"done"}}]}"#,
        )
        .expect("response parses");
        let message = body.choices.into_iter().next().expect("one choice");
        assert_eq!(message.message.content.as_deref(), Some("done"));
        assert!(message.message.tool_calls.is_none());
    }
}
