use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::agent::CacheTag;
use crate::error::WireError;
use crate::provider::{
    ModelTurn, ProviderKind, ProviderSession, SessionFactory, ToolDef, ToolRequest,
    ToolResultEntry,
};
use crate::spec::FunctionSpec;
use crate::transcript::{Part, TokenUsage};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
const EXTENDED_CACHE_TTL_BETA: &str = "extended-cache-ttl-2025-04-11";

#[derive(Debug, Clone)]
/// Runtime configuration for the Anthropic wire client.
pub struct AnthropicConfig {
    /// Anthropic API key.
    pub api_key: String,
    /// Default model id (for example `claude-sonnet-4-5`); agent specs may
    /// override per spec.
    pub model: String,
    /// Messages endpoint override for proxies or compatible endpoints.
    pub base_url: String,
    /// `anthropic-version` header value.
    pub version: String,
    /// Maximum output tokens per request.
    pub max_tokens: u32,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional budget for extended thinking tokens. Configured
    /// independently of `max_tokens`; when set together with tools the
    /// interleaved-thinking beta header is sent.
    pub thinking_budget_tokens: Option<u32>,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            version: ANTHROPIC_VERSION.to_string(),
            max_tokens: 8192,
            temperature: None,
            thinking_budget_tokens: None,
        }
    }

    /// Reads `ANTHROPIC_API_KEY` from the environment.
    pub fn from_env(model: impl Into<String>) -> Result<Self, WireError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| WireError::Auth("ANTHROPIC_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, model))
    }
}

/// Default [`SessionFactory`]: opens one Anthropic session per agent
/// invocation. With no explicit config the key is resolved from the
/// environment at first open, so code-only runtimes never need one.
pub struct AnthropicFactory {
    client: Client,
    config: Option<AnthropicConfig>,
}

impl AnthropicFactory {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: Client::new(),
            config: Some(config),
        }
    }

    pub fn from_env() -> Self {
        Self {
            client: Client::new(),
            config: None,
        }
    }

    fn resolve(&self) -> Result<AnthropicConfig, WireError> {
        match &self.config {
            Some(config) => Ok(config.clone()),
            None => AnthropicConfig::from_env("claude-sonnet-4-5"),
        }
    }
}

impl SessionFactory for AnthropicFactory {
    fn open(
        &self,
        agent: &FunctionSpec,
        system: String,
        seed: String,
        tools: Vec<ToolDef>,
        provider: ProviderKind,
    ) -> Result<Box<dyn ProviderSession>, WireError> {
        debug_assert_eq!(provider, ProviderKind::Anthropic);
        let config = self.resolve()?;
        let model = agent
            .model_hint()
            .unwrap_or(config.model.as_str())
            .to_string();
        Ok(Box::new(AnthropicSession {
            client: self.client.clone(),
            config,
            model,
            system,
            tools,
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: vec![WireBlock::Text {
                    text: seed,
                    cache_control: None,
                }],
            }],
        }))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
}

impl CacheControl {
    fn for_tag(tag: CacheTag) -> Option<CacheControl> {
        match tag {
            CacheTag::None => None,
            CacheTag::FiveMinutes => Some(CacheControl {
                kind: "ephemeral".to_string(),
                ttl: None,
            }),
            CacheTag::OneHour => Some(CacheControl {
                kind: "ephemeral".to_string(),
                ttl: Some("1h".to_string()),
            }),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct WireMessage {
    role: String,
    content: Vec<WireBlock>,
}

#[derive(Serialize)]
struct WireToolDef<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireToolDef<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireBlock>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

pub(crate) struct AnthropicSession {
    client: Client,
    config: AnthropicConfig,
    model: String,
    system: String,
    tools: Vec<ToolDef>,
    /// Native transcript, replayed verbatim on every request. Assistant
    /// blocks are stored exactly as received, signatures included.
    messages: Vec<WireMessage>,
}

impl AnthropicSession {
    fn build_request(&self, cache: CacheTag) -> WireRequest<'_> {
        let mut messages = self.messages.clone();
        if let Some(marker) = CacheControl::for_tag(cache) {
            mark_latest(&mut messages, marker);
        }
        let thinking = self
            .config
            .thinking_budget_tokens
            .map(|budget_tokens| json!({"type": "enabled", "budget_tokens": budget_tokens}));
        WireRequest {
            model: &self.model,
            max_tokens: self.config.max_tokens,
            system: self.system.clone(),
            messages,
            tools: self
                .tools
                .iter()
                .map(|tool| WireToolDef {
                    name: &tool.name,
                    description: &tool.description,
                    input_schema: &tool.input_schema,
                })
                .collect(),
            tool_choice: (!self.tools.is_empty()).then(|| json!({"type": "auto"})),
            thinking,
            temperature: self.config.temperature,
            stream: false,
        }
    }

    fn beta_header(&self, cache: CacheTag) -> Option<String> {
        let mut betas = Vec::new();
        if self.config.thinking_budget_tokens.is_some() && !self.tools.is_empty() {
            betas.push(INTERLEAVED_THINKING_BETA);
        }
        if cache == CacheTag::OneHour {
            betas.push(EXTENDED_CACHE_TTL_BETA);
        }
        if betas.is_empty() {
            None
        } else {
            Some(betas.join(","))
        }
    }
}

#[async_trait]
impl ProviderSession for AnthropicSession {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn step(&mut self, cache: CacheTag) -> Result<ModelTurn, WireError> {
        let body = self.build_request(cache);
        debug!(model = %self.model, messages = self.messages.len(), "anthropic request");

        let mut request = self
            .client
            .post(&self.config.base_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.version)
            .header("content-type", "application/json");
        if let Some(betas) = self.beta_header(cache) {
            request = request.header("anthropic-beta", betas);
        }

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|err| WireError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|err| WireError::Decode(err.to_string()))?;

        let turn = normalize_response(&wire);
        self.messages.push(WireMessage {
            role: "assistant".to_string(),
            content: wire.content,
        });
        Ok(turn)
    }

    fn record_tool_results(&mut self, results: &[ToolResultEntry]) {
        let content = results
            .iter()
            .map(|entry| WireBlock::ToolResult {
                tool_use_id: entry.id.clone(),
                content: entry.payload.clone(),
                is_error: entry.is_error.then_some(true),
                cache_control: None,
            })
            .collect();
        self.messages.push(WireMessage {
            role: "user".to_string(),
            content,
        });
    }

    fn transcript(&self) -> Vec<Part> {
        project_transcript(&self.messages)
    }
}

fn mark_latest(messages: &mut [WireMessage], marker: CacheControl) {
    let Some(message) = messages.last_mut() else {
        return;
    };
    for block in message.content.iter_mut().rev() {
        match block {
            WireBlock::Text { cache_control, .. }
            | WireBlock::ToolResult { cache_control, .. } => {
                *cache_control = Some(marker);
                return;
            }
            WireBlock::Thinking { .. }
            | WireBlock::RedactedThinking { .. }
            | WireBlock::ToolUse { .. } => {}
        }
    }
}

fn classify_status(status: u16, body: String) -> WireError {
    match status {
        401 | 403 => WireError::Auth(body),
        429 => WireError::RateLimited(body),
        529 => WireError::Overloaded(body),
        _ => WireError::Api { status, body },
    }
}

fn normalize_response(response: &WireResponse) -> ModelTurn {
    let mut text_parts = Vec::new();
    let mut requests = Vec::new();
    let mut thinking_chars = 0u64;
    let mut text_chars = 0u64;

    for block in &response.content {
        match block {
            WireBlock::Text { text, .. } => {
                text_chars += text.chars().count() as u64;
                text_parts.push(text.clone());
            }
            WireBlock::Thinking { thinking, .. } => {
                thinking_chars += thinking.chars().count() as u64;
            }
            WireBlock::RedactedThinking { data } => {
                thinking_chars += data.chars().count() as u64;
            }
            WireBlock::ToolUse { id, name, input } => requests.push(ToolRequest {
                id: id.clone(),
                name: name.clone(),
                args: input.clone(),
            }),
            WireBlock::ToolResult { .. } => {}
        }
    }

    let text = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join("\n"))
    };

    ModelTurn {
        requests,
        text,
        usage: split_usage(&response.usage, thinking_chars, text_chars),
    }
}

// The API reports a single output counter; split it across thinking and
// text by block character length, remainder to text.
fn split_usage(usage: &WireUsage, thinking_chars: u64, text_chars: u64) -> TokenUsage {
    let chars = thinking_chars + text_chars;
    let thinking_output = if chars == 0 {
        0
    } else {
        usage.output_tokens * thinking_chars / chars
    };
    TokenUsage {
        cache_read_input: usage.cache_read_input_tokens,
        cache_write_input: usage.cache_creation_input_tokens,
        input: usage.input_tokens,
        thinking_output,
        text_output: usage.output_tokens - thinking_output,
        total: usage.input_tokens
            + usage.cache_read_input_tokens
            + usage.cache_creation_input_tokens
            + usage.output_tokens,
    }
}

fn project_transcript(messages: &[WireMessage]) -> Vec<Part> {
    let mut parts = Vec::new();
    for message in messages {
        let assistant = message.role == "assistant";
        for block in &message.content {
            match block {
                WireBlock::Text { text, .. } => {
                    if assistant {
                        parts.push(Part::ModelText { text: text.clone() });
                    } else {
                        parts.push(Part::UserText { text: text.clone() });
                    }
                }
                WireBlock::Thinking {
                    thinking,
                    signature,
                } => parts.push(Part::Thinking {
                    text: thinking.clone(),
                    signature: signature.clone(),
                    redacted: false,
                }),
                WireBlock::RedactedThinking { data } => parts.push(Part::Thinking {
                    text: data.clone(),
                    signature: String::new(),
                    redacted: true,
                }),
                WireBlock::ToolUse { id, name, input } => parts.push(Part::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    args: input.clone(),
                }),
                WireBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                    ..
                } => parts.push(Part::ToolResult {
                    id: tool_use_id.clone(),
                    payload: content.clone(),
                    is_error: is_error.unwrap_or(false),
                }),
            }
        }
    }
    parts
}
