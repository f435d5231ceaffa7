use serde::Serialize;
use serde_json::Value;

/// Provider-neutral transcript part. Every provider session converts its
/// native blocks *to* this shape; nothing converts back.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "part", rename_all = "snake_case")]
pub enum Part {
    UserText {
        text: String,
    },
    ModelText {
        text: String,
    },
    /// A reasoning block. For redacted reasoning, `text` carries the
    /// provider's opaque payload verbatim and `signature` is empty.
    Thinking {
        text: String,
        signature: String,
        redacted: bool,
    },
    ToolUse {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        payload: String,
        is_error: bool,
    },
}

/// Cumulative token counters for one agent invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub cache_read_input: u64,
    pub cache_write_input: u64,
    pub input: u64,
    pub thinking_output: u64,
    pub text_output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn absorb(&mut self, delta: &TokenUsage) {
        self.cache_read_input += delta.cache_read_input;
        self.cache_write_input += delta.cache_write_input;
        self.input += delta.input;
        self.thinking_output += delta.thinking_output;
        self.text_output += delta.text_output;
        self.total += delta.total;
    }

    pub fn output(&self) -> u64 {
        self.thinking_output + self.text_output
    }
}
