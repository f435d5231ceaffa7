pub mod anthropic;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::CacheTag;
use crate::error::WireError;
use crate::spec::FunctionSpec;
use crate::transcript::{Part, TokenUsage};

pub use anthropic::{AnthropicConfig, AnthropicFactory};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
        }
    }

    pub(crate) const ALL: [ProviderKind; 1] = [ProviderKind::Anthropic];
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tool signature advertised to the model, derived from a spec in the
/// agent's `uses` list.
#[derive(Clone, Debug)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDef {
    pub fn from_spec(spec: &FunctionSpec) -> Self {
        Self {
            name: spec.name().to_string(),
            description: spec.description().to_string(),
            input_schema: spec.schema().to_json_schema(),
        }
    }
}

/// One tool invocation extracted from a model response.
#[derive(Clone, Debug)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// One entry of the aggregated tool-result turn fed back to the model.
#[derive(Clone, Debug)]
pub struct ToolResultEntry {
    pub id: String,
    pub payload: String,
    pub is_error: bool,
}

/// What the loop needs from one ingested response: the extracted tool
/// requests, the final text (if any), and the response's token usage.
#[derive(Clone, Debug)]
pub struct ModelTurn {
    pub requests: Vec<ToolRequest>,
    pub text: Option<String>,
    pub usage: TokenUsage,
}

/// One provider-specialized LLM session. The session owns the native
/// transcript storage and replays it verbatim on every request; conversion
/// is always *to* the neutral [`Part`] shape, never from it.
#[async_trait]
pub trait ProviderSession: Send {
    fn provider(&self) -> ProviderKind;

    /// Composes system + seed + full transcript (cache marker on the
    /// latest message only), submits, ingests the response into the
    /// native transcript unaltered, and returns the extracted turn.
    async fn step(&mut self, cache: CacheTag) -> Result<ModelTurn, WireError>;

    /// Folds one batch of tool results into a single follow-up user turn.
    fn record_tool_results(&mut self, results: &[ToolResultEntry]);

    /// Neutral projection of the native transcript, in order, starting at
    /// the seed user turn.
    fn transcript(&self) -> Vec<Part>;
}

/// Opens provider sessions for agent invocations. The runtime installs
/// one at construction; tests inject a scripted implementation.
pub trait SessionFactory: Send + Sync {
    fn open(
        &self,
        agent: &FunctionSpec,
        system: String,
        seed: String,
        tools: Vec<ToolDef>,
        provider: ProviderKind,
    ) -> Result<Box<dyn ProviderSession>, WireError>;
}
