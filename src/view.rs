use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::agent::CacheTag;
use crate::node::{Node, NodeId, NodeState};
use crate::spec::{Args, SpecKind};
use crate::transcript::{Part, TokenUsage};

/// Immutable snapshot of one node, tagged with the global version at which
/// it was rebuilt. Child views are shared by reference: a rebuild of an
/// ancestor reuses the untouched children's `Arc`s bit-identically.
#[derive(Clone, Debug, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub spec_name: String,
    pub kind: SpecKind,
    pub state: NodeState,
    pub update_seqnum: u64,
    pub inputs: Args,
    pub outputs: Option<Value>,
    /// Concise fault description for UIs; `None` while live or succeeded.
    pub fault: Option<String>,
    pub children: Vec<Arc<NodeView>>,
    pub agent: Option<AgentView>,
}

/// Agent-only view extension: cumulative token usage, the frozen cache
/// tag, and the provider-neutral transcript.
#[derive(Clone, Debug, Serialize)]
pub struct AgentView {
    pub usage: TokenUsage,
    pub cache_tag: Option<CacheTag>,
    pub transcript: Vec<Part>,
}

pub(crate) fn build_view(node: &Node, seq: u64, children: Vec<Arc<NodeView>>) -> NodeView {
    let core = node.core.lock().expect("node core lock poisoned");
    NodeView {
        id: node.id,
        spec_name: node.spec.name().to_string(),
        kind: node.spec.kind(),
        state: core.state,
        update_seqnum: seq,
        inputs: node.inputs.clone(),
        outputs: core.outputs.clone(),
        fault: core.fault.as_ref().map(|fault| fault.concise()),
        children,
        agent: core.agent.as_ref().map(|ext| AgentView {
            usage: ext.usage,
            cache_tag: ext.cache_tag,
            transcript: ext.transcript.clone(),
        }),
    }
}
