use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, watch};

use crate::agent::CacheTag;
use crate::error::{Error, Fault};
use crate::session::SessionBag;
use crate::spec::{Args, FunctionSpec, SpecKind};
use crate::transcript::{Part, TokenUsage};
use crate::view::{AgentView, NodeView};

pub type NodeId = u64;

/// Lifecycle of one invocation. Transitions are strictly monotonic along
/// Waiting → Running → {Succeeded | Failed}; terminal states are frozen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Waiting,
    Running,
    Succeeded,
    Failed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Failed)
    }
}

#[derive(Default)]
pub(crate) struct AgentExt {
    pub usage: TokenUsage,
    pub cache_tag: Option<CacheTag>,
    pub transcript: Vec<Part>,
}

pub(crate) struct NodeCore {
    pub state: NodeState,
    pub outputs: Option<Value>,
    pub fault: Option<Fault>,
    /// Set when a code callable returned the raise sentinel; inspected by
    /// the invoking agent loop after the tool batch completes.
    pub raise_signal: Option<String>,
    pub children: Vec<NodeId>,
    pub agent: Option<AgentExt>,
}

/// Holds the tree's model-API permits, one per provider. Created at the
/// top-level node and inherited by every descendant, so an agent anywhere
/// in the tree sees whether its tree already holds a lease.
#[derive(Default)]
pub(crate) struct LeaseSlot {
    permits: Mutex<HashMap<&'static str, OwnedSemaphorePermit>>,
}

impl LeaseSlot {
    pub fn holds(&self, provider: &'static str) -> bool {
        self.permits
            .lock()
            .expect("lease slot lock poisoned")
            .contains_key(provider)
    }

    pub fn put(&self, provider: &'static str, permit: OwnedSemaphorePermit) {
        self.permits
            .lock()
            .expect("lease slot lock poisoned")
            .insert(provider, permit);
    }

    pub fn release_all(&self) {
        self.permits
            .lock()
            .expect("lease slot lock poisoned")
            .clear();
    }
}

pub(crate) struct Node {
    pub id: NodeId,
    pub spec: Arc<FunctionSpec>,
    pub inputs: Args,
    pub parent: Option<NodeId>,
    pub bag: Arc<SessionBag>,
    pub parent_bag: Option<Arc<SessionBag>>,
    pub top_bag: Arc<SessionBag>,
    pub lease: Arc<LeaseSlot>,
    pub core: Mutex<NodeCore>,
    /// Latest published view. The channel doubles as the completion
    /// signal: `result()` and `watch()` both wait on it.
    pub view_tx: watch::Sender<Arc<NodeView>>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: NodeId,
        spec: Arc<FunctionSpec>,
        inputs: Args,
        parent: Option<NodeId>,
        bag: Arc<SessionBag>,
        parent_bag: Option<Arc<SessionBag>>,
        top_bag: Arc<SessionBag>,
        lease: Arc<LeaseSlot>,
    ) -> Arc<Node> {
        let agent = matches!(spec.kind(), SpecKind::Agent).then(AgentExt::default);
        let placeholder = Arc::new(NodeView {
            id,
            spec_name: spec.name().to_string(),
            kind: spec.kind(),
            state: NodeState::Waiting,
            update_seqnum: 0,
            inputs: inputs.clone(),
            outputs: None,
            fault: None,
            children: Vec::new(),
            agent: agent.as_ref().map(|ext| AgentView {
                usage: ext.usage,
                cache_tag: ext.cache_tag,
                transcript: ext.transcript.clone(),
            }),
        });
        let (view_tx, _) = watch::channel(placeholder);
        Arc::new(Node {
            id,
            spec,
            inputs,
            parent,
            bag,
            parent_bag,
            top_bag,
            lease,
            core: Mutex::new(NodeCore {
                state: NodeState::Waiting,
                outputs: None,
                fault: None,
                raise_signal: None,
                children: Vec::new(),
                agent,
            }),
            view_tx,
        })
    }

    pub(crate) fn latest_view(&self) -> Arc<NodeView> {
        self.view_tx.borrow().clone()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        let mut core = self.core.lock().expect("node core lock poisoned");
        debug_assert!(
            !core.state.is_terminal(),
            "node {} left a terminal state",
            self.id
        );
        core.state = state;
    }
}

/// Public face of an invocation node: a cheap, cloneable handle whose
/// `result()` is a one-shot join on the invocation's terminal state.
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) node: Arc<Node>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("id", &self.node.id).finish()
    }
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn spec_name(&self) -> &str {
        self.node.spec.name()
    }

    /// Latest published view; never blocks.
    pub fn view(&self) -> Arc<NodeView> {
        self.node.latest_view()
    }

    /// Waits until this node's latest view has `update_seqnum > as_of_seq`
    /// and returns it.
    pub async fn watch(&self, as_of_seq: u64) -> Result<Arc<NodeView>, Error> {
        let mut rx = self.node.view_tx.subscribe();
        let view = rx
            .wait_for(|view| view.update_seqnum > as_of_seq)
            .await
            .map_err(|_| Error::RuntimeShutdown)?;
        Ok(view.clone())
    }

    pub(crate) fn raise_signal(&self) -> Option<String> {
        self.node
            .core
            .lock()
            .expect("node core lock poisoned")
            .raise_signal
            .clone()
    }

    /// Blocks until the invocation reaches a terminal state, then returns
    /// its outputs or rethrows its stored fault.
    pub async fn result(&self) -> Result<Value, Error> {
        let mut rx = self.node.view_tx.subscribe();
        rx.wait_for(|view| view.state.is_terminal())
            .await
            .map_err(|_| Error::RuntimeShutdown)?;

        let core = self.node.core.lock().expect("node core lock poisoned");
        match core.state {
            NodeState::Succeeded => Ok(core.outputs.clone().unwrap_or(Value::Null)),
            NodeState::Failed => match core.fault.clone() {
                Some(fault) => Err(Error::Fault(fault)),
                None => Err(Error::UnknownNode(self.node.id)),
            },
            NodeState::Waiting | NodeState::Running => unreachable!("waited for terminal state"),
        }
    }
}
