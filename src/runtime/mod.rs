mod ctx;

pub use ctx::RunCtx;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::agent::SpecHistory;
use crate::error::{Error, Fault};
use crate::node::{Node, NodeId};
use crate::provider::{AnthropicConfig, AnthropicFactory, ProviderKind, SessionFactory};
use crate::spec::{CodeOutcome, FunctionSpec, closure};
use crate::view::{NodeView, build_view};

pub(crate) struct RuntimeConfig {
    pub max_request_cycles: u32,
    pub default_provider: ProviderKind,
}

pub(crate) struct RuntimeInner {
    pub registry: HashMap<String, Arc<FunctionSpec>>,
    /// Arena keyed by node id. Parents and children reference each other
    /// by id only; the arena is the single owner of every node.
    pub arena: RwLock<HashMap<NodeId, Arc<Node>>>,
    pub roots: Mutex<Vec<NodeId>>,
    next_id: AtomicU64,
    /// Global version counter, doubling as the publication lock: every
    /// observable event bumps it and republishes the touched root path
    /// while holding it.
    version: Mutex<u64>,
    semaphores: HashMap<ProviderKind, Arc<Semaphore>>,
    pub history: SpecHistory,
    pub factory: Arc<dyn SessionFactory>,
    pub config: RuntimeConfig,
}

impl RuntimeInner {
    pub(crate) fn allocate_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn semaphore(&self, provider: ProviderKind) -> Arc<Semaphore> {
        self.semaphores[&provider].clone()
    }

    /// Bumps the global version and rebuilds the views of `node_id` and
    /// every ancestor at that version. Siblings keep their previous view
    /// `Arc`s untouched.
    pub(crate) fn publish(&self, node_id: NodeId) {
        let mut version = self.version.lock().expect("version lock poisoned");
        *version += 1;
        let seq = *version;

        let arena = self.arena.read().expect("node arena lock poisoned");
        let mut current = Some(node_id);
        while let Some(id) = current {
            let Some(node) = arena.get(&id) else { break };
            let child_ids: Vec<NodeId> = node
                .core
                .lock()
                .expect("node core lock poisoned")
                .children
                .clone();
            let children: Vec<Arc<NodeView>> = child_ids
                .iter()
                .filter_map(|child_id| arena.get(child_id))
                .map(|child| child.latest_view())
                .collect();
            let view = Arc::new(build_view(node, seq, children));
            node.view_tx.send_replace(view);
            current = node.parent;
        }
    }

    /// Transitions a node to its terminal state and publishes. The first
    /// terminal outcome wins; terminal states are frozen.
    pub(crate) fn complete(&self, node: &Arc<Node>, outcome: Result<CodeOutcome, Fault>) {
        {
            let mut core = node.core.lock().expect("node core lock poisoned");
            if core.state.is_terminal() {
                return;
            }
            match outcome {
                Ok(CodeOutcome::Value(value)) => {
                    core.state = crate::node::NodeState::Succeeded;
                    core.outputs = Some(value);
                }
                Ok(CodeOutcome::Raise(message)) => {
                    core.state = crate::node::NodeState::Succeeded;
                    core.outputs = Some(Value::String(message.clone()));
                    core.raise_signal = Some(message);
                }
                Err(fault) => {
                    debug!(node = node.id, fault = %fault.concise(), "invocation failed");
                    core.state = crate::node::NodeState::Failed;
                    core.fault = Some(fault);
                }
            }
        }
        // A finished tree returns its model-api permits to the pool.
        if node.parent.is_none() {
            node.lease.release_all();
        }
        self.publish(node.id);
    }
}

/// The runtime: spec registry, invocation arena, view publication, and
/// model-api gating. Consumers obtain a context with [`Runtime::ctx`] and
/// observe trees exclusively through immutable snapshots.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// A context bound to no invocation; `invoke` on it creates top-level
    /// trees.
    pub fn ctx(&self) -> RunCtx {
        RunCtx::unbound(Arc::downgrade(&self.inner))
    }

    pub fn spec(&self, name: &str) -> Option<Arc<FunctionSpec>> {
        self.inner.registry.get(name).cloned()
    }

    /// Latest view of every live top-level invocation, captured atomically
    /// at a single global version.
    pub fn toplevel_views(&self) -> Vec<Arc<NodeView>> {
        let _version = self.inner.version.lock().expect("version lock poisoned");
        let arena = self.inner.arena.read().expect("node arena lock poisoned");
        let roots = self.inner.roots.lock().expect("roots lock poisoned");
        roots
            .iter()
            .filter_map(|id| arena.get(id))
            .map(|node| node.latest_view())
            .collect()
    }

    /// Latest published view of one node; never blocks.
    pub fn view(&self, id: NodeId) -> Option<Arc<NodeView>> {
        let arena = self.inner.arena.read().expect("node arena lock poisoned");
        arena.get(&id).map(|node| node.latest_view())
    }

    /// Waits until the node's latest view has `update_seqnum > as_of_seq`
    /// and returns it.
    pub async fn watch(&self, id: NodeId, as_of_seq: u64) -> Result<Arc<NodeView>, Error> {
        let mut rx = {
            let arena = self.inner.arena.read().expect("node arena lock poisoned");
            arena
                .get(&id)
                .ok_or(Error::UnknownNode(id))?
                .view_tx
                .subscribe()
        };
        let view = rx
            .wait_for(|view| view.update_seqnum > as_of_seq)
            .await
            .map_err(|_| Error::UnknownNode(id))?;
        Ok(view.clone())
    }

    /// Frees a completed tree and its session bags. Deleted roots no
    /// longer appear in [`Runtime::toplevel_views`].
    pub fn delete_tree(&self, root: NodeId) -> Result<(), Error> {
        let _version = self.inner.version.lock().expect("version lock poisoned");
        let mut arena = self.inner.arena.write().expect("node arena lock poisoned");
        let mut roots = self.inner.roots.lock().expect("roots lock poisoned");
        let Some(position) = roots.iter().position(|&id| id == root) else {
            return Err(if arena.contains_key(&root) {
                Error::NotTopLevel(root)
            } else {
                Error::UnknownNode(root)
            });
        };
        roots.remove(position);

        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = arena.remove(&id) {
                stack.extend(
                    node.core
                        .lock()
                        .expect("node core lock poisoned")
                        .children
                        .iter()
                        .copied(),
                );
            }
        }
        debug!(root, "tree deleted");
        Ok(())
    }
}

pub struct RuntimeBuilder {
    specs: Vec<Arc<FunctionSpec>>,
    factory: Option<Arc<dyn SessionFactory>>,
    anthropic: Option<AnthropicConfig>,
    model_permits: usize,
    max_request_cycles: u32,
    default_provider: ProviderKind,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            factory: None,
            anthropic: None,
            model_permits: 2,
            max_request_cycles: 64,
            default_provider: ProviderKind::Anthropic,
        }
    }
}

impl RuntimeBuilder {
    pub fn spec(mut self, spec: Arc<FunctionSpec>) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn specs(mut self, specs: impl IntoIterator<Item = Arc<FunctionSpec>>) -> Self {
        self.specs.extend(specs);
        self
    }

    /// Installs a custom provider session factory. Tests inject scripted
    /// sessions here; the default is the Anthropic factory.
    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn anthropic(mut self, config: AnthropicConfig) -> Self {
        self.anthropic = Some(config);
        self
    }

    /// Permits per provider on the process-wide model-api semaphore.
    pub fn model_permits(mut self, permits: usize) -> Self {
        self.model_permits = permits;
        self
    }

    /// Upper bound on request cycles per agent invocation; exceeding it
    /// fails the node with a provider fault.
    pub fn max_request_cycles(mut self, cycles: u32) -> Self {
        self.max_request_cycles = cycles;
        self
    }

    pub fn build(self) -> Result<Runtime, Error> {
        let registry = closure(&self.specs)?;
        info!(specs = registry.len(), "runtime registry built");

        let factory: Arc<dyn SessionFactory> = match (self.factory, self.anthropic) {
            (Some(factory), _) => factory,
            (None, Some(config)) => Arc::new(AnthropicFactory::new(config)),
            (None, None) => Arc::new(AnthropicFactory::from_env()),
        };

        let semaphores = ProviderKind::ALL
            .iter()
            .map(|provider| (*provider, Arc::new(Semaphore::new(self.model_permits))))
            .collect();

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                registry,
                arena: RwLock::new(HashMap::new()),
                roots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                version: Mutex::new(0),
                semaphores,
                history: SpecHistory::default(),
                factory,
                config: RuntimeConfig {
                    max_request_cycles: self.max_request_cycles,
                    default_provider: self.default_provider,
                },
            }),
        })
    }
}
