use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::debug;

use crate::agent;
use crate::error::{Error, Fault, SessionError, SpecError};
use crate::node::{LeaseSlot, Node, NodeHandle, NodeId, NodeState};
use crate::prompt;
use crate::provider::ProviderKind;
use crate::runtime::RuntimeInner;
use crate::session::{Scope, SessionBag};
use crate::spec::{Args, CodeOutcome, FunctionSpec, SpecBody};

/// Caller-bound facade handed to every invocation body, and the only
/// channel by which one invocation creates another through the scheduler.
/// Holds weak references; a context never keeps a runtime or node alive.
#[derive(Clone)]
pub struct RunCtx {
    runtime: Weak<RuntimeInner>,
    node: Option<Weak<Node>>,
}

impl RunCtx {
    pub(crate) fn unbound(runtime: Weak<RuntimeInner>) -> Self {
        Self {
            runtime,
            node: None,
        }
    }

    pub(crate) fn bound(runtime: Weak<RuntimeInner>, node: &Arc<Node>) -> Self {
        Self {
            runtime,
            node: Some(Arc::downgrade(node)),
        }
    }

    /// Id of the bound invocation, or `None` for a consumer-side context.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|node| node.id)
    }

    fn runtime(&self) -> Result<Arc<RuntimeInner>, Error> {
        self.runtime.upgrade().ok_or(Error::RuntimeShutdown)
    }

    /// Looks up a registered spec by name, for code bodies that invoke
    /// their `uses` without capturing the `Arc`s themselves.
    pub fn registered(&self, name: &str) -> Result<Arc<FunctionSpec>, Error> {
        let runtime = self.runtime()?;
        runtime
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| SpecError::Unregistered(name.to_string()).into())
    }

    fn bound_node(&self) -> Result<Arc<Node>, Error> {
        match &self.node {
            Some(weak) => weak.upgrade().ok_or(Error::RuntimeShutdown),
            None => Err(SessionError::Unbound.into()),
        }
    }

    /// Invokes a registered spec as a child of the bound invocation (or as
    /// a new top-level tree when unbound) under the default provider.
    pub async fn invoke(
        &self,
        spec: &Arc<FunctionSpec>,
        args: Args,
    ) -> Result<NodeHandle, Error> {
        self.invoke_with(spec, args, None).await
    }

    /// Like [`RunCtx::invoke`] with an explicit provider. Code bodies run
    /// inline on the caller's task and return an already-terminal handle;
    /// agent bodies are enqueued on the worker pool and the handle joins
    /// them through [`NodeHandle::result`].
    pub async fn invoke_with(
        &self,
        spec: &Arc<FunctionSpec>,
        args: Args,
        provider: Option<ProviderKind>,
    ) -> Result<NodeHandle, Error> {
        let runtime = self.runtime()?;
        match runtime.registry.get(spec.name()) {
            Some(registered) if Arc::ptr_eq(registered, spec) => {}
            _ => return Err(SpecError::Unregistered(spec.name().to_string()).into()),
        }
        spec.schema().validate_args(spec.name(), &args)?;

        // Agent prompts resolve before the node exists, so a bad template
        // or unreadable input file fails the invoke, not the node.
        let prompts = match spec.body() {
            SpecBody::Agent {
                system_template,
                user_template,
                ..
            } => {
                let vars = prompt::resolve_inputs(spec, &args).await?;
                let system = prompt::render(spec.name(), system_template, &vars)?;
                let seed = prompt::render(spec.name(), user_template, &vars)?;
                Some((system, seed))
            }
            SpecBody::Code { .. } => None,
        };

        let parent = match &self.node {
            Some(weak) => Some(weak.upgrade().ok_or(Error::RuntimeShutdown)?),
            None => None,
        };

        let id = runtime.allocate_id();
        let bag = SessionBag::new();
        let (parent_bag, top_bag, lease) = match &parent {
            Some(parent) => (
                Some(parent.bag.clone()),
                parent.top_bag.clone(),
                parent.lease.clone(),
            ),
            None => (None, bag.clone(), Arc::new(LeaseSlot::default())),
        };

        let node = Node::new(
            id,
            spec.clone(),
            args.clone(),
            parent.as_ref().map(|parent| parent.id),
            bag,
            parent_bag,
            top_bag,
            lease,
        );
        runtime
            .arena
            .write()
            .expect("node arena lock poisoned")
            .insert(id, node.clone());
        match &parent {
            Some(parent) => parent
                .core
                .lock()
                .expect("node core lock poisoned")
                .children
                .push(id),
            None => runtime.roots.lock().expect("roots lock poisoned").push(id),
        }
        runtime.publish(id);
        debug!(spec = spec.name(), node = id, "invocation created");

        let child_ctx = RunCtx::bound(self.runtime.clone(), &node);
        match (spec.callable(), prompts) {
            (Some(callable), _) => {
                // Inline start; the Waiting→Running flip has no observable
                // gap, so it does not bump the version.
                node.set_state(NodeState::Running);
                let outcome = callable(child_ctx, args).await.map_err(|err| Fault::Code {
                    spec: spec.name().to_string(),
                    node: id,
                    message: err.to_string(),
                });
                runtime.complete(&node, outcome);
            }
            (None, Some((system, seed))) => {
                let provider = provider.unwrap_or(runtime.config.default_provider);
                tokio::spawn(agent::run_agent(
                    runtime.clone(),
                    node.clone(),
                    child_ctx,
                    provider,
                    system,
                    seed,
                ));
            }
            (None, None) => unreachable!("agent spec without prompts"),
        }

        Ok(NodeHandle { node })
    }

    /// Reports a non-terminal state change for the bound invocation.
    pub fn post_status(&self, state: NodeState) -> Result<(), Error> {
        debug_assert!(!state.is_terminal(), "terminal states go through post_success/post_failure");
        let runtime = self.runtime()?;
        let node = self.bound_node()?;
        node.set_state(state);
        runtime.publish(node.id);
        Ok(())
    }

    /// Reports successful completion of the bound invocation.
    pub fn post_success(&self, outputs: Value) -> Result<(), Error> {
        let runtime = self.runtime()?;
        let node = self.bound_node()?;
        runtime.complete(&node, Ok(CodeOutcome::Value(outputs)));
        Ok(())
    }

    /// Reports failure of the bound invocation.
    pub fn post_failure(&self, fault: Fault) -> Result<(), Error> {
        let runtime = self.runtime()?;
        let node = self.bound_node()?;
        runtime.complete(&node, Err(fault));
        Ok(())
    }

    /// Atomic read-or-create in the session bag at the named scope. The
    /// factory runs under the bag's lock.
    pub fn get_or_put<T, F>(
        &self,
        scope: Scope,
        namespace: &str,
        key: &str,
        factory: F,
    ) -> Result<Arc<T>, Error>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let node = self.bound_node()?;
        let bag = match scope {
            Scope::Own => node.bag.clone(),
            Scope::TopLevel => node.top_bag.clone(),
            Scope::Parent => node
                .parent_bag
                .clone()
                .ok_or(SessionError::NoParentScope)?,
        };
        Ok(bag.get_or_put(namespace, key, factory)?)
    }

    /// Courtesy release of the tree's model-api lease for long blocking
    /// non-agent work. The releasing tool must not re-acquire; the next
    /// agent request in the tree does.
    pub fn release_model_lease(&self) -> Result<(), Error> {
        let node = self.bound_node()?;
        node.lease.release_all();
        debug!(node = node.id, "model lease released");
        Ok(())
    }
}
