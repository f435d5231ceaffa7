use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Fault, WireError};
use crate::node::{Node, NodeState};
use crate::provider::{ProviderKind, ProviderSession, ToolDef, ToolRequest, ToolResultEntry};
use crate::runtime::{RunCtx, RuntimeInner};
use crate::spec::{ArgValue, Args, CodeOutcome, FunctionSpec, SpecKind};

/// Prompt-cache watermark selected once per agent invocation, before the
/// first request, and frozen for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CacheTag {
    None,
    FiveMinutes,
    OneHour,
}

/// Outcome statistics of one completed agent invocation, kept for the
/// cache-watermark heuristic.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RunStats {
    pub tool_calls: u32,
    pub mean_gap: Option<Duration>,
}

/// Rolling window of the last five completed invocations per agent spec.
#[derive(Default)]
pub(crate) struct SpecHistory {
    runs: Mutex<HashMap<String, VecDeque<RunStats>>>,
}

impl SpecHistory {
    pub fn record(&self, spec: &str, stats: RunStats) {
        let mut runs = self.runs.lock().expect("spec history lock poisoned");
        let window = runs.entry(spec.to_string()).or_default();
        window.push_back(stats);
        while window.len() > 5 {
            window.pop_front();
        }
    }

    pub fn mean_calls_and_gap(&self, spec: &str) -> Option<(f64, Option<Duration>)> {
        let runs = self.runs.lock().expect("spec history lock poisoned");
        let window = runs.get(spec)?;
        if window.is_empty() {
            return None;
        }
        let mean_calls =
            window.iter().map(|r| r.tool_calls as f64).sum::<f64>() / window.len() as f64;
        let gaps: Vec<Duration> = window.iter().filter_map(|r| r.mean_gap).collect();
        let mean_gap = if gaps.is_empty() {
            None
        } else {
            Some(gaps.iter().sum::<Duration>() / gaps.len() as u32)
        };
        Some((mean_calls, mean_gap))
    }
}

/// The cache-watermark policy:
/// no tools → none; only non-branching, non-interactive code leaves → 5m;
/// otherwise 1hr when the last five completed runs averaged more than one
/// tool call with a mean inter-call gap under an hour, else none.
pub(crate) fn decide_cache_tag(spec: &FunctionSpec, history: &SpecHistory) -> CacheTag {
    let tools = spec.uses();
    if tools.is_empty() {
        return CacheTag::None;
    }
    let leaf_only = tools
        .iter()
        .all(|tool| matches!(tool.kind(), SpecKind::Code) && tool.uses().is_empty());
    let interactive = tools.iter().any(|tool| tool.interactive());
    if leaf_only && !interactive {
        return CacheTag::FiveMinutes;
    }
    match history.mean_calls_and_gap(spec.name()) {
        Some((mean_calls, Some(mean_gap)))
            if mean_calls > 1.0 && mean_gap < Duration::from_secs(3600) =>
        {
            CacheTag::OneHour
        }
        _ => CacheTag::None,
    }
}

const RETRY_DELAYS: [Duration; 4] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
    Duration::from_secs(20),
];

#[derive(Default)]
struct ToolCallStats {
    calls: u32,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl ToolCallStats {
    fn record(&mut self, now: Instant) {
        self.calls += 1;
        self.first.get_or_insert(now);
        self.last = Some(now);
    }

    fn mean_gap(&self) -> Option<Duration> {
        match (self.first, self.last) {
            (Some(first), Some(last)) if self.calls >= 2 => Some((last - first) / (self.calls - 1)),
            _ => None,
        }
    }
}

/// Drives one agent invocation to a terminal state. Runs as its own tokio
/// task; the node is Running from the first publish here until `complete`.
/// Boxed so the agent→tool→child-agent recursion stays finite at the type
/// level.
pub(crate) fn run_agent(
    runtime: Arc<RuntimeInner>,
    node: Arc<Node>,
    ctx: RunCtx,
    provider: ProviderKind,
    system: String,
    seed: String,
) -> BoxFuture<'static, ()> {
    Box::pin(run_agent_inner(runtime, node, ctx, provider, system, seed))
}

async fn run_agent_inner(
    runtime: Arc<RuntimeInner>,
    node: Arc<Node>,
    ctx: RunCtx,
    provider: ProviderKind,
    system: String,
    seed: String,
) {
    let agent_name = node.spec.name().to_string();
    let cache = decide_cache_tag(&node.spec, &runtime.history);
    {
        let mut core = node.core.lock().expect("node core lock poisoned");
        core.state = NodeState::Running;
        if let Some(ext) = core.agent.as_mut() {
            ext.cache_tag = Some(cache);
        }
    }
    runtime.publish(node.id);
    debug!(agent = %agent_name, node = node.id, ?cache, "agent loop starting");

    let tools: Vec<ToolDef> = node
        .spec
        .uses()
        .iter()
        .map(|spec| ToolDef::from_spec(spec))
        .collect();

    let mut session = match runtime
        .factory
        .open(&node.spec, system, seed, tools, provider)
    {
        Ok(session) => session,
        Err(err) => {
            let fault = provider_fault(provider, &agent_name, node.id, err);
            runtime.complete(&node, Err(fault));
            return;
        }
    };
    sync_transcript(&node, session.as_ref());

    let mut stats = ToolCallStats::default();
    let outcome = drive(
        &runtime,
        &node,
        &ctx,
        provider,
        session.as_mut(),
        cache,
        &agent_name,
        &mut stats,
    )
    .await;

    runtime.history.record(
        &agent_name,
        RunStats {
            tool_calls: stats.calls,
            mean_gap: stats.mean_gap(),
        },
    );
    runtime.complete(&node, outcome.map(CodeOutcome::Value));
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    runtime: &Arc<RuntimeInner>,
    node: &Arc<Node>,
    ctx: &RunCtx,
    provider: ProviderKind,
    session: &mut dyn ProviderSession,
    cache: CacheTag,
    agent_name: &str,
    stats: &mut ToolCallStats,
) -> Result<Value, Fault> {
    let mut cycles = 0u32;
    loop {
        cycles += 1;
        if cycles > runtime.config.max_request_cycles {
            return Err(Fault::Provider {
                provider: provider.name().to_string(),
                agent: agent_name.to_string(),
                node: node.id,
                message: format!(
                    "request cycle limit ({}) exceeded",
                    runtime.config.max_request_cycles
                ),
                source: None,
            });
        }

        // The lease is inherited tree-wide; re-acquire only if a courteous
        // tool released it.
        if !node.lease.holds(provider.name()) {
            let semaphore = runtime.semaphore(provider);
            match semaphore.acquire_owned().await {
                Ok(permit) => node.lease.put(provider.name(), permit),
                Err(_) => {
                    return Err(Fault::Provider {
                        provider: provider.name().to_string(),
                        agent: agent_name.to_string(),
                        node: node.id,
                        message: "model-api semaphore closed".to_string(),
                        source: None,
                    });
                }
            }
        }

        let turn = match submit_with_retry(session, cache, agent_name).await {
            Ok(turn) => turn,
            Err(err) => return Err(provider_fault(provider, agent_name, node.id, err)),
        };

        {
            let mut core = node.core.lock().expect("node core lock poisoned");
            if let Some(ext) = core.agent.as_mut() {
                ext.usage.absorb(&turn.usage);
            }
        }
        sync_transcript(node, session);
        runtime.publish(node.id);

        if turn.requests.is_empty() {
            return match turn.text {
                Some(text) => Ok(Value::String(text)),
                None => Err(Fault::Provider {
                    provider: provider.name().to_string(),
                    agent: agent_name.to_string(),
                    node: node.id,
                    message: "response contained neither tool use nor text".to_string(),
                    source: None,
                }),
            };
        }

        // Attempt the whole batch before honoring any raise sentinel.
        let mut entries = Vec::with_capacity(turn.requests.len());
        let mut raise: Option<String> = None;
        for request in &turn.requests {
            stats.record(Instant::now());
            let (entry, signal) = dispatch_tool(ctx, node, provider, request).await;
            entries.push(entry);
            if raise.is_none() {
                raise = signal;
            }
        }
        session.record_tool_results(&entries);
        sync_transcript(node, session);
        runtime.publish(node.id);

        if let Some(message) = raise {
            return Err(Fault::Agent {
                agent: agent_name.to_string(),
                node: node.id,
                message,
            });
        }
    }
}

async fn submit_with_retry(
    session: &mut dyn ProviderSession,
    cache: CacheTag,
    agent_name: &str,
) -> Result<crate::provider::ModelTurn, WireError> {
    let mut attempt = 0;
    loop {
        match session.step(cache).await {
            Ok(turn) => return Ok(turn),
            Err(err) if err.is_transient() && attempt < RETRY_DELAYS.len() => {
                let delay = RETRY_DELAYS[attempt];
                attempt += 1;
                warn!(
                    agent = %agent_name,
                    attempt,
                    delay_secs = delay.as_secs(),
                    %err,
                    "transient provider error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn dispatch_tool(
    ctx: &RunCtx,
    node: &Arc<Node>,
    provider: ProviderKind,
    request: &ToolRequest,
) -> (ToolResultEntry, Option<String>) {
    let entry = |payload: String, is_error: bool| ToolResultEntry {
        id: request.id.clone(),
        payload,
        is_error,
    };

    let Some(spec) = node
        .spec
        .uses()
        .iter()
        .find(|spec| spec.name() == request.name)
    else {
        return (
            entry(format!("ArgError: unknown tool `{}`", request.name), true),
            None,
        );
    };

    let args = match coerce_args(spec, &request.args) {
        Ok(args) => args,
        Err(message) => return (entry(format!("ArgError: {message}"), true), None),
    };

    let handle = match ctx.invoke_with(spec, args, Some(provider)).await {
        Ok(handle) => handle,
        Err(err) => return (entry(render_error(&err), true), None),
    };

    match handle.result().await {
        Ok(value) => {
            let signal = handle.raise_signal();
            let payload = match value {
                Value::String(text) => text,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (entry(payload, false), signal)
        }
        Err(Error::Fault(fault)) => (entry(fault.concise(), true), None),
        Err(err) => (entry(render_error(&err), true), None),
    }
}

/// Coerces the model's raw JSON arguments into typed values per the
/// tool's declared schema.
fn coerce_args(spec: &FunctionSpec, raw: &Value) -> Result<Args, String> {
    let Some(object) = raw.as_object() else {
        return Err("tool arguments must be a JSON object".to_string());
    };
    let mut args = Args::new();
    for field in spec.schema().fields() {
        let Some(value) = object.get(&field.name) else {
            return Err(format!("missing required field `{}`", field.name));
        };
        let Some(coerced) = ArgValue::from_json(field.ty, value) else {
            return Err(format!("field `{}` must be {}", field.name, field.ty));
        };
        args.insert(field.name.clone(), coerced);
    }
    for key in object.keys() {
        if spec.schema().field(key).is_none() {
            return Err(format!("unknown field `{key}`"));
        }
    }
    Ok(args)
}

fn render_error(err: &Error) -> String {
    match err {
        Error::Fault(fault) => fault.concise(),
        Error::Arg(err) => format!("ArgError: {err}"),
        Error::Session(err) => format!("SessionError: {err}"),
        Error::Spec(err) => format!("SpecError: {err}"),
        other => format!("Error: {other}"),
    }
}

fn provider_fault(provider: ProviderKind, agent: &str, node: u64, err: WireError) -> Fault {
    Fault::Provider {
        provider: provider.name().to_string(),
        agent: agent.to_string(),
        node,
        message: err.to_string(),
        source: Some(Arc::new(err)),
    }
}

fn sync_transcript(node: &Node, session: &dyn ProviderSession) {
    let parts = session.transcript();
    let mut core = node.core.lock().expect("node core lock poisoned");
    if let Some(ext) = core.agent.as_mut() {
        ext.transcript = parts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ArgType, CodeOutcome, FunctionSpec, RAISE_ERROR};

    fn leaf_tool(name: &str) -> Arc<FunctionSpec> {
        FunctionSpec::code(name, "a leaf")
            .arg("text", ArgType::Str, "payload")
            .handler(|_ctx, _args| async move { Ok(CodeOutcome::Value(Value::Null)) })
            .build()
            .expect("spec builds")
    }

    fn hook_tool() -> Arc<FunctionSpec> {
        FunctionSpec::code("ask_human", "wait for a person")
            .arg("question", ArgType::Str, "what to ask")
            .interactive(true)
            .handler(|_ctx, _args| async move { Ok(CodeOutcome::Value(Value::Null)) })
            .build()
            .expect("spec builds")
    }

    fn agent_with(uses: Vec<Arc<FunctionSpec>>) -> Arc<FunctionSpec> {
        FunctionSpec::agent("worker", "does things")
            .input("goal", ArgType::Str, "the goal")
            .system_template("You work.")
            .user_template("Goal: {goal}")
            .uses(uses)
            .build()
            .expect("spec builds")
    }

    #[test]
    fn no_tools_means_no_watermark() {
        let history = SpecHistory::default();
        let spec = agent_with(Vec::new());
        assert_eq!(decide_cache_tag(&spec, &history), CacheTag::None);
    }

    #[test]
    fn leaf_only_tools_get_five_minutes() {
        let history = SpecHistory::default();
        let spec = agent_with(vec![leaf_tool("echo"), leaf_tool("add")]);
        assert_eq!(decide_cache_tag(&spec, &history), CacheTag::FiveMinutes);
    }

    #[test]
    fn interactive_hook_disqualifies_five_minutes() {
        let history = SpecHistory::default();
        let spec = agent_with(vec![leaf_tool("echo"), hook_tool()]);
        assert_eq!(decide_cache_tag(&spec, &history), CacheTag::None);
    }

    #[test]
    fn busy_history_upgrades_branching_agents_to_one_hour() {
        let history = SpecHistory::default();
        let sub_agent = agent_with(vec![leaf_tool("echo")]);
        let planner = FunctionSpec::agent("planner", "delegates")
            .input("goal", ArgType::Str, "the goal")
            .uses([sub_agent])
            .build()
            .expect("spec builds");

        // No history yet: branching tools fall back to no watermark.
        assert_eq!(decide_cache_tag(&planner, &history), CacheTag::None);

        for _ in 0..5 {
            history.record(
                "planner",
                RunStats {
                    tool_calls: 3,
                    mean_gap: Some(Duration::from_secs(120)),
                },
            );
        }
        assert_eq!(decide_cache_tag(&planner, &history), CacheTag::OneHour);
    }

    #[test]
    fn slow_history_stays_unmarked() {
        let history = SpecHistory::default();
        let sub_agent = agent_with(vec![leaf_tool("echo")]);
        let planner = FunctionSpec::agent("slow_planner", "delegates")
            .input("goal", ArgType::Str, "the goal")
            .uses([sub_agent])
            .build()
            .expect("spec builds");

        for _ in 0..5 {
            history.record(
                "slow_planner",
                RunStats {
                    tool_calls: 4,
                    mean_gap: Some(Duration::from_secs(2 * 3600)),
                },
            );
        }
        assert_eq!(decide_cache_tag(&planner, &history), CacheTag::None);
    }

    #[test]
    fn history_window_is_capped_at_five() {
        let history = SpecHistory::default();
        for calls in 0..12u32 {
            history.record(
                "w",
                RunStats {
                    tool_calls: calls,
                    mean_gap: None,
                },
            );
        }
        let (mean_calls, _) = history.mean_calls_and_gap("w").expect("stats exist");
        // Only runs 7..=11 remain.
        assert_eq!(mean_calls, 9.0);
    }

    #[test]
    fn coerce_args_types_the_model_payload() {
        let spec = FunctionSpec::code("add", "adds")
            .arg("a", ArgType::Int, "left")
            .arg("b", ArgType::Int, "right")
            .handler(|_ctx, _args| async move { Ok(CodeOutcome::Value(Value::Null)) })
            .build()
            .expect("spec builds");

        let args = coerce_args(&spec, &serde_json::json!({"a": 2, "b": 3})).expect("coerces");
        assert_eq!(args["a"], ArgValue::Int(2));

        let err = coerce_args(&spec, &serde_json::json!({"a": "two", "b": 3}))
            .expect_err("type mismatch");
        assert!(err.contains("must be integer"));

        let err =
            coerce_args(&spec, &serde_json::json!({"a": 1, "b": 2, "c": 3})).expect_err("extra");
        assert!(err.contains("unknown field"));
    }

    #[test]
    fn raise_spec_is_recognizable_in_uses() {
        let spec = agent_with(vec![crate::spec::raise_error_spec()]);
        assert!(spec.uses().iter().any(|s| s.name() == RAISE_ERROR));
    }
}
