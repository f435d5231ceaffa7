//! # functree-rs
//!
//! **Pure-Rust execution core for agent orchestration with explicit control flow.**
//! Deterministic code and LLM-driven agents are the same thing here: *functions*.
//! Declare specs, invoke them through a context, and the runtime grows a tree of
//! invocations you can join, inspect, and watch.
//!
//! ## Why this crate?
//! | Capability | `functree-rs` | Typical abstraction-heavy frameworks | Why this helps agents |
//! |---|---|---|---|
//! | Call model | One uniform `invoke` for code and agents ([`RunCtx::invoke`]) | Separate chains, planners, and executors | One mental model, one tree |
//! | Agent core | Explicit request cycle with verbatim transcript replay | Hidden prompt rewriting | Continuous reasoning across cycles, cache-friendly |
//! | Failure semantics | Agent-declared faults vs. provider faults ([`Fault`]) | One opaque error type | The model can fail on purpose; infrastructure cannot hide |
//! | Observation | Immutable versioned snapshots + `watch` ([`NodeView`]) | Callback soup | UIs never race the scheduler |
//! | Shared state | Scoped session bags ([`RunCtx::get_or_put`]) | Globals or thread-locals | Objects live exactly as long as their tree |
//!
//! ## Quickstart
//! ```rust,no_run
//! use functree_rs::{ArgType, ArgValue, Args, CodeOutcome, FunctionSpec, Runtime};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let add = FunctionSpec::code("add", "add two integers")
//!     .arg("a", ArgType::Int, "left operand")
//!     .arg("b", ArgType::Int, "right operand")
//!     .handler(|_ctx, args| async move {
//!         let a = args.get("a").and_then(ArgValue::as_int).unwrap_or(0);
//!         let b = args.get("b").and_then(ArgValue::as_int).unwrap_or(0);
//!         Ok(CodeOutcome::Value(json!(a + b)))
//!     })
//!     .build()?;
//!
//! let runtime = Runtime::builder().spec(add.clone()).build()?;
//! let args = Args::from([
//!     ("a".to_string(), ArgValue::Int(2)),
//!     ("b".to_string(), ArgValue::Int(3)),
//! ]);
//! let handle = runtime.ctx().invoke(&add, args).await?;
//! assert_eq!(handle.result().await?, json!(5));
//! # Ok(())
//! # }
//! ```
//!
//! ## Agents delegating to agents
//! ```rust,no_run
//! use functree_rs::{
//!     AnthropicConfig, ArgType, ArgValue, Args, FunctionSpec, Runtime, raise_error_spec,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = FunctionSpec::agent("worker", "Carries out one concrete task.")
//!     .input("task", ArgType::Str, "the task to carry out")
//!     .system_template("You are a careful worker.")
//!     .user_template("Do this: {task}")
//!     .build()?;
//!
//! let planner = FunctionSpec::agent("planner", "Breaks a goal into tasks.")
//!     .input("goal", ArgType::Str, "the overall goal")
//!     .file_input("brief", "path to a background brief")
//!     .system_template("You plan, then delegate.\n\nBackground:\n{brief}")
//!     .user_template("Goal: {goal}")
//!     .uses([worker, raise_error_spec()])
//!     .build()?;
//!
//! let runtime = Runtime::builder()
//!     .spec(planner.clone())
//!     .anthropic(AnthropicConfig::from_env("claude-sonnet-4-5")?)
//!     .build()?;
//!
//! let args = Args::from([
//!     ("goal".to_string(), ArgValue::from("ship the release")),
//!     ("brief".to_string(), ArgValue::from("notes/brief.md")),
//! ]);
//! let handle = runtime.ctx().invoke(&planner, args).await?;
//!
//! // Observe the tree while it runs; snapshots never block the scheduler.
//! let mut cursor = 0;
//! loop {
//!     let view = runtime.watch(handle.id(), cursor).await?;
//!     cursor = view.update_seqnum;
//!     println!("[v{cursor}] {} is {:?}", view.spec_name, view.state);
//!     if view.state.is_terminal() {
//!         break;
//!     }
//! }
//! println!("outputs: {}", handle.result().await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Evidence in this repository
//! - Invocation-tree semantics, watch ordering, and fault propagation: `src/runtime/tests.rs`
//! - Cache-watermark policy and transient-error backoff: `src/agent/mod.rs`
//! - Verbatim transcript replay and cache-marker placement: `src/provider/anthropic.rs`
//! - Session-bag scoping and atomic `get_or_put`: `src/session.rs`

/// Agent loop driver, cache-watermark policy, and completion history.
pub mod agent;
/// Error taxonomy: registration, arguments, sessions, wire, and faults.
pub mod error;
/// Invocation nodes, lifecycle states, and the join handle.
pub mod node;
mod prompt;
/// Provider seam and the Anthropic wire adapter.
pub mod provider;
/// The runtime, its builder, and the run context.
pub mod runtime;
/// Session bags and their scope aliases.
pub mod session;
/// Function specs, argument schemas, and registration closure.
pub mod spec;
/// Provider-neutral transcript parts and token accounting.
pub mod transcript;
/// Immutable node snapshots.
pub mod view;

/// Cache-watermark tag frozen per agent invocation.
pub use agent::CacheTag;
/// Error values exposed by the runtime.
pub use error::{ArgError, CodeError, Error, Fault, SessionError, SpecError, WireError};
/// Node identity, lifecycle, and joining.
pub use node::{NodeHandle, NodeId, NodeState};
/// Provider interface and the Anthropic adapter.
pub use provider::{
    AnthropicConfig, AnthropicFactory, ModelTurn, ProviderKind, ProviderSession, SessionFactory,
    ToolDef, ToolRequest, ToolResultEntry,
};
/// Runtime API.
pub use runtime::{RunCtx, Runtime, RuntimeBuilder};
/// Session-bag primitives.
pub use session::{Scope, SessionBag};
/// Spec construction and argument primitives.
pub use spec::{
    AgentSpecBuilder, ArgField, ArgSchema, ArgType, ArgValue, Args, CodeOutcome, CodeSpecBuilder,
    FunctionSpec, InputKind, RAISE_ERROR, SpecKind, raise_error_spec,
};
/// Transcript and token-usage types.
pub use transcript::{Part, TokenUsage};
/// Snapshot types served to observers.
pub use view::{AgentView, NodeView};
