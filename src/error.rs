use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::spec::ArgType;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("function spec name must not be empty")]
    EmptyName,
    #[error("duplicate argument `{arg}` in spec `{spec}`")]
    DuplicateArg { spec: String, arg: String },
    #[error("two distinct specs registered under the name `{0}`")]
    DuplicateName(String),
    #[error("spec `{0}` is not registered with this runtime")]
    Unregistered(String),
    #[error("code spec `{0}` has no handler")]
    MissingHandler(String),
}

#[derive(Debug, Error)]
pub enum ArgError {
    #[error("missing argument `{name}` for `{spec}`")]
    Missing { spec: String, name: String },
    #[error("argument `{name}` for `{spec}` must be {expected}, got {got}")]
    TypeMismatch {
        spec: String,
        name: String,
        expected: ArgType,
        got: String,
    },
    #[error("argument `{name}` is not declared by `{spec}`")]
    Undeclared { spec: String, name: String },
    #[error("prompt template of `{spec}` references undeclared variable `{name}`")]
    UnresolvedPlaceholder { spec: String, name: String },
    #[error("failed to read input file `{path}` for `{spec}.{name}`: {source}")]
    InputFile {
        spec: String,
        name: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("top-level invocations have no parent session scope")]
    NoParentScope,
    #[error("this context is not bound to an invocation and has no session bags")]
    Unbound,
    #[error("session entry {namespace}/{key} holds a different type")]
    TypeMismatch { namespace: String, key: String },
}

/// Errors from the provider wire layer. `is_transient` drives the bounded
/// backoff inside the agent loop; everything else escapes immediately.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider overloaded: {0}")]
    Overloaded(String),
    #[error("request failed ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Decode(String),
}

impl WireError {
    pub fn is_transient(&self) -> bool {
        match self {
            WireError::RateLimited(_) | WireError::Overloaded(_) | WireError::Transport(_) => true,
            WireError::Api { status, .. } => *status >= 500,
            WireError::Auth(_) | WireError::Decode(_) => false,
        }
    }
}

/// Terminal exception stored on a failed node and rethrown by
/// [`NodeHandle::result`](crate::node::NodeHandle::result).
///
/// Two fault kinds carry the design weight: `Agent` is the model's own
/// declared failure (via the built-in `raise_error` function) and
/// `Provider` is anything infrastructural that escaped an agent's loop.
/// `Code` wraps domain errors raised by code callables, surfaced unchanged.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    #[error("agent `{agent}` (node {node}) raised: {message}")]
    Agent {
        agent: String,
        node: u64,
        message: String,
    },
    #[error("provider {provider} failed in agent `{agent}` (node {node}): {message}")]
    Provider {
        provider: String,
        agent: String,
        node: u64,
        message: String,
        source: Option<Arc<WireError>>,
    },
    #[error("`{spec}` (node {node}) failed: {message}")]
    Code {
        spec: String,
        node: u64,
        message: String,
    },
}

impl Fault {
    /// Short `Kind: message` rendering for tool results and view summaries.
    /// No backtraces, no node ids; the model only needs the cause.
    pub fn concise(&self) -> String {
        match self {
            Fault::Agent { message, .. } => format!("AgentFault: {message}"),
            Fault::Provider {
                provider, message, ..
            } => format!("ProviderFault[{provider}]: {message}"),
            Fault::Code { message, .. } => format!("CodeFault: {message}"),
        }
    }

    pub fn wire(&self) -> Option<&WireError> {
        match self {
            Fault::Provider { source, .. } => source.as_deref(),
            _ => None,
        }
    }
}

/// Error returned by code callables. Domain failures use `Execution`;
/// framework errors from child invocations convert via `From<Error>` so
/// a callable can `?` straight through `result()`.
#[derive(Debug, Error)]
pub enum CodeError {
    #[error("{0}")]
    Execution(String),
    #[error(transparent)]
    Arg(#[from] ArgError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Framework(Box<Error>),
}

impl CodeError {
    pub fn execution(message: impl Into<String>) -> Self {
        CodeError::Execution(message.into())
    }
}

impl From<Error> for CodeError {
    fn from(err: Error) -> Self {
        CodeError::Framework(Box::new(err))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Arg(#[from] ArgError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("unknown node id: {0}")]
    UnknownNode(u64),
    #[error("node {0} is not a top-level invocation")]
    NotTopLevel(u64),
    #[error("the runtime behind this handle has been dropped")]
    RuntimeShutdown,
}
