use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{ArgError, CodeError, SpecError};
use crate::runtime::RunCtx;

/// The four primitive argument types a function schema may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ArgType {
    Str,
    Int,
    Float,
    Bool,
}

impl ArgType {
    fn json_type(&self) -> &'static str {
        match self {
            ArgType::Str => "string",
            ArgType::Int => "integer",
            ArgType::Float => "number",
            ArgType::Bool => "boolean",
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.json_type())
    }
}

/// A tagged argument value matching one of the four [`ArgType`]s.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ArgValue {
    pub fn type_of(&self) -> ArgType {
        match self {
            ArgValue::Str(_) => ArgType::Str,
            ArgValue::Int(_) => ArgType::Int,
            ArgValue::Float(_) => ArgType::Float,
            ArgValue::Bool(_) => ArgType::Bool,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(x) => Some(*x),
            ArgValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ArgValue::Str(s) => Value::String(s.clone()),
            ArgValue::Int(n) => json!(n),
            ArgValue::Float(x) => json!(x),
            ArgValue::Bool(b) => Value::Bool(*b),
        }
    }

    /// Coerces a JSON value into the declared type. Used when the model
    /// supplies tool arguments as raw JSON.
    pub fn from_json(ty: ArgType, value: &Value) -> Option<ArgValue> {
        match ty {
            ArgType::Str => value.as_str().map(|s| ArgValue::Str(s.to_string())),
            ArgType::Int => value.as_i64().map(ArgValue::Int),
            ArgType::Float => value.as_f64().map(ArgValue::Float),
            ArgType::Bool => value.as_bool().map(ArgValue::Bool),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Str(s) => f.write_str(s),
            ArgValue::Int(n) => write!(f, "{n}"),
            ArgValue::Float(x) => write!(f, "{x}"),
            ArgValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Str(s)
    }
}

impl From<i64> for ArgValue {
    fn from(n: i64) -> Self {
        ArgValue::Int(n)
    }
}

impl From<f64> for ArgValue {
    fn from(x: f64) -> Self {
        ArgValue::Float(x)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Bool(b)
    }
}

/// Named argument map handed to `invoke`.
pub type Args = HashMap<String, ArgValue>;

#[derive(Clone, Debug)]
pub struct ArgField {
    pub name: String,
    pub ty: ArgType,
    pub description: String,
}

/// Ordered argument schema. Field order is declaration order; names are
/// unique within a spec.
#[derive(Clone, Debug, Default)]
pub struct ArgSchema {
    fields: Vec<ArgField>,
}

impl ArgSchema {
    pub fn fields(&self) -> &[ArgField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&ArgField> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn push(&mut self, field: ArgField) {
        self.fields.push(field);
    }

    fn validate_decl(&self, spec: &str) -> Result<(), SpecError> {
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SpecError::DuplicateArg {
                    spec: spec.to_string(),
                    arg: field.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Every declared field present and type-correct, no undeclared keys.
    pub fn validate_args(&self, spec: &str, args: &Args) -> Result<(), ArgError> {
        for field in &self.fields {
            let Some(value) = args.get(&field.name) else {
                return Err(ArgError::Missing {
                    spec: spec.to_string(),
                    name: field.name.clone(),
                });
            };
            if value.type_of() != field.ty
                && !(field.ty == ArgType::Float && value.type_of() == ArgType::Int)
            {
                return Err(ArgError::TypeMismatch {
                    spec: spec.to_string(),
                    name: field.name.clone(),
                    expected: field.ty,
                    got: value.type_of().to_string(),
                });
            }
        }
        for name in args.keys() {
            if self.field(name).is_none() {
                return Err(ArgError::Undeclared {
                    spec: spec.to_string(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// JSON-schema rendering advertised to the model as a tool signature.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            properties.insert(
                field.name.clone(),
                json!({
                    "type": field.ty.json_type(),
                    "description": field.description.as_str(),
                }),
            );
            required.push(Value::String(field.name.clone()));
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// What a code callable hands back: a plain value, or the raise sentinel
/// emitted by the built-in `raise_error` function. The agent loop inspects
/// tool-result batches for the sentinel instead of catching exceptions
/// across task boundaries.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeOutcome {
    Value(Value),
    Raise(String),
}

pub type CodeFn =
    Arc<dyn Fn(RunCtx, Args) -> BoxFuture<'static, Result<CodeOutcome, CodeError>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SpecKind {
    Code,
    Agent,
}

/// How an agent input variable is resolved before prompt substitution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    /// Substitute the argument's literal rendering.
    Literal,
    /// Treat the argument as a path; read the file to a string at
    /// invocation time and substitute its contents.
    Filepath,
}

pub(crate) enum SpecBody {
    Code {
        callable: CodeFn,
        interactive: bool,
    },
    Agent {
        system_template: String,
        user_template: String,
        input_kinds: HashMap<String, InputKind>,
        model: Option<String>,
    },
}

impl fmt::Debug for SpecBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecBody::Code { interactive, .. } => f
                .debug_struct("Code")
                .field("interactive", interactive)
                .finish_non_exhaustive(),
            SpecBody::Agent {
                system_template,
                user_template,
                model,
                ..
            } => f
                .debug_struct("Agent")
                .field("system_template", system_template)
                .field("user_template", user_template)
                .field("model", model)
                .finish_non_exhaustive(),
        }
    }
}

/// Immutable description of an invocable unit: either a deterministic code
/// callable or an LLM-driven agent. Specs are constructed through
/// [`FunctionSpec::code`] / [`FunctionSpec::agent`] and passed around as
/// `Arc<FunctionSpec>`; identity is pointer identity.
#[derive(Debug)]
pub struct FunctionSpec {
    name: String,
    description: String,
    schema: ArgSchema,
    uses: Vec<Arc<FunctionSpec>>,
    body: SpecBody,
}

impl FunctionSpec {
    pub fn code(name: impl Into<String>, description: impl Into<String>) -> CodeSpecBuilder {
        CodeSpecBuilder {
            name: name.into(),
            description: description.into(),
            schema: ArgSchema::default(),
            uses: Vec::new(),
            callable: None,
            interactive: false,
        }
    }

    pub fn agent(name: impl Into<String>, description: impl Into<String>) -> AgentSpecBuilder {
        AgentSpecBuilder {
            name: name.into(),
            description: description.into(),
            schema: ArgSchema::default(),
            input_kinds: HashMap::new(),
            uses: Vec::new(),
            system_template: String::new(),
            user_template: String::new(),
            model: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema(&self) -> &ArgSchema {
        &self.schema
    }

    pub fn uses(&self) -> &[Arc<FunctionSpec>] {
        &self.uses
    }

    pub fn kind(&self) -> SpecKind {
        match self.body {
            SpecBody::Code { .. } => SpecKind::Code,
            SpecBody::Agent { .. } => SpecKind::Agent,
        }
    }

    /// True for code specs flagged as long-blocking human-in-the-loop
    /// hooks. Affects the cache-watermark decision of agents using them.
    pub fn interactive(&self) -> bool {
        matches!(self.body, SpecBody::Code { interactive, .. } if interactive)
    }

    pub(crate) fn body(&self) -> &SpecBody {
        &self.body
    }

    pub(crate) fn callable(&self) -> Option<CodeFn> {
        match &self.body {
            SpecBody::Code { callable, .. } => Some(callable.clone()),
            SpecBody::Agent { .. } => None,
        }
    }

    pub(crate) fn input_kind(&self, name: &str) -> InputKind {
        match &self.body {
            SpecBody::Agent { input_kinds, .. } => input_kinds
                .get(name)
                .copied()
                .unwrap_or(InputKind::Literal),
            SpecBody::Code { .. } => InputKind::Literal,
        }
    }

    pub(crate) fn model_hint(&self) -> Option<&str> {
        match &self.body {
            SpecBody::Agent { model, .. } => model.as_deref(),
            SpecBody::Code { .. } => None,
        }
    }
}

pub struct CodeSpecBuilder {
    name: String,
    description: String,
    schema: ArgSchema,
    uses: Vec<Arc<FunctionSpec>>,
    callable: Option<CodeFn>,
    interactive: bool,
}

impl CodeSpecBuilder {
    pub fn arg(
        mut self,
        name: impl Into<String>,
        ty: ArgType,
        description: impl Into<String>,
    ) -> Self {
        self.schema.push(ArgField {
            name: name.into(),
            ty,
            description: description.into(),
        });
        self
    }

    pub fn uses(mut self, specs: impl IntoIterator<Item = Arc<FunctionSpec>>) -> Self {
        self.uses.extend(specs);
        self
    }

    /// Marks this callable as a long-blocking human-in-the-loop hook.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RunCtx, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CodeOutcome, CodeError>> + Send + 'static,
    {
        self.callable = Some(Arc::new(move |ctx, args| Box::pin(handler(ctx, args))));
        self
    }

    pub fn build(self) -> Result<Arc<FunctionSpec>, SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        self.schema.validate_decl(&self.name)?;
        let Some(callable) = self.callable else {
            return Err(SpecError::MissingHandler(self.name));
        };
        Ok(Arc::new(FunctionSpec {
            name: self.name,
            description: self.description,
            schema: self.schema,
            uses: self.uses,
            body: SpecBody::Code {
                callable,
                interactive: self.interactive,
            },
        }))
    }
}

pub struct AgentSpecBuilder {
    name: String,
    description: String,
    schema: ArgSchema,
    input_kinds: HashMap<String, InputKind>,
    uses: Vec<Arc<FunctionSpec>>,
    system_template: String,
    user_template: String,
    model: Option<String>,
}

impl AgentSpecBuilder {
    /// Declares a literal input variable.
    pub fn input(
        self,
        name: impl Into<String>,
        ty: ArgType,
        description: impl Into<String>,
    ) -> Self {
        self.input_with_kind(name, ty, description, InputKind::Literal)
    }

    /// Declares an input variable whose argument is a file path read at
    /// invocation time.
    pub fn file_input(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.input_with_kind(name, ArgType::Str, description, InputKind::Filepath)
    }

    fn input_with_kind(
        mut self,
        name: impl Into<String>,
        ty: ArgType,
        description: impl Into<String>,
        kind: InputKind,
    ) -> Self {
        let name = name.into();
        self.input_kinds.insert(name.clone(), kind);
        self.schema.push(ArgField {
            name,
            ty,
            description: description.into(),
        });
        self
    }

    pub fn system_template(mut self, template: impl Into<String>) -> Self {
        self.system_template = template.into();
        self
    }

    pub fn user_template(mut self, template: impl Into<String>) -> Self {
        self.user_template = template.into();
        self
    }

    pub fn uses(mut self, specs: impl IntoIterator<Item = Arc<FunctionSpec>>) -> Self {
        self.uses.extend(specs);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn build(self) -> Result<Arc<FunctionSpec>, SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        self.schema.validate_decl(&self.name)?;
        Ok(Arc::new(FunctionSpec {
            name: self.name,
            description: self.description,
            schema: self.schema,
            uses: self.uses,
            body: SpecBody::Agent {
                system_template: self.system_template,
                user_template: self.user_template,
                input_kinds: self.input_kinds,
                model: self.model,
            },
        }))
    }
}

/// Name of the built-in failure-declaration function agents may list in
/// their `uses`.
pub const RAISE_ERROR: &str = "raise_error";

/// The built-in spec whose invocation signals an agent-declared failure.
/// The callable emits the raise sentinel; the agent loop honors it after
/// the surrounding tool batch completes.
pub fn raise_error_spec() -> Arc<FunctionSpec> {
    let callable: CodeFn = Arc::new(|_ctx, args: Args| {
        Box::pin(async move {
            let msg = args
                .get("msg")
                .and_then(ArgValue::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(CodeOutcome::Raise(msg))
        })
    });
    let mut schema = ArgSchema::default();
    schema.push(ArgField {
        name: "msg".to_string(),
        ty: ArgType::Str,
        description: "Why the task cannot be completed.".to_string(),
    });
    Arc::new(FunctionSpec {
        name: RAISE_ERROR.to_string(),
        description: "Declare that the task has failed and stop. \
                      Use only when no recovery is possible."
            .to_string(),
        schema,
        uses: Vec::new(),
        body: SpecBody::Code {
            callable,
            interactive: false,
        },
    })
}

/// Breadth-first closure over `uses`. Re-encountering the same `Arc` is
/// idempotent; a different instance under a taken name is rejected.
pub(crate) fn closure(
    seed: &[Arc<FunctionSpec>],
) -> Result<HashMap<String, Arc<FunctionSpec>>, SpecError> {
    let mut registry: HashMap<String, Arc<FunctionSpec>> = HashMap::new();
    let mut queue: VecDeque<Arc<FunctionSpec>> = seed.iter().cloned().collect();
    while let Some(spec) = queue.pop_front() {
        match registry.get(spec.name()) {
            Some(existing) if Arc::ptr_eq(existing, &spec) => continue,
            Some(_) => return Err(SpecError::DuplicateName(spec.name().to_string())),
            None => {
                queue.extend(spec.uses().iter().cloned());
                registry.insert(spec.name().to_string(), spec);
            }
        }
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_spec() -> Arc<FunctionSpec> {
        FunctionSpec::code("echo", "echo text back")
            .arg("text", ArgType::Str, "text to echo")
            .handler(|_ctx, args| async move {
                let text = args
                    .get("text")
                    .and_then(ArgValue::as_str)
                    .ok_or_else(|| CodeError::execution("text missing"))?
                    .to_string();
                Ok(CodeOutcome::Value(Value::String(text)))
            })
            .build()
            .expect("spec builds")
    }

    #[test]
    fn duplicate_arg_names_rejected() {
        let result = FunctionSpec::code("bad", "bad")
            .arg("x", ArgType::Int, "first")
            .arg("x", ArgType::Str, "again")
            .handler(|_ctx, _args| async move { Ok(CodeOutcome::Value(Value::Null)) })
            .build();
        assert!(matches!(result, Err(SpecError::DuplicateArg { .. })));
    }

    #[test]
    fn code_spec_requires_handler() {
        let result = FunctionSpec::code("nohandler", "no body").build();
        assert!(matches!(result, Err(SpecError::MissingHandler(_))));
    }

    #[test]
    fn validate_args_reports_missing_and_mismatch() {
        let spec = echo_spec();
        let err = spec
            .schema()
            .validate_args(spec.name(), &Args::new())
            .expect_err("missing must fail");
        assert!(matches!(err, ArgError::Missing { .. }));

        let args = Args::from([("text".to_string(), ArgValue::Int(7))]);
        let err = spec
            .schema()
            .validate_args(spec.name(), &args)
            .expect_err("mismatch must fail");
        assert!(matches!(err, ArgError::TypeMismatch { .. }));
    }

    #[test]
    fn validate_args_rejects_undeclared_keys() {
        let spec = echo_spec();
        let args = Args::from([
            ("text".to_string(), ArgValue::from("hi")),
            ("extra".to_string(), ArgValue::Bool(true)),
        ]);
        let err = spec
            .schema()
            .validate_args(spec.name(), &args)
            .expect_err("undeclared must fail");
        assert!(matches!(err, ArgError::Undeclared { .. }));
    }

    #[test]
    fn int_coerces_into_float_slot() {
        let spec = FunctionSpec::code("scale", "scale a value")
            .arg("factor", ArgType::Float, "scale factor")
            .handler(|_ctx, _args| async move { Ok(CodeOutcome::Value(Value::Null)) })
            .build()
            .expect("spec builds");
        let args = Args::from([("factor".to_string(), ArgValue::Int(2))]);
        spec.schema()
            .validate_args(spec.name(), &args)
            .expect("int accepted for float");
    }

    #[test]
    fn closure_pulls_transitive_uses() {
        let leaf = echo_spec();
        let mid = FunctionSpec::agent("mid", "delegates")
            .input("goal", ArgType::Str, "the goal")
            .system_template("You delegate.")
            .user_template("Goal: {goal}")
            .uses([leaf.clone()])
            .build()
            .expect("spec builds");
        let top = FunctionSpec::agent("top", "plans")
            .input("goal", ArgType::Str, "the goal")
            .system_template("You plan.")
            .user_template("Goal: {goal}")
            .uses([mid.clone(), raise_error_spec()])
            .build()
            .expect("spec builds");

        let registry = closure(&[top.clone()]).expect("closure builds");
        assert_eq!(registry.len(), 4);
        assert!(Arc::ptr_eq(&registry["echo"], &leaf));
        assert!(Arc::ptr_eq(&registry["mid"], &mid));
        assert!(registry.contains_key(RAISE_ERROR));
    }

    #[test]
    fn closure_of_closure_is_identity() {
        let leaf = echo_spec();
        let top = FunctionSpec::agent("top", "plans")
            .input("goal", ArgType::Str, "the goal")
            .uses([leaf.clone()])
            .build()
            .expect("spec builds");

        let direct = closure(&[top.clone()]).expect("closure builds");
        let mut seed: Vec<_> = direct.values().cloned().collect();
        seed.sort_by(|a, b| a.name().cmp(b.name()));
        let again = closure(&seed).expect("closure of closure builds");
        assert_eq!(direct.len(), again.len());
        for (name, spec) in &direct {
            assert!(Arc::ptr_eq(spec, &again[name]));
        }
    }

    #[test]
    fn same_name_different_instance_rejected() {
        let a = echo_spec();
        let b = echo_spec();
        let err = closure(&[a, b]).expect_err("distinct instances must clash");
        assert!(matches!(err, SpecError::DuplicateName(name) if name == "echo"));
    }

    #[test]
    fn schema_renders_json_for_the_model() {
        let spec = echo_spec();
        let schema = spec.schema().to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["text"]["type"], "string");
        assert_eq!(schema["required"][0], "text");
        assert_eq!(schema["additionalProperties"], false);
    }
}
