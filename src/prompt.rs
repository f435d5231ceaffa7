use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::ArgError;
use crate::spec::{Args, FunctionSpec, InputKind};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern compiles")
});

/// Resolves an agent's input variables to substitution strings. Literal
/// variables use their display rendering; filepath variables are read to a
/// string now, so the prompt carries the file contents as of invocation.
pub(crate) async fn resolve_inputs(
    spec: &FunctionSpec,
    args: &Args,
) -> Result<HashMap<String, String>, ArgError> {
    let mut resolved = HashMap::new();
    for field in spec.schema().fields() {
        let Some(value) = args.get(&field.name) else {
            continue;
        };
        let rendered = match spec.input_kind(&field.name) {
            InputKind::Literal => value.to_string(),
            InputKind::Filepath => {
                let path = PathBuf::from(value.to_string());
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ArgError::InputFile {
                        spec: spec.name().to_string(),
                        name: field.name.clone(),
                        path,
                        source,
                    })?
            }
        };
        resolved.insert(field.name.clone(), rendered);
    }
    Ok(resolved)
}

/// Substitutes `{name}` placeholders; `{{` and `}}` escape literal braces.
/// A placeholder naming a variable outside the resolved set is an argument
/// error. Pure in (template, vars).
pub(crate) fn render(
    spec: &str,
    template: &str,
    vars: &HashMap<String, String>,
) -> Result<String, ArgError> {
    let mut unresolved = None;
    let out = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        match caps.get(0).map(|m| m.as_str()) {
            Some("{{") => "{".to_string(),
            Some("}}") => "}".to_string(),
            _ => {
                let name = &caps[1];
                match vars.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        if unresolved.is_none() {
                            unresolved = Some(name.to_string());
                        }
                        String::new()
                    }
                }
            }
        }
    });
    if let Some(name) = unresolved {
        return Err(ArgError::UnresolvedPlaceholder {
            spec: spec.to_string(),
            name,
        });
    }
    Ok(out.into_owned())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::spec::{ArgType, ArgValue, FunctionSpec};

    #[test]
    fn render_substitutes_named_variables() {
        let vars = HashMap::from([
            ("goal".to_string(), "ship it".to_string()),
            ("count".to_string(), "3".to_string()),
        ]);
        let out = render("planner", "Do {goal} in {count} steps.", &vars).expect("renders");
        assert_eq!(out, "Do ship it in 3 steps.");
    }

    #[test]
    fn render_is_pure() {
        let vars = HashMap::from([("goal".to_string(), "x".to_string())]);
        let a = render("p", "Goal: {goal}", &vars).expect("renders");
        let b = render("p", "Goal: {goal}", &vars).expect("renders");
        assert_eq!(a, b);
    }

    #[test]
    fn escaped_braces_pass_through() {
        let vars = HashMap::from([("v".to_string(), "1".to_string())]);
        let out = render("p", "literal {{json}} and {v}", &vars).expect("renders");
        assert_eq!(out, "literal {json} and 1");
    }

    #[test]
    fn unknown_placeholder_is_an_arg_error() {
        let err = render("p", "Hello {missing}", &HashMap::new()).expect_err("must fail");
        assert!(matches!(
            err,
            ArgError::UnresolvedPlaceholder { name, .. } if name == "missing"
        ));
    }

    #[tokio::test]
    async fn filepath_inputs_read_at_invocation_time() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "contents from disk").expect("write temp");

        let spec = FunctionSpec::agent("reader", "reads a brief")
            .file_input("brief", "path to the brief")
            .input("goal", ArgType::Str, "the goal")
            .system_template("Brief: {brief}")
            .user_template("Goal: {goal}")
            .build()
            .expect("spec builds");

        let args = Args::from([
            (
                "brief".to_string(),
                ArgValue::from(file.path().to_string_lossy().to_string()),
            ),
            ("goal".to_string(), ArgValue::from("summarize")),
        ]);

        let vars = resolve_inputs(&spec, &args).await.expect("resolves");
        assert_eq!(vars["brief"], "contents from disk");
        assert_eq!(vars["goal"], "summarize");
    }

    #[tokio::test]
    async fn missing_input_file_is_an_arg_error() {
        let spec = FunctionSpec::agent("reader", "reads a brief")
            .file_input("brief", "path to the brief")
            .system_template("Brief: {brief}")
            .user_template("go")
            .build()
            .expect("spec builds");

        let args = Args::from([(
            "brief".to_string(),
            ArgValue::from("/definitely/not/a/real/path"),
        )]);
        let err = resolve_inputs(&spec, &args).await.expect_err("must fail");
        assert!(matches!(err, ArgError::InputFile { .. }));
    }
}
