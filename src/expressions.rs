//! Expression façade: validate/evaluate/extract-vars dispatch across two dialects.
//!
//! Two delimiter-selected dialects are supported: a YAQL-flavored "native" dialect
//! wrapped in `<% ... %>`, and a Jinja dialect wrapped in `{{ ... }}`. Both expose the
//! reserved callables `ctx(name)`, `item()`, `result()`, `task_status(name)`. Neither
//! dialect's grammar is implemented from scratch here: the native dialect is evaluated
//! by `jaq` (a `jq` clone) after a small textual rewrite; the Jinja dialect is
//! evaluated directly by `minijinja`.

use regex::Regex;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashSet;
use std::sync::LazyLock;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{dialect} expression `{expression}` failed to evaluate: {cause}"))]
    Evaluation {
        dialect: Dialect,
        expression: String,
        cause: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single reported validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub expression: String,
    pub position: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// `<% ... %>`
    Native,
    /// `{{ ... }}`
    Jinja,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Dialect::Native => "native",
            Dialect::Jinja => "jinja",
        })
    }
}

static NATIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<%\s*(.*?)\s*%>").expect("static regex"));
static JINJA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{\s*(.*?)\s*\}\}").expect("static regex"));

static CTX_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ctx\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)").expect("static regex"));
static TASK_STATUS_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"task_status\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)").expect("static regex")
});
static IN_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(.*\S)\s+in\s+(\[.*\])$").expect("static regex"));
static BARE_IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("static regex"));

const RESERVED_WORDS: &[&str] = &[
    "ctx", "item", "result", "task_status", "in", "and", "or", "not", "true", "false", "null",
];

/// Find every expression fragment in `text`, tagged with its dialect, inner source,
/// and byte offset of the whole delimited fragment.
fn find_fragments(text: &str) -> Vec<(Dialect, regex::Match<'_>, &str)> {
    let mut out = Vec::new();
    for m in NATIVE_RE.find_iter(text) {
        let caps = NATIVE_RE.captures(m.as_str()).expect("matched");
        out.push((Dialect::Native, m, caps.get(1).map(|g| g.as_str()).unwrap_or("")));
    }
    for m in JINJA_RE.find_iter(text) {
        let caps = JINJA_RE.captures(m.as_str()).expect("matched");
        out.push((Dialect::Jinja, m, caps.get(1).map(|g| g.as_str()).unwrap_or("")));
    }
    out.sort_by_key(|(_, m, _)| m.start());
    out
}

#[must_use]
pub fn has_expression(text: &str) -> bool {
    NATIVE_RE.is_match(text) || JINJA_RE.is_match(text)
}

/// Validate every expression fragment in `text`; returns an empty list when the text
/// contains no expressions or every expression compiles cleanly.
#[must_use]
pub fn validate(text: &str) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (dialect, m, inner) in find_fragments(text) {
        if let Err(message) = compile_check(dialect, inner) {
            issues.push(ValidationIssue {
                expression: inner.to_string(),
                position: m.start(),
                message,
            });
        }
    }
    issues
}

fn compile_check(dialect: Dialect, inner: &str) -> std::result::Result<(), String> {
    match dialect {
        Dialect::Native => native_compile(&rewrite_native(inner)),
        Dialect::Jinja => {
            let env = minijinja::Environment::new();
            env.compile_expression(&rewrite_jinja(inner))
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
    }
}

/// Evaluate `text` against `context`. A string containing no expression is returned
/// unchanged. A string that is *exactly* one delimited expression (after trimming)
/// evaluates to that expression's native (typed) result. A string with embedded
/// expressions among literal text is rendered by substituting each fragment's
/// stringified value in place.
pub fn evaluate(text: &str, context: &Value) -> Result<Value> {
    let fragments = find_fragments(text);
    if fragments.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    let trimmed = text.trim();
    if fragments.len() == 1 {
        let (dialect, m, inner) = fragments[0];
        if m.as_str() == trimmed {
            return evaluate_inner(dialect, inner, context);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (dialect, m, inner) in fragments {
        out.push_str(&text[cursor..m.start()]);
        let value = evaluate_inner(dialect, inner, context)?;
        out.push_str(&stringify(&value));
        cursor = m.end();
    }
    out.push_str(&text[cursor..]);
    Ok(Value::String(out))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn evaluate_inner(dialect: Dialect, inner: &str, context: &Value) -> Result<Value> {
    match dialect {
        Dialect::Native => {
            let rewritten = rewrite_native(inner);
            native_eval(&rewritten, context).map_err(|cause| Error::Evaluation {
                dialect,
                expression: inner.to_string(),
                cause,
            })
        }
        Dialect::Jinja => {
            let rewritten = rewrite_jinja(inner);
            jinja_eval(&rewritten, context).map_err(|cause| Error::Evaluation {
                dialect,
                expression: inner.to_string(),
                cause,
            })
        }
    }
}

/// Extract the set of `ctx(name)`-referenced and bare-identifier variable names from
/// every expression fragment in `text`.
#[must_use]
pub fn extract_vars(text: &str) -> HashSet<String> {
    let mut vars = HashSet::new();
    for (_, _, inner) in find_fragments(text) {
        for caps in CTX_CALL_RE.captures_iter(inner) {
            vars.insert(caps[1].to_string());
        }
        for m in BARE_IDENT_RE.find_iter(inner) {
            let word = m.as_str();
            if RESERVED_WORDS.contains(&word) {
                continue;
            }
            // Skip identifiers immediately preceding '(' — those are calls, not vars,
            // and skip identifiers that are the argument to task_status(...) — a task
            // name, not a context variable.
            let after = &inner[m.end()..];
            if after.trim_start().starts_with('(') {
                continue;
            }
            let before = &inner[..m.start()];
            if before.trim_end().ends_with("task_status(") || before.trim_end().ends_with("ctx(")
            {
                continue;
            }
            vars.insert(word.to_string());
        }
    }
    vars
}

// --- Native (YAQL-flavored, `jaq`-backed) dialect -------------------------------

fn rewrite_native(expr: &str) -> String {
    let mut e = expr.trim().to_string();
    e = CTX_CALL_RE.replace_all(&e, ".$1").to_string();
    e = e.replace("item()", ".__item");
    e = e.replace("result()", ".__result");
    e = TASK_STATUS_CALL_RE
        .replace_all(&e, "(.__task_statuses.$1 // \"unset\")")
        .to_string();
    if let Some(caps) = IN_LIST_RE.captures(&e) {
        let lhs = caps[1].to_string();
        let rhs = caps[2].to_string();
        e = format!("({lhs}) as $x | {rhs} | any(. == $x)");
    }
    e
}

fn native_compile(jq_expr: &str) -> std::result::Result<(), String> {
    use jaq_core::load::{Arena, File, Loader};

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File {
        path: (),
        code: jq_expr,
    };
    let modules = loader.load(&arena, file).map_err(|e| format!("{e:?}"))?;
    jaq_core::compile::Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|e| format!("{e:?}"))?;
    Ok(())
}

fn native_eval(jq_expr: &str, context: &Value) -> std::result::Result<Value, String> {
    use jaq_core::load::{Arena, File, Loader};
    use jaq_core::{Ctx, RcIter};
    use jaq_interpret::FilterT;

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File {
        path: (),
        code: jq_expr,
    };
    let modules = loader.load(&arena, file).map_err(|e| format!("{e:?}"))?;
    let filter = jaq_core::compile::Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|e| format!("{e:?}"))?;

    let input: jaq_json::Val = context.clone().into();
    let inputs = RcIter::new(core::iter::empty());
    let mut results: Vec<_> = filter.run((Ctx::new([], &inputs), input)).collect();

    if results.is_empty() {
        return Ok(Value::Null);
    }
    match results.remove(0) {
        Ok(val) => Ok(val.into()),
        Err(e) => Err(e.to_string()),
    }
}

// --- Jinja dialect (`minijinja`-backed) -----------------------------------------

fn rewrite_jinja(expr: &str) -> String {
    let mut e = expr.trim().to_string();
    e = CTX_CALL_RE.replace_all(&e, "$1").to_string();
    e = e.replace("item()", "__item");
    e = e.replace("result()", "__result");
    e = TASK_STATUS_CALL_RE
        .replace_all(&e, "(__task_statuses.$1 | default(\"unset\"))")
        .to_string();
    e
}

fn jinja_eval(expr: &str, context: &Value) -> std::result::Result<Value, String> {
    let env = minijinja::Environment::new();
    let compiled = env.compile_expression(expr).map_err(|e| e.to_string())?;
    let ctx_value = minijinja::Value::from_serialize(context);
    let rendered = compiled.eval(ctx_value).map_err(|e| e.to_string())?;
    serde_json::to_value(&rendered).map_err(|e| e.to_string())
}

/// A dialect-keyed registry, constructed once by `Conductor::new` (never a global).
/// A registry from dialect tag to evaluator, constructed once per conductor rather
/// than as a global. With only two built-in dialects it carries no state today, but
/// gives the conductor a single place to route through rather than calling free
/// functions directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct Registry;

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn has_expression(&self, text: &str) -> bool {
        has_expression(text)
    }

    #[must_use]
    pub fn validate(&self, text: &str) -> Vec<ValidationIssue> {
        validate(text)
    }

    pub fn evaluate(&self, text: &str, context: &Value) -> Result<Value> {
        evaluate(text, context)
    }

    #[must_use]
    pub fn extract_vars(&self, text: &str) -> HashSet<String> {
        extract_vars(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn has_expression_detects_both_markers() {
        assert!(has_expression("<% ctx(x) %>"));
        assert!(has_expression("{{ x }}"));
        assert!(!has_expression("plain text"));
    }

    #[test]
    fn native_ctx_lookup() {
        let ctx = json!({"name": "fee"});
        let v = evaluate("<% ctx(name) %>", &ctx).unwrap();
        assert_eq!(v, json!("fee"));
    }

    #[test]
    fn native_task_status_in_list() {
        let ctx = json!({"__task_statuses": {"t1": "succeeded"}});
        let v = evaluate("<% task_status(t1) in [\"succeeded\"] %>", &ctx).unwrap();
        assert_eq!(v, json!(true));
    }

    #[test]
    fn native_task_status_in_list_false_case() {
        let ctx = json!({"__task_statuses": {"t1": "failed"}});
        let v = evaluate(
            "<% task_status(t1) in [\"failed\", \"expired\", \"abandoned\"] %>",
            &ctx,
        )
        .unwrap();
        assert_eq!(v, json!(true));

        let ctx2 = json!({"__task_statuses": {"t1": "succeeded"}});
        let v2 = evaluate(
            "<% task_status(t1) in [\"failed\", \"expired\", \"abandoned\"] %>",
            &ctx2,
        )
        .unwrap();
        assert_eq!(v2, json!(false));
    }

    #[test]
    fn jinja_ctx_lookup() {
        let ctx = json!({"name": "fi"});
        let v = evaluate("{{ ctx(name) }}", &ctx).unwrap();
        assert_eq!(v, json!("fi"));
    }

    #[test]
    fn no_expression_returns_unchanged() {
        let ctx = json!({});
        let v = evaluate("just text", &ctx).unwrap();
        assert_eq!(v, json!("just text"));
    }

    #[test]
    fn mixed_literal_and_expression_renders_as_string() {
        let ctx = json!({"name": "fo"});
        let v = evaluate("hello <% ctx(name) %>!", &ctx).unwrap();
        assert_eq!(v, json!("hello fo!"));
    }

    #[test]
    fn extract_vars_collects_ctx_and_bare_names() {
        let vars = extract_vars("<% ctx(xs) %> {{ other }}");
        assert!(vars.contains("xs"));
        assert!(vars.contains("other"));
    }

    #[test]
    fn validate_reports_syntax_errors() {
        let issues = validate("<% ctx(xs %>");
        assert!(!issues.is_empty());
    }

    #[test]
    fn validate_clean_expression_is_empty() {
        let issues = validate("<% ctx(xs) %>");
        assert!(issues.is_empty());
    }

    #[test]
    fn item_and_result_reserved_bindings() {
        let ctx = json!({"__item": "fee", "__result": ["fee", "fi"]});
        assert_eq!(evaluate("<% item() %>", &ctx).unwrap(), json!("fee"));
        assert_eq!(
            evaluate("<% result() %>", &ctx).unwrap(),
            json!(["fee", "fi"])
        );
    }
}
