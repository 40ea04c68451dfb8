//! Context assembly: merging published variables into an inherited context, and
//! rendering task input parameters through the expression façade.
//!
//! Merge is a shallow `serde_json::Map` key insert (later sources win key-for-key);
//! reserved dunder keys (`__current_task`, `__state`, …) are injected into a render-time
//! copy only, never persisted back into a task's own context.

use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::expressions::Registry;
use crate::status::Status;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to render input `{name}`: {source}"))]
    RenderInput {
        name: String,
        source: crate::expressions::Error,
    },
    #[snafu(display("failed to render output `{name}`: {source}"))]
    RenderOutput {
        name: String,
        source: crate::expressions::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub const CURRENT_TASK_KEY: &str = "__current_task";
pub const STATE_KEY: &str = "__state";
pub const TASK_STATUSES_KEY: &str = "__task_statuses";
pub const ITEM_KEY: &str = "__item";
pub const RESULT_KEY: &str = "__result";

/// Merge rule: `base < inherited < published`, each a shallow object key overwrite —
/// later sources win key-for-key, matching `Context::merge`'s `obj.insert` semantics.
#[must_use]
pub fn merge(base_vars: &Value, inherited: &Value, published: &[(String, Value)]) -> Value {
    let mut out = Map::new();
    if let Some(obj) = base_vars.as_object() {
        out.extend(obj.clone());
    }
    if let Some(obj) = inherited.as_object() {
        out.extend(obj.clone());
    }
    for (k, v) in published {
        out.insert(k.clone(), v.clone());
    }
    Value::Object(out)
}

/// Inject the reserved dunder keys a task instance's rendering sees. `task_statuses`
/// is the full `{task_name: status}` map the `task_status(name)` callable resolves
/// against.
#[must_use]
pub fn with_reserved(
    ctx: &Value,
    current_task: &str,
    workflow_status: Status,
    task_statuses: &Value,
    item: Option<&Value>,
    result: Option<&Value>,
) -> Value {
    let mut obj = ctx.as_object().cloned().unwrap_or_default();
    obj.insert(CURRENT_TASK_KEY.to_string(), Value::String(current_task.to_string()));
    obj.insert(STATE_KEY.to_string(), Value::String(workflow_status.to_string()));
    obj.insert(TASK_STATUSES_KEY.to_string(), task_statuses.clone());
    if let Some(i) = item {
        obj.insert(ITEM_KEY.to_string(), i.clone());
    }
    if let Some(r) = result {
        obj.insert(RESULT_KEY.to_string(), r.clone());
    }
    Value::Object(obj)
}

/// Render a task's declared `input:` parameters against `ctx`, each expression
/// (either dialect, or a plain literal) evaluated independently.
pub fn render_input(
    registry: &Registry,
    ctx: &Value,
    input: &[(String, String)],
) -> Result<Value> {
    let mut out = Map::new();
    for (name, expr) in input {
        let value = registry.evaluate(expr, ctx).context(RenderInputSnafu {
            name: name.clone(),
        })?;
        out.insert(name.clone(), value);
    }
    Ok(Value::Object(out))
}

/// Render the workflow's declared `output:` expressions against the final context.
pub fn render_outputs(
    registry: &Registry,
    ctx: &Value,
    outputs: &[(String, String)],
) -> Result<Value> {
    let mut out = Map::new();
    for (name, expr) in outputs {
        let value = registry.evaluate(expr, ctx).context(RenderOutputSnafu {
            name: name.clone(),
        })?;
        out.insert(name.clone(), value);
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_lets_published_win_over_inherited() {
        let base = json!({"a": 1});
        let inherited = json!({"a": 2, "b": 2});
        let published = vec![("a".to_string(), json!(3))];
        let merged = merge(&base, &inherited, &published);
        assert_eq!(merged, json!({"a": 3, "b": 2}));
    }

    #[test]
    fn with_reserved_injects_all_keys() {
        let ctx = json!({"x": 1});
        let statuses = json!({"t1": "succeeded"});
        let out = with_reserved(
            &ctx,
            "t2",
            Status::Running,
            &statuses,
            Some(&json!("a")),
            Some(&json!("ok")),
        );
        assert_eq!(out["__current_task"], json!("t2"));
        assert_eq!(out["__state"], json!("running"));
        assert_eq!(out["__item"], json!("a"));
        assert_eq!(out["__result"], json!("ok"));
        assert_eq!(out["x"], json!(1));
    }

    #[test]
    fn render_input_evaluates_each_parameter() {
        let registry = Registry::new();
        let ctx = json!({"name": "fee"});
        let input = vec![("greeting".to_string(), "<% ctx(name) %>".to_string())];
        let rendered = render_input(&registry, &ctx, &input).unwrap();
        assert_eq!(rendered["greeting"], json!("fee"));
    }

    #[test]
    fn render_outputs_supports_jinja_dialect() {
        let registry = Registry::new();
        let ctx = json!({"total": 3});
        let outputs = vec![("sum".to_string(), "{{ total }}".to_string())];
        let rendered = render_outputs(&registry, &ctx, &outputs).unwrap();
        assert_eq!(rendered["sum"], json!(3));
    }
}
