//! Placeholder substitution for workflow graphs.
//!
//! Workflow documents mark injection points with `{name}` placeholders.
//! A string that is exactly a placeholder is replaced by the typed value
//! (so `"{seed}"` becomes a JSON number); placeholders embedded in longer
//! strings are spliced in textually (so `"masterpiece, {prompt}"` keeps
//! its prefix).

use std::collections::HashMap;

use serde_json::Value;

/// Named values to inject into a workflow graph.
#[derive(Debug, Default, Clone)]
pub struct Vars {
    map: HashMap<String, Value>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.map.insert(name.to_string(), value.into());
        self
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }
}

/// Render a workflow graph, replacing placeholders throughout.
/// Unmatched placeholders are left as-is so partially templated graphs
/// fail loudly at the backend instead of silently here.
pub fn render(graph: &Value, vars: &Vars) -> Value {
    match graph {
        Value::String(s) => render_string(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, vars: &Vars) -> Value {
    // Exact placeholder: typed replacement.
    if let Some(name) = s
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    {
        if !name.contains(['{', '}']) {
            if let Some(value) = vars.get(name) {
                return value.clone();
            }
        }
    }

    // Embedded placeholders: textual splice.
    if !s.contains('{') {
        return Value::String(s.to_string());
    }
    let mut out = s.to_string();
    for (name, value) in &vars.map {
        let needle = format!("{{{name}}}");
        if out.contains(&needle) {
            let text = match value {
                Value::String(v) => v.clone(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &text);
        }
    }
    Value::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_placeholder_keeps_type() {
        let graph = json!({
            "3": { "class_type": "KSampler", "inputs": { "seed": "{seed}", "steps": "{steps}" } }
        });
        let vars = Vars::new().set("seed", 12345678u64).set("steps", 4u32);
        let rendered = render(&graph, &vars);

        assert_eq!(rendered["3"]["inputs"]["seed"], json!(12345678u64));
        assert_eq!(rendered["3"]["inputs"]["steps"], json!(4));
    }

    #[test]
    fn embedded_placeholder_splices_text() {
        let graph = json!({ "6": { "inputs": { "text": "masterpiece, {prompt}" } } });
        let vars = Vars::new().set("prompt", "a cat");
        let rendered = render(&graph, &vars);
        assert_eq!(rendered["6"]["inputs"]["text"], json!("masterpiece, a cat"));
    }

    #[test]
    fn embedded_numeric_value_renders_as_text() {
        let graph = json!({ "note": "seed was {seed}" });
        let vars = Vars::new().set("seed", 7u64);
        assert_eq!(render(&graph, &vars)["note"], json!("seed was 7"));
    }

    #[test]
    fn unmatched_placeholders_survive() {
        let graph = json!({ "inputs": { "ckpt_name": "{model}" } });
        let rendered = render(&graph, &Vars::new());
        assert_eq!(rendered["inputs"]["ckpt_name"], json!("{model}"));
    }

    #[test]
    fn arrays_and_nesting_recurse() {
        let graph = json!({ "links": [["{a}", 0], { "deep": "{a}" }] });
        let vars = Vars::new().set("a", "x");
        let rendered = render(&graph, &vars);
        assert_eq!(rendered["links"][0][0], json!("x"));
        assert_eq!(rendered["links"][1]["deep"], json!("x"));
    }

    #[test]
    fn non_placeholder_strings_untouched() {
        let graph = json!({ "class_type": "CheckpointLoaderSimple" });
        assert_eq!(render(&graph, &Vars::new()), graph);
    }
}
