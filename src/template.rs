use crate::config::{ExtractConfig, ExtractSource};
use serde_json::Value;
use std::collections::HashMap;

/// Replace every `{{name}}` occurrence in `template`, VU scope first, then
/// scenario scope. Unresolved placeholders are left intact.
pub fn resolve(
    template: &str,
    vu_vars: &HashMap<String, Value>,
    scenario_vars: &HashMap<String, String>,
) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    let mut out = template.to_string();
    for (name, value) in vu_vars {
        let placeholder = format!("{{{{{name}}}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, &stringify(value));
        }
    }
    for (name, value) in scenario_vars {
        let placeholder = format!("{{{{{name}}}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

/// Render a variable value for substitution: strings verbatim (no quotes),
/// numbers and booleans in their canonical form, null as the empty string,
/// arrays and objects as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Apply one extract directive against a response. Header names match
/// case-insensitively; `body` captures the full response text. Returns None
/// when nothing matched or the result was empty.
pub fn extract_value(
    extract: &ExtractConfig,
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> Option<String> {
    let raw = match extract.source {
        ExtractSource::Status => status.to_string(),
        ExtractSource::Header => headers.get(&extract.path.to_lowercase())?.clone(),
        ExtractSource::Body => body.to_string(),
    };

    let value = match &extract.regex {
        Some(pattern) => {
            let re = regex_lite::Regex::new(pattern).ok()?;
            let caps = re.captures(&raw)?;
            match caps.get(1) {
                Some(group) => group.as_str().to_string(),
                None => caps.get(0)?.as_str().to_string(),
            }
        }
        None => raw,
    };

    if value.is_empty() { None } else { Some(value) }
}
