use client_core::{TemplateError, TemplateStore};
use serde_json::Value;
use std::collections::BTreeMap;

/// Compiles `{{path.to.field}}` templates into a store keyed like the
/// scenario file.
pub fn compile(sources: &BTreeMap<String, String>) -> TemplateStore {
    let mut store = TemplateStore::new();
    for (key, source) in sources {
        let source = source.clone();
        store.register(key.clone(), move |data: &Value| render(&source, data));
    }
    store
}

/// Substitutes every `{{field}}` with the matching value of `data`. Strings
/// are inserted verbatim, anything else as JSON. A missing field fails.
pub fn render(source: &str, data: &Value) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::new(format!(
                "unterminated placeholder at byte {}",
                source.len() - rest.len() + start
            )));
        };

        let path = after[..end].trim();
        let value = path
            .split('.')
            .try_fold(data, |value, key| value.get(key))
            .ok_or_else(|| TemplateError::new(format!("missing field {path}")))?;
        match value {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}
