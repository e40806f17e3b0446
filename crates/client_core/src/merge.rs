use serde_json::{Map, Value};

/// Levels of nested objects that are merged key by key before the later
/// value replaces the earlier one outright.
const MERGE_DEPTH: usize = 2;

/// Merges object layers left to right into a fresh object; later layers win.
/// Non-object layers are skipped.
pub fn merge_layers(layers: &[&Value]) -> Value {
    let mut merged = Map::new();
    for layer in layers {
        if let Value::Object(fields) = layer {
            merge_into(&mut merged, fields, MERGE_DEPTH);
        }
    }
    Value::Object(merged)
}

fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>, depth: usize) {
    for (key, value) in source {
        if depth > 0 {
            if let (Some(Value::Object(existing)), Value::Object(nested)) =
                (target.get_mut(key), value)
            {
                merge_into(existing, nested, depth - 1);
                continue;
            }
        }
        target.insert(key.clone(), value.clone());
    }
}
