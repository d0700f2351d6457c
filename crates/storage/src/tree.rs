use serde_json::{Map, Value};
use shared::paths::StorePath;

/// Drops nulls and empty objects; `None` when nothing is left.
pub(crate) fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(key, child)| prune(child).map(|child| (key, child)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        other => Some(other),
    }
}

pub(crate) fn read(root: &Value, path: &StorePath) -> Option<Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    match node {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// `value` must already be pruned. `None` removes the subtree and any parent
/// left empty by the removal.
pub(crate) fn write(root: &mut Value, path: &StorePath, value: Option<Value>) {
    let segments: Vec<&str> = path.segments().collect();
    match value {
        Some(value) => insert(root, &segments, value),
        None => {
            remove(root, &segments);
        }
    }
}

fn insert(node: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        insert(child, rest, value);
    }
}

/// Returns true when `node` ended up empty.
fn remove(node: &mut Value, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };
    let Value::Object(map) = node else {
        return false;
    };
    if rest.is_empty() {
        map.remove(*first);
    } else if let Some(child) = map.get_mut(*first) {
        if remove(child, rest) {
            map.remove(*first);
        }
    }
    map.is_empty()
}

/// Leaf entries of `value` keyed by their full path.
pub(crate) fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&format!("{prefix}/{key}"), child, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}
