//! Circular-dependency detection over `ref`-typed properties
//!
//! The merged tree is shaped `kind -> entity -> body`; any object inside a
//! body with `{"type": "ref", "target": <entity>}` is a dependency edge
//! from the owning entity to the target. A cycle blocks the merge.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Dependency edges extracted from a merged tree, keyed by entity name.
pub fn extract_dependencies(tree: &Value) -> BTreeMap<String, BTreeSet<String>> {
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let Some(kinds) = tree.as_object() else {
        return deps;
    };

    for entities in kinds.values() {
        let Some(entities) = entities.as_object() else {
            continue;
        };
        for (entity_name, body) in entities {
            let targets = deps.entry(entity_name.clone()).or_default();
            collect_refs(body, targets);
        }
    }
    deps
}

fn collect_refs(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            let is_ref = map.get("type").and_then(Value::as_str) == Some("ref");
            if is_ref {
                if let Some(target) = map.get("target").and_then(Value::as_str) {
                    out.insert(target.to_string());
                }
            }
            for nested in map.values() {
                collect_refs(nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, out);
            }
        }
        _ => {}
    }
}

/// DFS cycle detection. Returns one cycle as an ordered node list, or None.
pub fn find_cycle(deps: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit(
        node: &str,
        deps: &BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node.to_string(), Mark::InProgress);
        stack.push(node.to_string());
        if let Some(targets) = deps.get(node) {
            for target in targets {
                if let Some(cycle) = visit(target, deps, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(node.to_string(), Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut stack = Vec::new();
    for node in deps.keys() {
        if let Some(cycle) = visit(node, deps, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_ref_edges() {
        let tree = json!({
            "object_types": {
                "Person": {"properties": {"org": {"type": "ref", "target": "Organization"}}},
                "Organization": {"properties": {"name": {"type": "string"}}}
            }
        });

        let deps = extract_dependencies(&tree);
        assert!(deps["Person"].contains("Organization"));
        assert!(deps["Organization"].is_empty());
    }

    #[test]
    fn test_refs_found_in_nested_arrays() {
        let tree = json!({
            "object_types": {
                "Order": {"properties": [
                    {"name": "items", "type": "ref", "target": "Item"}
                ]}
            }
        });
        let deps = extract_dependencies(&tree);
        assert!(deps["Order"].contains("Item"));
    }

    #[test]
    fn test_no_cycle() {
        let tree = json!({
            "object_types": {
                "A": {"p": {"type": "ref", "target": "B"}},
                "B": {"p": {"type": "ref", "target": "C"}},
                "C": {}
            }
        });
        assert!(find_cycle(&extract_dependencies(&tree)).is_none());
    }

    #[test]
    fn test_two_node_cycle() {
        let tree = json!({
            "object_types": {
                "Person": {"org": {"type": "ref", "target": "Organization"}},
                "Organization": {"owner": {"type": "ref", "target": "Person"}}
            }
        });
        let cycle = find_cycle(&extract_dependencies(&tree)).expect("cycle");
        assert!(cycle.contains(&"Person".to_string()));
        assert!(cycle.contains(&"Organization".to_string()));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let tree = json!({
            "object_types": {
                "Node": {"parent": {"type": "ref", "target": "Node"}}
            }
        });
        assert!(find_cycle(&extract_dependencies(&tree)).is_some());
    }

    #[test]
    fn test_dangling_ref_is_not_a_cycle() {
        let tree = json!({
            "object_types": {
                "A": {"p": {"type": "ref", "target": "Ghost"}}
            }
        });
        assert!(find_cycle(&extract_dependencies(&tree)).is_none());
    }
}
