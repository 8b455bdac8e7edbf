//! Recursive structural diff between two schema trees

use crate::engine::MergeConfig;
use crate::path;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One change relative to the base tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Key or element present only in the new tree
    Add {
        /// Added value
        value: Value,
    },
    /// Key or element present only in the old tree
    Delete {
        /// Removed value
        value: Value,
    },
    /// Primitive value changed
    Modify {
        /// Old value
        old: Value,
        /// New value
        new: Value,
    },
    /// Structural kind changed (e.g. mapping became a sequence)
    TypeChange {
        /// Old value
        old: Value,
        /// New value
        new: Value,
    },
}

impl Change {
    /// The value this change wants in the merged tree, if any.
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            Change::Add { value } => Some(value),
            Change::Modify { new, .. } => Some(new),
            Change::TypeChange { new, .. } => Some(new),
            Change::Delete { .. } => None,
        }
    }
}

/// Path-ordered map of changes. BTreeMap keeps diff output deterministic.
pub type ChangeMap = BTreeMap<String, Change>;

/// The JSON structural kind, for type-change detection.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Diff two trees. Pure; output order is deterministic.
pub fn diff_trees(old: &Value, new: &Value, config: &MergeConfig) -> ChangeMap {
    let mut changes = ChangeMap::new();
    diff_value(old, new, "", config, &mut changes);
    changes
}

fn diff_value(old: &Value, new: &Value, path: &str, config: &MergeConfig, out: &mut ChangeMap) {
    if value_kind(old) != value_kind(new) {
        out.insert(
            path.to_string(),
            Change::TypeChange {
                old: old.clone(),
                new: new.clone(),
            },
        );
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
            for key in keys {
                if config.is_ignored_field(key) {
                    continue;
                }
                let sub_path = path::join_key(path, key);
                match (old_map.get(key), new_map.get(key)) {
                    (None, Some(added)) => {
                        out.insert(
                            sub_path,
                            Change::Add {
                                value: added.clone(),
                            },
                        );
                    }
                    (Some(removed), None) => {
                        out.insert(
                            sub_path,
                            Change::Delete {
                                value: removed.clone(),
                            },
                        );
                    }
                    (Some(old_value), Some(new_value)) => {
                        diff_value(old_value, new_value, &sub_path, config, out);
                    }
                    (None, None) => unreachable!("key came from one of the maps"),
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            if config.merge_arrays_by_id
                && all_have_ids(old_items, config)
                && all_have_ids(new_items, config)
            {
                diff_arrays_by_id(old_items, new_items, path, config, out);
            } else {
                diff_arrays_by_index(old_items, new_items, path, config, out);
            }
        }
        _ => {
            if old != new {
                out.insert(
                    path.to_string(),
                    Change::Modify {
                        old: old.clone(),
                        new: new.clone(),
                    },
                );
            }
        }
    }
}

fn all_have_ids(items: &[Value], config: &MergeConfig) -> bool {
    items
        .iter()
        .all(|item| path::element_id(item, &config.id_fields).is_some())
}

fn diff_arrays_by_id(
    old_items: &[Value],
    new_items: &[Value],
    path: &str,
    config: &MergeConfig,
    out: &mut ChangeMap,
) {
    let old_by_id: BTreeMap<String, &Value> = old_items
        .iter()
        .filter_map(|item| path::element_id(item, &config.id_fields).map(|id| (id, item)))
        .collect();
    let new_by_id: BTreeMap<String, &Value> = new_items
        .iter()
        .filter_map(|item| path::element_id(item, &config.id_fields).map(|id| (id, item)))
        .collect();

    let ids: BTreeSet<&String> = old_by_id.keys().chain(new_by_id.keys()).collect();
    for id in ids {
        let sub_path = path::join_id(path, id);
        match (old_by_id.get(id), new_by_id.get(id)) {
            (None, Some(added)) => {
                out.insert(
                    sub_path,
                    Change::Add {
                        value: (*added).clone(),
                    },
                );
            }
            (Some(removed), None) => {
                out.insert(
                    sub_path,
                    Change::Delete {
                        value: (*removed).clone(),
                    },
                );
            }
            (Some(old_value), Some(new_value)) => {
                diff_value(old_value, new_value, &sub_path, config, out);
            }
            (None, None) => unreachable!("id came from one of the maps"),
        }
    }
}

fn diff_arrays_by_index(
    old_items: &[Value],
    new_items: &[Value],
    path: &str,
    config: &MergeConfig,
    out: &mut ChangeMap,
) {
    let longest = old_items.len().max(new_items.len());
    for i in 0..longest {
        let sub_path = path::join_index(path, i);
        match (old_items.get(i), new_items.get(i)) {
            (None, Some(added)) => {
                out.insert(
                    sub_path,
                    Change::Add {
                        value: added.clone(),
                    },
                );
            }
            (Some(removed), None) => {
                out.insert(
                    sub_path,
                    Change::Delete {
                        value: removed.clone(),
                    },
                );
            }
            (Some(old_value), Some(new_value)) => {
                diff_value(old_value, new_value, &sub_path, config, out);
            }
            (None, None) => unreachable!("index bounded by the longer array"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> MergeConfig {
        MergeConfig::default()
    }

    #[test]
    fn test_identical_trees_have_no_changes() {
        let tree = json!({"a": 1, "b": {"c": [1, 2, 3]}});
        assert!(diff_trees(&tree, &tree, &config()).is_empty());
    }

    #[test]
    fn test_add_delete_modify() {
        let old = json!({"keep": 1, "gone": 2, "changed": 3});
        let new = json!({"keep": 1, "fresh": 4, "changed": 5});
        let changes = diff_trees(&old, &new, &config());

        assert_eq!(changes.len(), 3);
        assert_eq!(changes["fresh"], Change::Add { value: json!(4) });
        assert_eq!(changes["gone"], Change::Delete { value: json!(2) });
        assert_eq!(
            changes["changed"],
            Change::Modify {
                old: json!(3),
                new: json!(5)
            }
        );
    }

    #[test]
    fn test_nested_paths() {
        let old = json!({"types": {"Person": {"properties": {"age": {"type": "int"}}}}});
        let new = json!({"types": {"Person": {"properties": {"age": {"type": "long"}}}}});
        let changes = diff_trees(&old, &new, &config());

        assert_eq!(changes.len(), 1);
        assert!(changes.contains_key("types.Person.properties.age.type"));
    }

    #[test]
    fn test_type_change_single_entry() {
        let old = json!({"field": {"nested": 1}});
        let new = json!({"field": [1, 2]});
        let changes = diff_trees(&old, &new, &config());

        assert_eq!(changes.len(), 1);
        assert!(matches!(changes["field"], Change::TypeChange { .. }));
    }

    #[test]
    fn test_ignored_fields_skipped() {
        let old = json!({"@timestamp": 1, "@internal": "x", "real": 1});
        let new = json!({"@timestamp": 2, "@internal": "y", "real": 2});
        let changes = diff_trees(&old, &new, &config());

        // @timestamp is in the ignore set, @internal hits the @ prefix rule
        assert_eq!(changes.len(), 1);
        assert!(changes.contains_key("real"));
    }

    #[test]
    fn test_arrays_by_id() {
        let old = json!({"props": [
            {"name": "age", "type": "int"},
            {"name": "email", "type": "string"}
        ]});
        let new = json!({"props": [
            {"name": "email", "type": "string"},
            {"name": "age", "type": "long"},
            {"name": "city", "type": "string"}
        ]});
        let changes = diff_trees(&old, &new, &config());

        // Reordering alone is not a change; age modified, city added
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes["props[id=age].type"],
            Change::Modify {
                old: json!("int"),
                new: json!("long")
            }
        );
        assert!(matches!(changes["props[id=city]"], Change::Add { .. }));
    }

    #[test]
    fn test_arrays_by_index_when_ids_missing() {
        let old = json!({"values": [1, 2, 3]});
        let new = json!({"values": [1, 9]});
        let changes = diff_trees(&old, &new, &config());

        assert_eq!(
            changes["values[1]"],
            Change::Modify {
                old: json!(2),
                new: json!(9)
            }
        );
        assert!(matches!(changes["values[2]"], Change::Delete { .. }));
    }

    #[test]
    fn test_arrays_by_index_when_configured() {
        let mut config = config();
        config.merge_arrays_by_id = false;
        let old = json!({"props": [{"name": "a"}, {"name": "b"}]});
        let new = json!({"props": [{"name": "b"}, {"name": "a"}]});
        let changes = diff_trees(&old, &new, &config);

        // Positional mode sees the reorder as two modifications
        assert_eq!(changes.len(), 2);
        assert!(changes.contains_key("props[0].name"));
        assert!(changes.contains_key("props[1].name"));
    }

    #[test]
    fn test_diff_is_deterministic() {
        let old = json!({"z": 1, "a": {"m": 1, "b": 2}, "k": [{"name": "x", "v": 1}]});
        let new = json!({"z": 2, "a": {"m": 3, "b": 4}, "k": [{"name": "x", "v": 5}]});

        let first: Vec<String> = diff_trees(&old, &new, &config()).into_keys().collect();
        let second: Vec<String> = diff_trees(&old, &new, &config()).into_keys().collect();
        assert_eq!(first, second);
        // Sorted by path
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(first, sorted);
    }
}
