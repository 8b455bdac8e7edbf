//! Dot/bracket paths into schema trees
//!
//! Paths are the addresses used by diffs and conflicts:
//! `types.Person.properties[id=age].type` or `items[2].name`.
//! Mapping keys use dots, sequence elements use `[id=..]` (matched by an
//! id field) or `[n]` (positional).

use serde_json::Value;

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Mapping key
    Key(String),
    /// Sequence element matched by id field
    Id(String),
    /// Sequence element by position
    Index(usize),
}

/// Append a mapping key to a path string.
pub fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

/// Append an id-matched element to a path string.
pub fn join_id(path: &str, id: &str) -> String {
    format!("{}[id={}]", path, id)
}

/// Append a positional element to a path string.
pub fn join_index(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}

/// Parse a path string into segments. Returns None for malformed paths.
pub fn parse(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        // Leading key up to the first bracket, then any number of brackets
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(PathSegment::Key(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return None;
                }
                let close = rest.find(']')?;
                let inner = &rest[1..close];
                if let Some(id) = inner.strip_prefix("id=") {
                    segments.push(PathSegment::Id(id.to_string()));
                } else {
                    segments.push(PathSegment::Index(inner.parse().ok()?));
                }
                rest = &rest[close + 1..];
            }
        } else {
            segments.push(PathSegment::Key(rest.to_string()));
        }
    }
    Some(segments)
}

/// Id of a sequence element, using the first matching id field.
pub fn element_id(value: &Value, id_fields: &[String]) -> Option<String> {
    let obj = value.as_object()?;
    for field in id_fields {
        if let Some(id) = obj.get(field) {
            return Some(match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
    }
    None
}

fn find_by_id<'a>(items: &'a [Value], id: &str, id_fields: &[String]) -> Option<usize> {
    items
        .iter()
        .position(|item| element_id(item, id_fields).as_deref() == Some(id))
}

/// Read the value at a path. Empty path returns the root.
pub fn get<'a>(root: &'a Value, path: &str, id_fields: &[String]) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in parse(path)? {
        current = match segment {
            PathSegment::Key(key) => current.as_object()?.get(&key)?,
            PathSegment::Id(id) => {
                let items = current.as_array()?;
                &items[find_by_id(items, &id, id_fields)?]
            }
            PathSegment::Index(index) => current.as_array()?.get(index)?,
        };
    }
    Some(current)
}

/// Write a value at a path, creating intermediate mappings as needed.
/// Returns false when the path cannot be materialized (e.g. an id-matched
/// element missing from a sequence).
pub fn set(root: &mut Value, path: &str, value: Value, id_fields: &[String]) -> bool {
    let Some(segments) = parse(path) else {
        return false;
    };
    if segments.is_empty() {
        return false;
    }

    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            PathSegment::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(serde_json::Map::new());
                }
                let obj = current.as_object_mut().expect("just ensured object");
                if last {
                    obj.insert(key.clone(), value);
                    return true;
                }
                current = obj.entry(key.clone()).or_insert(Value::Null);
            }
            PathSegment::Id(id) => {
                let Some(items) = current.as_array_mut() else {
                    return false;
                };
                match find_by_id(items, id, id_fields) {
                    Some(pos) => {
                        if last {
                            items[pos] = value;
                            return true;
                        }
                        current = &mut items[pos];
                    }
                    None => {
                        if last {
                            items.push(value);
                            return true;
                        }
                        return false;
                    }
                }
            }
            PathSegment::Index(index) => {
                let Some(items) = current.as_array_mut() else {
                    return false;
                };
                if last {
                    if *index < items.len() {
                        items[*index] = value;
                    } else {
                        items.push(value);
                    }
                    return true;
                }
                if *index >= items.len() {
                    return false;
                }
                current = &mut items[*index];
            }
        }
    }
    false
}

/// Remove the value at a path. Returns true if something was removed.
pub fn remove(root: &mut Value, path: &str, id_fields: &[String]) -> bool {
    let Some(segments) = parse(path) else {
        return false;
    };
    if segments.is_empty() {
        return false;
    }

    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            PathSegment::Key(key) => {
                let Some(obj) = current.as_object_mut() else {
                    return false;
                };
                if last {
                    return obj.remove(key).is_some();
                }
                let Some(next) = obj.get_mut(key) else {
                    return false;
                };
                current = next;
            }
            PathSegment::Id(id) => {
                let Some(items) = current.as_array_mut() else {
                    return false;
                };
                let Some(pos) = find_by_id(items, id, id_fields) else {
                    return false;
                };
                if last {
                    items.remove(pos);
                    return true;
                }
                current = &mut items[pos];
            }
            PathSegment::Index(index) => {
                let Some(items) = current.as_array_mut() else {
                    return false;
                };
                if *index >= items.len() {
                    return false;
                }
                if last {
                    items.remove(*index);
                    return true;
                }
                current = &mut items[*index];
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> Vec<String> {
        vec!["@id".to_string(), "name".to_string(), "id".to_string()]
    }

    #[test]
    fn test_parse_simple_and_bracketed() {
        assert_eq!(
            parse("a.b.c").unwrap(),
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Key("c".into())
            ]
        );
        assert_eq!(
            parse("items[id=x].type").unwrap(),
            vec![
                PathSegment::Key("items".into()),
                PathSegment::Id("x".into()),
                PathSegment::Key("type".into())
            ]
        );
        assert_eq!(
            parse("items[2]").unwrap(),
            vec![PathSegment::Key("items".into()), PathSegment::Index(2)]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse("a..b").is_none());
        assert!(parse("items[oops").is_none());
        assert!(parse("items[?]").is_none());
    }

    #[test]
    fn test_get_nested() {
        let tree = json!({
            "types": {"Person": {"properties": [
                {"name": "age", "type": "int"},
                {"name": "email", "type": "string"}
            ]}}
        });

        assert_eq!(
            get(&tree, "types.Person.properties[id=age].type", &ids()),
            Some(&json!("int"))
        );
        assert_eq!(
            get(&tree, "types.Person.properties[1].name", &ids()),
            Some(&json!("email"))
        );
        assert_eq!(get(&tree, "types.Missing", &ids()), None);
        assert_eq!(get(&tree, "", &ids()), Some(&tree));
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let mut tree = json!({});
        assert!(set(&mut tree, "a.b.c", json!(1), &ids()));
        assert_eq!(tree, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_by_id_replaces_element() {
        let mut tree = json!({"props": [{"name": "age", "type": "int"}]});
        assert!(set(
            &mut tree,
            "props[id=age].type",
            json!("long"),
            &ids()
        ));
        assert_eq!(tree["props"][0]["type"], "long");
    }

    #[test]
    fn test_set_appends_missing_id_element() {
        let mut tree = json!({"props": []});
        assert!(set(
            &mut tree,
            "props[id=age]",
            json!({"name": "age", "type": "int"}),
            &ids()
        ));
        assert_eq!(tree["props"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut tree = json!({"a": {"b": 1, "c": 2}, "items": [{"name": "x"}]});
        assert!(remove(&mut tree, "a.b", &ids()));
        assert!(tree["a"].get("b").is_none());
        assert!(remove(&mut tree, "items[id=x]", &ids()));
        assert!(tree["items"].as_array().unwrap().is_empty());
        assert!(!remove(&mut tree, "a.missing", &ids()));
    }

    #[test]
    fn test_element_id_field_priority() {
        let ids = ids();
        assert_eq!(
            element_id(&json!({"@id": "x", "name": "y"}), &ids),
            Some("x".to_string())
        );
        assert_eq!(element_id(&json!({"name": "y"}), &ids), Some("y".to_string()));
        assert_eq!(element_id(&json!({"other": 1}), &ids), None);
        assert_eq!(element_id(&json!(42), &ids), None);
    }
}
