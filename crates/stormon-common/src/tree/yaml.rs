use super::Node;
use crate::error::{PollError, Result};
use serde_yaml::{Mapping, Value};

/// Sequence keys whose mapping items become standalone nameless nodes
/// instead of being flattened into the list node.
const ITEM_NODE_KEYS: &[&str] = &["endpoints", "events", "matches", "resolve_when_ems"];

/// Parses YAML text into a tree rooted at a node named `Root`.
pub fn load_yaml(text: &str) -> Result<Node> {
    let value: Value = serde_yaml::from_str(text)?;
    if value.is_null() {
        return Err(PollError::Config("template is empty".to_string()));
    }
    let mut root = Node::new("Root");
    consume(&mut root, "", &value, false);
    Ok(root)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn consume(parent: &mut Node, key: &str, value: &Value, own_node: bool) {
    match value {
        Value::Mapping(map) => {
            let target: &mut Node = if !key.is_empty() || own_node {
                parent.new_child(key, "")
            } else {
                parent
            };
            for (k, v) in map {
                let k = scalar(k).unwrap_or_default();
                consume(target, &k, v, false);
            }
        }
        Value::Sequence(items) => {
            let list = parent.new_child(key, "");
            let own = ITEM_NODE_KEYS.contains(&key);
            for item in items {
                let item_own = own && item.is_mapping();
                consume(list, "", item, item_own);
            }
        }
        Value::Tagged(tagged) => consume(parent, key, &tagged.value, own_node),
        other => {
            let content = scalar(other).unwrap_or_default();
            parent.new_child(key, &content);
        }
    }
}

/// Renders a tree back to YAML. Parsing the output with [`load_yaml`]
/// reproduces the same children in the same order.
pub fn to_yaml(root: &Node) -> Result<String> {
    let value = if root.children.is_empty() {
        Value::Mapping(Mapping::new())
    } else {
        children_value(root)
    };
    serde_yaml::to_string(&value).map_err(PollError::from)
}

fn node_value(node: &Node) -> Value {
    if node.children.is_empty() {
        Value::String(node.content.clone())
    } else {
        children_value(node)
    }
}

fn children_value(node: &Node) -> Value {
    let mut names: Vec<&str> = node.children.iter().map(|c| c.name.as_str()).collect();
    let all_named = names.iter().all(|n| !n.is_empty());
    names.sort_unstable();
    names.dedup();
    let unique = names.len() == node.children.len();

    if all_named && unique {
        let mut map = Mapping::new();
        for child in &node.children {
            map.insert(Value::String(child.name.clone()), node_value(child));
        }
        return Value::Mapping(map);
    }

    let items = node
        .children
        .iter()
        .map(|child| {
            if child.name.is_empty() {
                node_value(child)
            } else {
                let mut map = Mapping::new();
                map.insert(Value::String(child.name.clone()), node_value(child));
                Value::Mapping(map)
            }
        })
        .collect();
    Value::Sequence(items)
}
