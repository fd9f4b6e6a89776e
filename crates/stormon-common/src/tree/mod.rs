//! Ordered attribute tree shared by templates and XML payloads.

mod xml;
mod yaml;

pub use xml::{load_xml, to_xml};
pub use yaml::{load_yaml, to_yaml};

/// A named node with optional text content, attributes, and ordered
/// children. Names need not be unique among siblings; list items in
/// templates are nameless children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub name: String,
    pub content: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_content(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    /// Appends a child and returns a handle to it.
    pub fn new_child(&mut self, name: &str, content: &str) -> &mut Node {
        self.children.push(Node::with_content(name, content));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn add_child(&mut self, child: Node) {
        self.children.push(child);
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// First child named `name`.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    /// Removes and returns the first child named `name`.
    pub fn pop_child(&mut self, name: &str) -> Option<Node> {
        let pos = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(pos))
    }

    /// Content of the first child named `name`, or `""`.
    pub fn child_content(&self, name: &str) -> &str {
        self.child(name).map(|c| c.content.as_str()).unwrap_or("")
    }

    pub fn set_child_content(&mut self, name: &str, content: &str) {
        match self.child_mut(name) {
            Some(c) => c.content = content.to_string(),
            None => {
                self.new_child(name, content);
            }
        }
    }

    pub fn child_by_content(&self, content: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.content == content)
    }

    /// Content of every child, in order.
    pub fn all_child_content(&self) -> Vec<String> {
        self.children.iter().map(|c| c.content.clone()).collect()
    }

    pub fn all_child_names(&self) -> Vec<String> {
        self.children.iter().map(|c| c.name.clone()).collect()
    }

    /// Follows a dotted path of child names, e.g.
    /// `"version-tuple.system-version-tuple.generation"`.
    pub fn path(&self, path: &str) -> Option<&Node> {
        let mut current = self;
        for part in path.split('.').filter(|p| !p.is_empty()) {
            current = current.child(part)?;
        }
        Some(current)
    }

    pub fn path_content(&self, path: &str) -> &str {
        self.path(path).map(|n| n.content.as_str()).unwrap_or("")
    }

    /// All nodes reached by `path`, where the first element may match this
    /// node or any descendant and the rest must follow as a chain.
    pub fn search_children(&self, path: &[&str]) -> Vec<&Node> {
        let mut matches = Vec::new();
        if path.is_empty() {
            return matches;
        }
        fn walk<'a>(node: &'a Node, path: &[&str], depth: usize, out: &mut Vec<&'a Node>) {
            let next_depth = if depth > 0 || node.name == path[0] {
                if node.name != path[depth] {
                    return;
                }
                depth + 1
            } else {
                0
            };
            if next_depth == path.len() {
                out.push(node);
                return;
            }
            for child in &node.children {
                walk(child, path, next_depth, out);
            }
        }
        walk(self, path, 0, &mut matches);
        matches
    }

    /// Leaves as `(dotted path, content)`, starting below this node.
    /// Nameless list items contribute no path segment.
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for child in &self.children {
            child.flatten_into("", &mut out);
        }
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        let path = match (prefix.is_empty(), self.name.is_empty()) {
            (_, true) => prefix.to_string(),
            (true, false) => self.name.clone(),
            (false, false) => format!("{prefix}.{}", self.name),
        };
        if self.children.is_empty() {
            out.push((path, self.content.clone()));
        } else {
            for child in &self.children {
                child.flatten_into(&path, out);
            }
        }
    }

    /// Merges `other` into `self`.
    ///
    /// Named children missing here are added; existing ones take the
    /// override's content and merge recursively. Nameless children are
    /// unioned by content. When the parent of a scalar leaf is listed in
    /// `append_whitelist` (e.g. `LabelAgent` rule groups), the override is
    /// appended as an extra child instead of replacing the base value.
    pub fn merge(&mut self, other: &Node, append_whitelist: &[&str]) {
        if self.content.is_empty() {
            self.content = other.content.clone();
        }
        let append_here = append_whitelist.contains(&self.name.as_str());
        for child in &other.children {
            if child.name.is_empty() {
                if self.child_by_content(&child.content).is_none() || !child.is_leaf() {
                    self.children.push(child.clone());
                }
                continue;
            }
            let append = append_here
                && child.is_leaf()
                && self
                    .child(&child.name)
                    .is_some_and(|mine| mine.is_leaf());
            if append {
                let duplicate = self
                    .children
                    .iter()
                    .any(|c| c.name == child.name && c.content == child.content);
                if !duplicate {
                    self.children.push(child.clone());
                }
                continue;
            }
            match self.child_mut(&child.name) {
                None => self.children.push(child.clone()),
                Some(mine) => {
                    if !child.content.is_empty() {
                        mine.content = child.content.clone();
                    }
                    mine.merge(child, append_whitelist);
                }
            }
        }
    }

    /// Indented debug rendering.
    pub fn print(&self) -> String {
        let mut out = String::new();
        self.print_into(0, &mut out);
        out
    }

    fn print_into(&self, depth: usize, out: &mut String) {
        let name = if self.name.is_empty() { "*" } else { &self.name };
        out.push_str(&"  ".repeat(depth));
        out.push('[');
        out.push_str(name);
        out.push(']');
        if !self.content.is_empty() {
            out.push_str(" - ");
            out.push_str(&self.content);
        }
        out.push('\n');
        for child in &self.children {
            child.print_into(depth + 1, out);
        }
    }
}
