//! The closed document root of a container.
//!
//! Only the guest runtime and the plugin's context hold it; the host sees
//! nothing but the node count reported through telemetry.

use crate::error::{GuestError, GuestResult};
use std::collections::BTreeMap;

/// One element in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub id: Option<String>,
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

#[derive(Debug, Default)]
pub struct DocumentRoot {
    nodes: Vec<Node>,
    csp: Option<String>,
}

impl DocumentRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node. Ids are unique within the document.
    pub fn append(&mut self, node: Node) -> GuestResult<()> {
        if let Some(id) = &node.id {
            if self.get(id).is_some() {
                return Err(GuestError::DuplicateElement(id.clone()));
            }
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id.as_deref() != Some(id));
        before != self.nodes.len()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id.as_deref() == Some(id))
    }

    pub fn by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.tag == tag)
    }

    pub fn node_count(&self) -> u64 {
        self.nodes.len() as u64
    }

    /// Rough retained size of the document contents.
    pub fn estimated_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| {
                let attrs: usize = n.attributes.iter().map(|(k, v)| k.len() + v.len()).sum();
                (n.tag.len() + n.text.len() + attrs + n.id.as_ref().map_or(0, String::len)) as u64
            })
            .sum()
    }

    pub fn set_csp(&mut self, policy: String) {
        self.csp = Some(policy);
    }

    pub fn csp(&self) -> Option<&str> {
        self.csp.as_deref()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_remove_and_count() {
        let mut doc = DocumentRoot::new();
        doc.append(Node::new("div").with_id("a")).unwrap();
        doc.append(Node::new("span")).unwrap();
        assert_eq!(doc.node_count(), 2);
        assert!(matches!(
            doc.append(Node::new("p").with_id("a")),
            Err(GuestError::DuplicateElement(_))
        ));
        assert!(doc.remove("a"));
        assert!(!doc.remove("a"));
        assert_eq!(doc.node_count(), 1);
    }

    #[test]
    fn estimated_bytes_counts_text() {
        let mut doc = DocumentRoot::new();
        doc.append(Node::new("script").with_text("x".repeat(100))).unwrap();
        assert!(doc.estimated_bytes() >= 100);
    }
}
