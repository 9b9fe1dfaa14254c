//! Namespace-aware XML document tree.
//!
//! [`XmlNode`] is the canonical in-memory form for everything the backend
//! touches: datastore content, RPC payloads, and error envelopes. Trees are
//! plain owned values; transactions copy them wholesale.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single XML element with attributes, body text, and ordered children.
///
/// Namespaces are stored as resolved URIs. Prefixes from the source text are
/// normalized away during parsing; rendering re-synthesizes default `xmlns`
/// declarations wherever a child's namespace differs from its parent's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmlNode {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    attrs: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    children: Vec<XmlNode>,
}

impl XmlNode {
    /// Creates an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attrs: Vec::new(),
            body: None,
            children: Vec::new(),
        }
    }

    /// Sets the namespace URI (builder style).
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Sets the body text (builder style).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds an attribute (builder style).
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    /// Adds a child element (builder style).
    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    /// Element name without prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the element.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Resolved namespace URI, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Sets the namespace URI.
    pub fn set_namespace(&mut self, ns: impl Into<String>) {
        self.namespace = Some(ns.into());
    }

    /// Body text, if any.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Sets or clears the body text.
    pub fn set_body(&mut self, body: Option<String>) {
        self.body = body;
    }

    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets an attribute, replacing any existing value.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name, value));
        }
    }

    /// Removes an attribute, returning its value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(n, _)| n == name)?;
        Some(self.attrs.remove(idx).1)
    }

    /// All attributes in document order.
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    /// Child elements in document order.
    pub fn children(&self) -> &[XmlNode] {
        &self.children
    }

    /// Mutable child elements.
    pub fn children_mut(&mut self) -> &mut Vec<XmlNode> {
        &mut self.children
    }

    /// Appends a child element.
    pub fn push(&mut self, child: XmlNode) {
        self.children.push(child);
    }

    /// First child with the given name.
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child with the given name, mutably.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut XmlNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// First child matching name and namespace.
    pub fn find_ns(&self, name: &str, ns: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace.as_deref() == Some(ns))
    }

    /// All children with the given name.
    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Body of the first child with the given name.
    ///
    /// Shorthand for the common `<parent><name>value</name></parent>` lookup
    /// in RPC bodies.
    pub fn find_body(&self, name: &str) -> Option<&str> {
        self.find(name).and_then(|c| c.body())
    }

    /// Name of the single grandchild under the named child.
    ///
    /// NETCONF datastore references arrive as `<target><candidate/></target>`;
    /// this returns `"candidate"` for `child_name = "target"`.
    pub fn find_db_name(&self, child_name: &str) -> Option<&str> {
        self.find(child_name)
            .and_then(|c| c.children.first())
            .map(|n| n.name.as_str())
    }

    /// True if the element has no body and no children.
    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.children.is_empty()
    }

    /// True if the element has no child elements (a leaf).
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Removes and returns the first child with the given name.
    pub fn take(&mut self, name: &str) -> Option<XmlNode> {
        let idx = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(idx))
    }

    /// Serializes the subtree on one line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, None, None);
        out
    }

    /// Serializes the subtree with two-space indentation.
    pub fn render_pretty(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, None, Some(0));
        out.push('\n');
        out
    }

    fn render_into(&self, out: &mut String, parent_ns: Option<&str>, indent: Option<usize>) {
        if let Some(level) = indent {
            if level > 0 {
                out.push('\n');
            }
            out.push_str(&"  ".repeat(level));
        }
        out.push('<');
        out.push_str(&self.name);
        if self.namespace.is_some() && self.namespace.as_deref() != parent_ns {
            out.push_str(" xmlns=\"");
            out.push_str(&escape_xml(self.namespace.as_deref().unwrap_or_default()));
            out.push('"');
        }
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_xml(value));
            out.push('"');
        }
        if self.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        let child_ns = self.namespace.as_deref().or(parent_ns);
        if let Some(body) = &self.body {
            out.push_str(&escape_xml(body));
        }
        for child in &self.children {
            child.render_into(out, child_ns, indent.map(|l| l + 1));
        }
        if !self.children.is_empty() {
            if let Some(level) = indent {
                out.push('\n');
                out.push_str(&"  ".repeat(level));
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Depth-first document-order visit of the subtree.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a XmlNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

impl fmt::Display for XmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Escapes the five XML metacharacters in text content and attribute values.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
