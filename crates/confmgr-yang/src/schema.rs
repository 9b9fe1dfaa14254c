//! Opaque YANG schema representation.
//!
//! A [`Schema`] holds the modules the backend knows about. Nodes mirror the
//! YANG data-node kinds the validator understands: container, list, leaf,
//! leaf-list, and choice/case. Schemas are built programmatically; YANG
//! source parsing lives outside this repository.

use std::fmt;

use confmgr_types::PathExpr;

/// A set of loaded modules.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    modules: Vec<Module>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module.
    pub fn add_module(&mut self, module: Module) {
        self.modules.push(module);
    }

    /// Builder form of [`Schema::add_module`].
    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    /// All modules.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Module by name.
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Module by namespace URI.
    pub fn module_by_namespace(&self, ns: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.namespace == ns)
    }

    /// Top-level data node by namespace and name.
    ///
    /// With `ns` unset the first module defining the name wins; data from
    /// un-namespaced test trees still resolves that way.
    pub fn find_top(&self, ns: Option<&str>, name: &str) -> Option<&SchemaNode> {
        self.modules
            .iter()
            .filter(|m| ns.is_none() || ns == Some(m.namespace.as_str()))
            .find_map(|module| find_data_child(&module.nodes, name))
    }

    /// True if no module is loaded.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// A single YANG module: a namespace plus its top-level data nodes.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    namespace: String,
    prefix: String,
    nodes: Vec<SchemaNode>,
    extensions: Vec<(String, String)>,
}

impl Module {
    /// Creates an empty module.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            prefix: prefix.into(),
            nodes: Vec::new(),
            extensions: Vec::new(),
        }
    }

    /// Adds a top-level data node (builder style).
    pub fn with_node(mut self, node: SchemaNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Attaches an extension statement (builder style).
    pub fn with_extension(mut self, keyword: impl Into<String>, arg: impl Into<String>) -> Self {
        self.extensions.push((keyword.into(), arg.into()));
        self
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace URI.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Preferred prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Top-level data nodes.
    pub fn nodes(&self) -> &[SchemaNode] {
        &self.nodes
    }

    /// Extension statements.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }
}

/// YANG data-node kinds.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Interior node; `presence` containers carry meaning by existing.
    Container {
        /// Presence container flag.
        presence: bool,
    },
    /// Keyed list of entries.
    List {
        /// Key leaf names in order.
        keys: Vec<String>,
        /// Minimum entry count.
        min_elements: Option<u64>,
        /// Maximum entry count.
        max_elements: Option<u64>,
        /// `unique` constraint groups; each group names descendant leaves.
        unique: Vec<Vec<String>>,
    },
    /// Single typed leaf.
    Leaf {
        /// Value type.
        ty: LeafType,
        /// Must be present under its parent.
        mandatory: bool,
        /// Default value, if any.
        default: Option<String>,
    },
    /// Multi-valued typed leaf.
    LeafList {
        /// Value type.
        ty: LeafType,
        /// Minimum entry count.
        min_elements: Option<u64>,
        /// Maximum entry count.
        max_elements: Option<u64>,
    },
    /// Choice between cases; children of a choice node are its cases.
    Choice {
        /// One case must be present.
        mandatory: bool,
    },
    /// A case inside a choice; transparent in data trees.
    Case,
}

/// A `must` constraint with optional error overrides.
#[derive(Debug, Clone)]
pub struct MustConstraint {
    /// The predicate.
    pub expr: PathExpr,
    /// Overrides the generated `error-app-tag`.
    pub error_app_tag: Option<String>,
    /// Overrides the generated `error-message`.
    pub error_message: Option<String>,
}

/// One node in the schema tree.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    name: String,
    kind: NodeKind,
    config: bool,
    when: Option<PathExpr>,
    musts: Vec<MustConstraint>,
    children: Vec<SchemaNode>,
    extensions: Vec<(String, String)>,
}

impl SchemaNode {
    fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            config: true,
            when: None,
            musts: Vec::new(),
            children: Vec::new(),
            extensions: Vec::new(),
        }
    }

    /// Creates a container node.
    pub fn container(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Container { presence: false })
    }

    /// Creates a presence container node.
    pub fn presence_container(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Container { presence: true })
    }

    /// Creates a list node with the given key leaves.
    pub fn list<I, S>(name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            NodeKind::List {
                keys: keys.into_iter().map(Into::into).collect(),
                min_elements: None,
                max_elements: None,
                unique: Vec::new(),
            },
        )
    }

    /// Creates a leaf node.
    pub fn leaf(name: impl Into<String>, ty: LeafType) -> Self {
        Self::new(
            name,
            NodeKind::Leaf {
                ty,
                mandatory: false,
                default: None,
            },
        )
    }

    /// Creates a leaf-list node.
    pub fn leaf_list(name: impl Into<String>, ty: LeafType) -> Self {
        Self::new(
            name,
            NodeKind::LeafList {
                ty,
                min_elements: None,
                max_elements: None,
            },
        )
    }

    /// Creates a choice node; add cases with [`SchemaNode::with_child`].
    pub fn choice(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Choice { mandatory: false })
    }

    /// Creates a case node.
    pub fn case(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Case)
    }

    /// Adds a child node (builder style).
    pub fn with_child(mut self, child: SchemaNode) -> Self {
        self.children.push(child);
        self
    }

    /// Marks a leaf or choice mandatory.
    pub fn mandatory(mut self) -> Self {
        match &mut self.kind {
            NodeKind::Leaf { mandatory, .. } | NodeKind::Choice { mandatory } => *mandatory = true,
            _ => {}
        }
        self
    }

    /// Sets the default value on a leaf.
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        if let NodeKind::Leaf { default, .. } = &mut self.kind {
            *default = Some(value.into());
        }
        self
    }

    /// Sets `min-elements` on a list or leaf-list.
    pub fn with_min_elements(mut self, min: u64) -> Self {
        match &mut self.kind {
            NodeKind::List { min_elements, .. } | NodeKind::LeafList { min_elements, .. } => {
                *min_elements = Some(min)
            }
            _ => {}
        }
        self
    }

    /// Sets `max-elements` on a list or leaf-list.
    pub fn with_max_elements(mut self, max: u64) -> Self {
        match &mut self.kind {
            NodeKind::List { max_elements, .. } | NodeKind::LeafList { max_elements, .. } => {
                *max_elements = Some(max)
            }
            _ => {}
        }
        self
    }

    /// Adds a `unique` constraint group on a list.
    pub fn with_unique<I, S>(mut self, leaves: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let NodeKind::List { unique, .. } = &mut self.kind {
            unique.push(leaves.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Attaches a `when` predicate.
    pub fn with_when(mut self, expr: PathExpr) -> Self {
        self.when = Some(expr);
        self
    }

    /// Attaches a `must` constraint.
    pub fn with_must(mut self, must: MustConstraint) -> Self {
        self.musts.push(must);
        self
    }

    /// Marks the subtree as state (non-config) data.
    pub fn state(mut self) -> Self {
        self.config = false;
        self
    }

    /// Attaches an extension statement (builder style).
    pub fn with_extension(mut self, keyword: impl Into<String>, arg: impl Into<String>) -> Self {
        self.extensions.push((keyword.into(), arg.into()));
        self
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node kind.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// True for configuration data, false for state data.
    pub fn is_config(&self) -> bool {
        self.config
    }

    /// The `when` predicate, if any.
    pub fn when(&self) -> Option<&PathExpr> {
        self.when.as_ref()
    }

    /// The `must` constraints.
    pub fn musts(&self) -> &[MustConstraint] {
        &self.musts
    }

    /// Child nodes (cases for a choice).
    pub fn children(&self) -> &[SchemaNode] {
        &self.children
    }

    /// Extension statements.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }

    /// Data child by name, descending transparently through choice/case.
    pub fn find_data_child(&self, name: &str) -> Option<&SchemaNode> {
        find_data_child(&self.children, name)
    }

    /// List key names; empty for non-lists.
    pub fn keys(&self) -> &[String] {
        match &self.kind {
            NodeKind::List { keys, .. } => keys,
            _ => &[],
        }
    }

    /// True if entries of this node can repeat under one parent.
    pub fn is_multi(&self) -> bool {
        matches!(self.kind, NodeKind::List { .. } | NodeKind::LeafList { .. })
    }
}

/// Resolves a data child by name through any choice/case layers.
pub(crate) fn find_data_child<'a>(
    children: &'a [SchemaNode],
    name: &str,
) -> Option<&'a SchemaNode> {
    for child in children {
        match child.kind {
            NodeKind::Choice { .. } | NodeKind::Case => {
                if let Some(found) = find_data_child(&child.children, name) {
                    return Some(found);
                }
            }
            _ => {
                if child.name == name {
                    return Some(child);
                }
            }
        }
    }
    None
}

/// YANG leaf value types with their restrictions.
#[derive(Debug, Clone)]
pub enum LeafType {
    /// String with optional length bounds and a glob-style pattern
    /// (`*` and `?` wildcards).
    String {
        /// Minimum length in characters.
        min_len: Option<u64>,
        /// Maximum length in characters.
        max_len: Option<u64>,
        /// Wildcard pattern the value must match.
        pattern: Option<String>,
    },
    /// Signed integer with range bounds.
    Int {
        /// Lower bound, inclusive.
        min: i64,
        /// Upper bound, inclusive.
        max: i64,
    },
    /// Unsigned integer with range bounds.
    Uint {
        /// Lower bound, inclusive.
        min: u64,
        /// Upper bound, inclusive.
        max: u64,
    },
    /// `true` or `false`.
    Boolean,
    /// One of a fixed set of names.
    Enumeration(Vec<String>),
    /// Reference to another leaf; the target instance must exist.
    Leafref {
        /// Path to the referenced leaf.
        path: String,
    },
    /// First member type that accepts the value wins.
    Union(Vec<LeafType>),
    /// Valueless leaf.
    Empty,
}

impl LeafType {
    /// Unrestricted string.
    pub fn string() -> Self {
        LeafType::String {
            min_len: None,
            max_len: None,
            pattern: None,
        }
    }

    /// String with length bounds.
    pub fn string_len(min_len: u64, max_len: u64) -> Self {
        LeafType::String {
            min_len: Some(min_len),
            max_len: Some(max_len),
            pattern: None,
        }
    }

    /// String constrained by a wildcard pattern.
    pub fn string_pattern(pattern: impl Into<String>) -> Self {
        LeafType::String {
            min_len: None,
            max_len: None,
            pattern: Some(pattern.into()),
        }
    }

    /// Full-range int32.
    pub fn int32() -> Self {
        LeafType::Int {
            min: i32::MIN as i64,
            max: i32::MAX as i64,
        }
    }

    /// Signed integer with an explicit range.
    pub fn int_range(min: i64, max: i64) -> Self {
        LeafType::Int { min, max }
    }

    /// Full-range uint8.
    pub fn uint8() -> Self {
        LeafType::Uint {
            min: 0,
            max: u8::MAX as u64,
        }
    }

    /// Full-range uint16.
    pub fn uint16() -> Self {
        LeafType::Uint {
            min: 0,
            max: u16::MAX as u64,
        }
    }

    /// Full-range uint32.
    pub fn uint32() -> Self {
        LeafType::Uint {
            min: 0,
            max: u32::MAX as u64,
        }
    }

    /// Unsigned integer with an explicit range.
    pub fn uint_range(min: u64, max: u64) -> Self {
        LeafType::Uint { min, max }
    }

    /// Enumeration from string names.
    pub fn enumeration<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LeafType::Enumeration(names.into_iter().map(Into::into).collect())
    }

    /// Leafref to the given path.
    pub fn leafref(path: impl Into<String>) -> Self {
        LeafType::Leafref { path: path.into() }
    }

    /// Checks a value against this type.
    ///
    /// Leafref existence is checked by the validator against the full tree;
    /// here a leafref only requires a non-empty value.
    pub fn check(&self, value: &str) -> Result<(), String> {
        match self {
            LeafType::String {
                min_len,
                max_len,
                pattern,
            } => {
                let len = value.chars().count() as u64;
                if let Some(min) = min_len {
                    if len < *min {
                        return Err(format!("length {len} below minimum {min}"));
                    }
                }
                if let Some(max) = max_len {
                    if len > *max {
                        return Err(format!("length {len} above maximum {max}"));
                    }
                }
                if let Some(pattern) = pattern {
                    if !wildcard_match(pattern, value) {
                        return Err(format!("'{value}' does not match pattern '{pattern}'"));
                    }
                }
                Ok(())
            }
            LeafType::Int { min, max } => match value.parse::<i64>() {
                Ok(v) if v >= *min && v <= *max => Ok(()),
                Ok(v) => Err(format!("{v} out of range {min}..{max}")),
                Err(_) => Err(format!("'{value}' is not an integer")),
            },
            LeafType::Uint { min, max } => match value.parse::<u64>() {
                Ok(v) if v >= *min && v <= *max => Ok(()),
                Ok(v) => Err(format!("{v} out of range {min}..{max}")),
                Err(_) => Err(format!("'{value}' is not an unsigned integer")),
            },
            LeafType::Boolean => match value {
                "true" | "false" => Ok(()),
                _ => Err(format!("'{value}' is not a boolean")),
            },
            LeafType::Enumeration(names) => {
                if names.iter().any(|n| n == value) {
                    Ok(())
                } else {
                    Err(format!("'{value}' is not one of the enumeration"))
                }
            }
            LeafType::Leafref { .. } => {
                if value.is_empty() {
                    Err("leafref value is empty".to_string())
                } else {
                    Ok(())
                }
            }
            LeafType::Union(members) => {
                if members.iter().any(|m| m.check(value).is_ok()) {
                    Ok(())
                } else {
                    Err(format!("'{value}' matches no member type"))
                }
            }
            LeafType::Empty => {
                if value.is_empty() {
                    Ok(())
                } else {
                    Err("empty leaf carries a value".to_string())
                }
            }
        }
    }
}

impl fmt::Display for LeafType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeafType::String { .. } => "string",
            LeafType::Int { .. } => "int",
            LeafType::Uint { .. } => "uint",
            LeafType::Boolean => "boolean",
            LeafType::Enumeration(_) => "enumeration",
            LeafType::Leafref { .. } => "leafref",
            LeafType::Union(_) => "union",
            LeafType::Empty => "empty",
        };
        f.write_str(name)
    }
}

/// Glob-style matcher supporting `*` and `?`.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    wildcard_match_at(&p, &v)
}

fn wildcard_match_at(p: &[char], v: &[char]) -> bool {
    match (p.first(), v.first()) {
        (None, None) => true,
        (Some('*'), _) => {
            wildcard_match_at(&p[1..], v) || (!v.is_empty() && wildcard_match_at(p, &v[1..]))
        }
        (Some('?'), Some(_)) => wildcard_match_at(&p[1..], &v[1..]),
        (Some(pc), Some(vc)) if pc == vc => wildcard_match_at(&p[1..], &v[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_top_by_namespace() {
        let schema = Schema::new().with_module(
            Module::new("example", "urn:ex", "ex")
                .with_node(SchemaNode::leaf("x", LeafType::int32())),
        );
        assert!(schema.find_top(Some("urn:ex"), "x").is_some());
        assert!(schema.find_top(Some("urn:other"), "x").is_none());
        assert!(schema.find_top(None, "x").is_some());
    }

    #[test]
    fn test_choice_transparent_lookup() {
        let node = SchemaNode::container("transport").with_child(
            SchemaNode::choice("kind")
                .with_child(
                    SchemaNode::case("tcp")
                        .with_child(SchemaNode::leaf("tcp-port", LeafType::uint16())),
                )
                .with_child(
                    SchemaNode::case("tls")
                        .with_child(SchemaNode::leaf("tls-port", LeafType::uint16())),
                ),
        );
        assert!(node.find_data_child("tcp-port").is_some());
        assert!(node.find_data_child("tls-port").is_some());
        assert!(node.find_data_child("kind").is_none());
    }

    #[test]
    fn test_leaf_type_int_range() {
        let ty = LeafType::int_range(1, 10);
        assert!(ty.check("5").is_ok());
        assert!(ty.check("0").is_err());
        assert!(ty.check("11").is_err());
        assert!(ty.check("abc").is_err());
    }

    #[test]
    fn test_leaf_type_string_restrictions() {
        let ty = LeafType::string_len(2, 4);
        assert!(ty.check("ab").is_ok());
        assert!(ty.check("a").is_err());
        assert!(ty.check("abcde").is_err());

        let pat = LeafType::string_pattern("eth*");
        assert!(pat.check("eth0").is_ok());
        assert!(pat.check("lo").is_err());
    }

    #[test]
    fn test_leaf_type_union() {
        let ty = LeafType::Union(vec![LeafType::uint16(), LeafType::enumeration(["auto"])]);
        assert!(ty.check("80").is_ok());
        assert!(ty.check("auto").is_ok());
        assert!(ty.check("fast").is_err());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "ac"));
        assert!(wildcard_match("ietf-*", "ietf-netconf"));
    }

    #[test]
    fn test_list_builders() {
        let node = SchemaNode::list("server", ["name"])
            .with_min_elements(1)
            .with_max_elements(8)
            .with_unique(["port"]);
        match node.kind() {
            NodeKind::List {
                keys,
                min_elements,
                max_elements,
                unique,
            } => {
                assert_eq!(keys, &["name".to_string()]);
                assert_eq!(*min_elements, Some(1));
                assert_eq!(*max_elements, Some(8));
                assert_eq!(unique.len(), 1);
            }
            _ => panic!("expected list"),
        }
    }
}
