//! Configuration tree validation against a loaded schema.
//!
//! [`validate`] walks a datastore tree in document order, pairing each
//! element with its schema node and collecting NETCONF error fragments for
//! every violation. Errors are collected up to [`MAX_VALIDATION_ERRORS`]
//! rather than short-circuiting on the first failure.

use confmgr_common::netconf::{ErrorType, RpcError};
use confmgr_types::{DataPath, XmlNode};

use crate::schema::{LeafType, NodeKind, Schema, SchemaNode};

/// Collection cap; validation stops reporting once reached.
pub const MAX_VALIDATION_ERRORS: usize = 32;

/// Validates a datastore root (e.g. `<config>`) against the schema.
///
/// Returns all violations found, in document order.
pub fn validate(root: &XmlNode, schema: &Schema) -> Result<(), Vec<RpcError>> {
    let mut v = Validator {
        schema,
        root,
        errors: Vec::new(),
    };
    for child in root.children() {
        if v.capped() {
            break;
        }
        v.validate_top(child);
    }
    if v.errors.is_empty() {
        Ok(())
    } else {
        Err(v.errors)
    }
}

struct Validator<'a> {
    schema: &'a Schema,
    root: &'a XmlNode,
    errors: Vec<RpcError>,
}

impl<'a> Validator<'a> {
    fn capped(&self) -> bool {
        self.errors.len() >= MAX_VALIDATION_ERRORS
    }

    fn push(&mut self, err: RpcError) {
        if !self.capped() {
            self.errors.push(err);
        }
    }

    fn validate_top(&mut self, node: &XmlNode) {
        if let Some(ns) = node.namespace() {
            if self.schema.module_by_namespace(ns).is_none() {
                self.push(RpcError::unknown_namespace(
                    ErrorType::Application,
                    ns,
                    format!("no module covers namespace of <{}>", node.name()),
                ));
                return;
            }
        }
        match self.schema.find_top(node.namespace(), node.name()) {
            Some(snode) => {
                let path = format!("/{}", node.name());
                self.validate_node(node, snode, &path);
            }
            None => self.push(
                RpcError::unknown_element(
                    ErrorType::Application,
                    node.name(),
                    format!("failed to find schema node for <{}>", node.name()),
                )
                .with_path(format!("/{}", node.name())),
            ),
        }
    }

    fn validate_node(&mut self, node: &XmlNode, snode: &SchemaNode, path: &str) {
        if self.capped() {
            return;
        }

        if let Some(when) = snode.when() {
            if !when.eval(node, self.root) {
                self.push(
                    RpcError::operation_failed(
                        ErrorType::Application,
                        format!("when condition '{}' is false", when),
                    )
                    .with_path(path),
                );
            }
        }
        for must in snode.musts() {
            if !must.expr.eval(node, self.root) {
                let message = must
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("must condition '{}' is false", must.expr));
                let mut err =
                    RpcError::operation_failed(ErrorType::Application, message).with_path(path);
                if let Some(app_tag) = &must.error_app_tag {
                    err = err.with_app_tag(app_tag.clone());
                }
                self.push(err);
            }
        }

        match snode.kind() {
            NodeKind::Leaf { ty, .. } => {
                self.validate_leaf_shape(node, path);
                self.check_leaf_value(node, snode, ty, path);
            }
            NodeKind::LeafList { ty, .. } => {
                self.validate_leaf_shape(node, path);
                self.check_leaf_value(node, snode, ty, path);
            }
            NodeKind::Container { .. } | NodeKind::List { .. } => {
                if node.body().is_some() {
                    self.push(
                        RpcError::invalid_value(
                            ErrorType::Application,
                            format!("interior node <{}> carries text", node.name()),
                        )
                        .with_info(XmlNode::new("bad-element").with_body(node.name()))
                        .with_path(path),
                    );
                }
                if let NodeKind::List { keys, .. } = snode.kind() {
                    for key in keys {
                        if node.find_body(key).is_none() {
                            self.push(
                                RpcError::missing_element(
                                    ErrorType::Application,
                                    key,
                                    format!("list <{}> entry without key <{}>", node.name(), key),
                                )
                                .with_path(path),
                            );
                        }
                    }
                }
                self.validate_children(node, snode, path);
            }
            // Choice and case never appear as data elements.
            NodeKind::Choice { .. } | NodeKind::Case => self.push(
                RpcError::unknown_element(
                    ErrorType::Application,
                    node.name(),
                    "choice and case names do not occur in data trees",
                )
                .with_path(path),
            ),
        }
    }

    fn validate_leaf_shape(&mut self, node: &XmlNode, path: &str) {
        if !node.children().is_empty() {
            self.push(
                RpcError::invalid_value(
                    ErrorType::Application,
                    format!("leaf <{}> has child elements", node.name()),
                )
                .with_info(XmlNode::new("bad-element").with_body(node.name()))
                .with_path(path),
            );
        }
    }

    fn check_leaf_value(&mut self, node: &XmlNode, snode: &SchemaNode, ty: &LeafType, path: &str) {
        let value = node.body().unwrap_or_default();
        if let Err(reason) = ty.check(value) {
            self.push(
                RpcError::invalid_value(ErrorType::Application, reason)
                    .with_info(XmlNode::new("bad-element").with_body(snode.name()))
                    .with_path(path),
            );
            return;
        }
        if let LeafType::Leafref { path: target } = ty {
            self.check_leafref(value, target, path);
        }
    }

    fn check_leafref(&mut self, value: &str, target: &str, path: &str) {
        let resolved = match DataPath::parse(target) {
            Ok(p) => p
                .resolve(self.root)
                .iter()
                .any(|n| n.body() == Some(value)),
            Err(_) => false,
        };
        if !resolved {
            self.push(
                RpcError::data_missing(
                    None,
                    format!("leafref target '{value}' not found under '{target}'"),
                )
                .with_app_tag("instance-required")
                .with_path(path),
            );
        }
    }

    fn validate_children(&mut self, node: &XmlNode, snode: &SchemaNode, path: &str) {
        // Per-child walk in document order.
        for child in node.children() {
            if self.capped() {
                return;
            }
            match snode.find_data_child(child.name()) {
                Some(child_snode) => {
                    let child_path = entry_path(path, child, child_snode);
                    self.validate_node(child, child_snode, &child_path);
                }
                None => self.push(
                    RpcError::unknown_element(
                        ErrorType::Application,
                        child.name(),
                        format!("failed to find schema node for <{}>", child.name()),
                    )
                    .with_path(format!("{}/{}", path, child.name())),
                ),
            }
        }

        // Structural checks driven by the schema side.
        self.check_structure(node, snode, path);
    }

    fn check_structure(&mut self, node: &XmlNode, snode: &SchemaNode, path: &str) {
        for schild in snode.children() {
            if self.capped() {
                return;
            }
            match schild.kind() {
                NodeKind::Leaf { mandatory, .. } => {
                    if *mandatory && node.find(schild.name()).is_none() {
                        self.push(
                            RpcError::data_missing(
                                None,
                                format!("mandatory node <{}> is missing", schild.name()),
                            )
                            .with_path(format!("{}/{}", path, schild.name())),
                        );
                    }
                }
                NodeKind::List {
                    keys,
                    min_elements,
                    max_elements,
                    unique,
                } => {
                    let entries: Vec<&XmlNode> = node.find_all(schild.name()).collect();
                    self.check_cardinality(
                        &entries,
                        *min_elements,
                        *max_elements,
                        &format!("{}/{}", path, schild.name()),
                    );
                    // Keys behave as an implicit unique group.
                    if !keys.is_empty() {
                        self.check_unique(&entries, keys, path, schild);
                    }
                    for group in unique {
                        self.check_unique(&entries, group, path, schild);
                    }
                }
                NodeKind::LeafList {
                    min_elements,
                    max_elements,
                    ..
                } => {
                    let entries: Vec<&XmlNode> = node.find_all(schild.name()).collect();
                    self.check_cardinality(
                        &entries,
                        *min_elements,
                        *max_elements,
                        &format!("{}/{}", path, schild.name()),
                    );
                }
                NodeKind::Choice { mandatory } => {
                    if *mandatory && !choice_satisfied(node, schild) {
                        self.push(RpcError::data_missing(
                            Some(schild.name()),
                            format!("mandatory choice <{}> unsatisfied", schild.name()),
                        ));
                    }
                }
                NodeKind::Container { .. } | NodeKind::Case => {}
            }
        }
    }

    fn check_cardinality(
        &mut self,
        entries: &[&XmlNode],
        min: Option<u64>,
        max: Option<u64>,
        list_path: &str,
    ) {
        let count = entries.len() as u64;
        if let Some(min) = min {
            if count < min {
                self.push(RpcError::minmax_elements(list_path, false));
            }
        }
        if let Some(max) = max {
            if count > max {
                self.push(RpcError::minmax_elements(list_path, true));
            }
        }
    }

    fn check_unique(
        &mut self,
        entries: &[&XmlNode],
        leaves: &[String],
        parent_path: &str,
        snode: &SchemaNode,
    ) {
        let mut seen: Vec<(Vec<&str>, &XmlNode)> = Vec::new();
        for &entry in entries {
            let values: Option<Vec<&str>> =
                leaves.iter().map(|leaf| entry.find_body(leaf)).collect();
            // Entries missing any of the leaves do not participate.
            let Some(values) = values else { continue };
            let dup = seen.iter().find(|(v, _)| *v == values).map(|(_, n)| *n);
            if let Some(first) = dup {
                let offenders: Vec<String> = [first, entry]
                    .iter()
                    .map(|e| {
                        let base = entry_path(parent_path, e, snode);
                        leaves
                            .iter()
                            .map(|leaf| format!("{base}/{leaf}"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .collect();
                self.push(RpcError::data_not_unique(offenders));
            } else {
                seen.push((values, entry));
            }
        }
    }
}

/// Path for one element, adding key predicates for list entries.
fn entry_path(parent_path: &str, node: &XmlNode, snode: &SchemaNode) -> String {
    let mut path = format!("{}/{}", parent_path, node.name());
    for key in snode.keys() {
        if let Some(value) = node.find_body(key) {
            path.push_str(&format!("[{key}='{value}']"));
        }
    }
    path
}

fn choice_satisfied(node: &XmlNode, choice: &SchemaNode) -> bool {
    choice.children().iter().any(|case| {
        let data_nodes: &[SchemaNode] = match case.kind() {
            NodeKind::Case => case.children(),
            _ => std::slice::from_ref(case),
        };
        data_nodes
            .iter()
            .any(|dn| node.find(dn.name()).is_some())
    })
}
