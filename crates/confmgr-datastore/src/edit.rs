//! NETCONF `edit-config` operation semantics.
//!
//! [`apply_edit`] folds an edit payload into a target tree. The default
//! operation applies to every node; a per-element `operation` attribute
//! overrides it for that node and becomes the default for its descendants.
//! Siblings are matched by name and namespace; when the schema identifies
//! list keys, entries are matched on key values instead.

use std::str::FromStr;

use confmgr_common::netconf::RpcError;
use confmgr_common::BackendError;
use confmgr_types::XmlNode;
use confmgr_yang::{Schema, SchemaNode};

/// The `edit-config` operations of RFC 6241 §7.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditOp {
    /// Add or update without removing siblings.
    #[default]
    Merge,
    /// Substitute the whole subtree.
    Replace,
    /// Fail with `data-exists` if the node is already present.
    Create,
    /// Fail with `data-missing` if the node is absent.
    Delete,
    /// Delete without the `data-missing` error.
    Remove,
    /// Touch nothing; only explicit descendant operations act.
    None,
}

impl EditOp {
    /// Returns the wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            EditOp::Merge => "merge",
            EditOp::Replace => "replace",
            EditOp::Create => "create",
            EditOp::Delete => "delete",
            EditOp::Remove => "remove",
            EditOp::None => "none",
        }
    }
}

impl FromStr for EditOp {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(EditOp::Merge),
            "replace" => Ok(EditOp::Replace),
            "create" => Ok(EditOp::Create),
            "delete" => Ok(EditOp::Delete),
            "remove" => Ok(EditOp::Remove),
            "none" => Ok(EditOp::None),
            other => Err(BackendError::config(
                "default-operation",
                format!("unknown edit operation '{other}'"),
            )),
        }
    }
}

/// Applies the children of `payload` to `target` under `default_op`.
///
/// `target` is the datastore root element; `payload` is the `<config>`
/// element of the request. The schema, when present, drives list-entry
/// matching by key.
pub fn apply_edit(
    target: &mut XmlNode,
    payload: &XmlNode,
    default_op: EditOp,
    schema: Option<&Schema>,
) -> Result<(), RpcError> {
    for edit in payload.children() {
        let snode = schema.and_then(|s| s.find_top(edit.namespace(), edit.name()));
        apply_one(target, edit, default_op, snode)?;
    }
    Ok(())
}

fn apply_one(
    parent: &mut XmlNode,
    edit: &XmlNode,
    inherited_op: EditOp,
    snode: Option<&SchemaNode>,
) -> Result<(), RpcError> {
    let op = match edit.attr("operation") {
        Some(raw) => raw
            .parse()
            .map_err(|_| RpcError::bad_attribute(
                confmgr_common::netconf::ErrorType::Protocol,
                "operation",
                edit.name(),
                format!("unknown operation '{raw}'"),
            ))?,
        None => inherited_op,
    };

    let existing_idx = find_match(parent, edit, snode);

    match op {
        EditOp::Create => {
            if existing_idx.is_some() {
                return Err(RpcError::data_exists(format!(
                    "<{}> already exists",
                    edit.name()
                )));
            }
            parent.push(strip_operations(edit));
            Ok(())
        }
        EditOp::Delete => match existing_idx {
            Some(idx) => {
                parent.children_mut().remove(idx);
                Ok(())
            }
            None => Err(RpcError::data_missing(
                None,
                format!("<{}> does not exist", edit.name()),
            )),
        },
        EditOp::Remove => {
            if let Some(idx) = existing_idx {
                parent.children_mut().remove(idx);
            }
            Ok(())
        }
        EditOp::Replace => {
            if let Some(idx) = existing_idx {
                parent.children_mut().remove(idx);
            }
            parent.push(strip_operations(edit));
            Ok(())
        }
        EditOp::Merge => match existing_idx {
            Some(idx) => {
                if edit.children().is_empty() {
                    // Leaf update; body replaces the stored value.
                    let slot = &mut parent.children_mut()[idx];
                    slot.set_body(edit.body().map(str::to_string));
                    Ok(())
                } else {
                    descend(parent, idx, edit, EditOp::Merge, snode)
                }
            }
            None => {
                parent.push(strip_operations(edit));
                Ok(())
            }
        },
        EditOp::None => match existing_idx {
            Some(idx) => descend(parent, idx, edit, EditOp::None, snode),
            // Nothing to navigate into; explicit descendant operations
            // under a missing branch have no effect.
            None => Ok(()),
        },
    }
}

fn descend(
    parent: &mut XmlNode,
    idx: usize,
    edit: &XmlNode,
    op: EditOp,
    snode: Option<&SchemaNode>,
) -> Result<(), RpcError> {
    // Children are processed against the matched existing node; the edit's
    // key leaves are skipped so merge does not re-write them.
    let keys: Vec<String> = snode.map(|s| s.keys().to_vec()).unwrap_or_default();
    let slot = &mut parent.children_mut()[idx];
    for child in edit.children() {
        if keys.iter().any(|k| k == child.name()) && child.attr("operation").is_none() {
            continue;
        }
        let child_snode = snode.and_then(|s| s.find_data_child(child.name()));
        apply_one(slot, child, op, child_snode)?;
    }
    Ok(())
}

/// Index of the sibling of `parent` that `edit` addresses, if any.
fn find_match(parent: &XmlNode, edit: &XmlNode, snode: Option<&SchemaNode>) -> Option<usize> {
    let keys = snode.map(|s| s.keys()).unwrap_or(&[]);
    parent.children().iter().position(|candidate| {
        if candidate.name() != edit.name() || candidate.namespace() != edit.namespace() {
            return false;
        }
        if keys.is_empty() {
            return true;
        }
        keys.iter()
            .all(|key| candidate.find_body(key) == edit.find_body(key))
    })
}

/// Deep copy without `operation` attributes.
fn strip_operations(node: &XmlNode) -> XmlNode {
    let mut copy = node.clone();
    strip_in_place(&mut copy);
    copy
}

fn strip_in_place(node: &mut XmlNode) {
    node.remove_attr("operation");
    for child in node.children_mut() {
        strip_in_place(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confmgr_common::netconf::ErrorTag;
    use confmgr_types::parse_xml;
    use confmgr_yang::{LeafType, Module, SchemaNode};
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::new().with_module(
            Module::new("srv", "urn:srv", "srv").with_node(
                SchemaNode::container("servers").with_child(
                    SchemaNode::list("server", ["name"])
                        .with_child(SchemaNode::leaf("name", LeafType::string()))
                        .with_child(SchemaNode::leaf("port", LeafType::uint16())),
                ),
            ),
        )
    }

    fn root(s: &str) -> XmlNode {
        parse_xml(s).unwrap()
    }

    #[test]
    fn test_merge_adds_without_removing() {
        let mut target = root(r#"<config><x xmlns="urn:ex">1</x></config>"#);
        let payload = root(r#"<config><y xmlns="urn:ex">2</y></config>"#);
        apply_edit(&mut target, &payload, EditOp::Merge, None).unwrap();
        assert_eq!(target.find_body("x"), Some("1"));
        assert_eq!(target.find_body("y"), Some("2"));
    }

    #[test]
    fn test_merge_updates_leaf() {
        let mut target = root(r#"<config><x xmlns="urn:ex">1</x></config>"#);
        let payload = root(r#"<config><x xmlns="urn:ex">7</x></config>"#);
        apply_edit(&mut target, &payload, EditOp::Merge, None).unwrap();
        assert_eq!(target.find_body("x"), Some("7"));
        assert_eq!(target.children().len(), 1);
    }

    #[test]
    fn test_merge_matches_list_entry_by_key() {
        let mut target = root(
            r#"<config><servers xmlns="urn:srv">
               <server><name>a</name><port>80</port></server>
               <server><name>b</name><port>81</port></server>
               </servers></config>"#,
        );
        let payload = root(
            r#"<config><servers xmlns="urn:srv">
               <server><name>b</name><port>8080</port></server>
               </servers></config>"#,
        );
        let schema = schema();
        apply_edit(&mut target, &payload, EditOp::Merge, Some(&schema)).unwrap();
        let servers = target.find("servers").unwrap();
        assert_eq!(servers.children().len(), 2);
        let b = servers
            .find_all("server")
            .find(|s| s.find_body("name") == Some("b"))
            .unwrap();
        assert_eq!(b.find_body("port"), Some("8080"));
    }

    #[test]
    fn test_create_fails_on_existing() {
        let mut target = root(r#"<config><x xmlns="urn:ex">1</x></config>"#);
        let payload = root(r#"<config><x xmlns="urn:ex">2</x></config>"#);
        let err = apply_edit(&mut target, &payload, EditOp::Create, None).unwrap_err();
        assert_eq!(err.tag(), ErrorTag::DataExists);
        assert_eq!(target.find_body("x"), Some("1"));
    }

    #[test]
    fn test_delete_fails_on_missing() {
        let mut target = root("<config/>");
        let payload = root(r#"<config><x xmlns="urn:ex">1</x></config>"#);
        let err = apply_edit(&mut target, &payload, EditOp::Delete, None).unwrap_err();
        assert_eq!(err.tag(), ErrorTag::DataMissing);
    }

    #[test]
    fn test_remove_is_silent_on_missing() {
        let mut target = root("<config/>");
        let payload = root(r#"<config><x xmlns="urn:ex">1</x></config>"#);
        apply_edit(&mut target, &payload, EditOp::Remove, None).unwrap();
        assert!(target.children().is_empty());
    }

    #[test]
    fn test_replace_substitutes_subtree() {
        let mut target = root(
            r#"<config><box xmlns="urn:ex"><a>1</a><b>2</b></box></config>"#,
        );
        let payload = root(r#"<config><box xmlns="urn:ex"><c>3</c></box></config>"#);
        apply_edit(&mut target, &payload, EditOp::Replace, None).unwrap();
        let bx = target.find("box").unwrap();
        assert!(bx.find("a").is_none());
        assert_eq!(bx.find_body("c"), Some("3"));
    }

    #[test]
    fn test_operation_attribute_overrides_default() {
        let mut target = root(
            r#"<config><box xmlns="urn:ex"><a>1</a><b>2</b></box></config>"#,
        );
        let payload = root(
            r#"<config><box xmlns="urn:ex"><a operation="delete"/><c>3</c></box></config>"#,
        );
        apply_edit(&mut target, &payload, EditOp::Merge, None).unwrap();
        let bx = target.find("box").unwrap();
        assert!(bx.find("a").is_none());
        assert_eq!(bx.find_body("b"), Some("2"));
        assert_eq!(bx.find_body("c"), Some("3"));
    }

    #[test]
    fn test_none_only_navigates() {
        let mut target = root(
            r#"<config><box xmlns="urn:ex"><a>1</a></box></config>"#,
        );
        let payload = root(
            r#"<config><box xmlns="urn:ex"><a operation="remove"/><b>9</b></box></config>"#,
        );
        apply_edit(&mut target, &payload, EditOp::None, None).unwrap();
        let bx = target.find("box").unwrap();
        assert!(bx.find("a").is_none(), "explicit remove applies");
        assert!(bx.find("b").is_none(), "plain children are untouched");
    }

    #[test]
    fn test_inserted_copies_lose_operation_attrs() {
        let mut target = root("<config/>");
        let payload = root(
            r#"<config><box xmlns="urn:ex" operation="create"><a>1</a></box></config>"#,
        );
        apply_edit(&mut target, &payload, EditOp::Merge, None).unwrap();
        assert!(target.find("box").unwrap().attr("operation").is_none());
    }

    #[test]
    fn test_bad_operation_attribute() {
        let mut target = root("<config/>");
        let payload = root(r#"<config><x xmlns="urn:ex" operation="explode">1</x></config>"#);
        let err = apply_edit(&mut target, &payload, EditOp::Merge, None).unwrap_err();
        assert_eq!(err.tag(), ErrorTag::BadAttribute);
    }
}
