//! The commit engine: validate, diff, plugin chain, promote.
//!
//! A commit moves the candidate (or another source store) into running in a
//! fixed order; any failing step aborts the rest and leaves running at the
//! pre-commit image. Plugins whose `commit` already succeeded are unwound
//! with `abort` in reverse registration order.

use tracing::{error, info, warn};

use confmgr_common::netconf::{ErrorType, RpcError};
use confmgr_types::XmlNode;
use confmgr_yang::{validate, Schema, SchemaNode};

use crate::backend::Backend;
use crate::event::CommitNotification;

/// One changed node: its path plus the before and after images.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    /// Data path of the changed node.
    pub path: String,
    /// Subtree before the change; `None` for additions.
    pub before: Option<XmlNode>,
    /// Subtree after the change; `None` for deletions.
    pub after: Option<XmlNode>,
}

impl DiffEntry {
    /// True for an added subtree.
    pub fn is_add(&self) -> bool {
        self.before.is_none()
    }

    /// True for a deleted subtree.
    pub fn is_delete(&self) -> bool {
        self.after.is_none()
    }

    /// True for a value change.
    pub fn is_change(&self) -> bool {
        self.before.is_some() && self.after.is_some()
    }
}

/// A configuration transaction handed to plugin callbacks.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Source datastore name.
    pub source: String,
    /// Target datastore name.
    pub target: String,
    /// Changes in document order of the source tree.
    pub diff: Vec<DiffEntry>,
}

impl Transaction {
    /// A transaction with no changes.
    pub fn empty(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            diff: Vec::new(),
        }
    }

    /// True when the diff is empty.
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    /// The changed paths, in order.
    pub fn changed_paths(&self) -> Vec<String> {
        self.diff.iter().map(|d| d.path.clone()).collect()
    }
}

/// Computes the difference between two datastore trees.
///
/// Entries are reported as (path, before, after): additions carry no
/// `before`, deletions no `after`, leaf value changes both. Interior nodes
/// recurse; list entries are matched on their schema keys.
pub fn diff_trees(old: &XmlNode, new: &XmlNode, schema: &Schema) -> Vec<DiffEntry> {
    let mut out = Vec::new();
    diff_level(old, new, None, schema, "", &mut out);
    out
}

fn diff_level(
    old: &XmlNode,
    new: &XmlNode,
    snode: Option<&SchemaNode>,
    schema: &Schema,
    path: &str,
    out: &mut Vec<DiffEntry>,
) {
    let mut matched_new: Vec<bool> = vec![false; new.children().len()];

    for old_child in old.children() {
        let child_snode = match snode {
            Some(s) => s.find_data_child(old_child.name()),
            None => schema.find_top(old_child.namespace(), old_child.name()),
        };
        let child_path = child_path(path, old_child, child_snode);
        let found = new.children().iter().enumerate().find(|(idx, candidate)| {
            !matched_new[*idx] && siblings_match(old_child, candidate, child_snode)
        });
        match found {
            Some((idx, new_child)) => {
                matched_new[idx] = true;
                if old_child.is_leaf() && new_child.is_leaf() {
                    if old_child.body() != new_child.body() {
                        out.push(DiffEntry {
                            path: child_path,
                            before: Some(old_child.clone()),
                            after: Some(new_child.clone()),
                        });
                    }
                } else {
                    diff_level(old_child, new_child, child_snode, schema, &child_path, out);
                }
            }
            None => out.push(DiffEntry {
                path: child_path,
                before: Some(old_child.clone()),
                after: None,
            }),
        }
    }

    for (idx, new_child) in new.children().iter().enumerate() {
        if matched_new[idx] {
            continue;
        }
        let child_snode = match snode {
            Some(s) => s.find_data_child(new_child.name()),
            None => schema.find_top(new_child.namespace(), new_child.name()),
        };
        out.push(DiffEntry {
            path: child_path(path, new_child, child_snode),
            before: None,
            after: Some(new_child.clone()),
        });
    }
}

fn siblings_match(a: &XmlNode, b: &XmlNode, snode: Option<&SchemaNode>) -> bool {
    if a.name() != b.name() || a.namespace() != b.namespace() {
        return false;
    }
    match snode.map(|s| s.keys()) {
        Some(keys) if !keys.is_empty() => keys
            .iter()
            .all(|key| a.find_body(key) == b.find_body(key)),
        _ => true,
    }
}

fn child_path(parent: &str, node: &XmlNode, snode: Option<&SchemaNode>) -> String {
    let mut path = format!("{}/{}", parent, node.name());
    if let Some(snode) = snode {
        for key in snode.keys() {
            if let Some(value) = node.find_body(key) {
                path.push_str(&format!("[{key}='{value}']"));
            }
        }
    }
    path
}

impl Backend {
    /// Validates a datastore against the loaded schema.
    pub(crate) fn validate_db(&mut self, db: &str) -> Result<XmlNode, Vec<RpcError>> {
        let tree = self
            .stores
            .get(db)
            .map_err(|e| vec![e.to_rpc_error()])?;
        validate(&tree, &self.schema)?;
        Ok(tree)
    }

    /// Runs the full commit transition from `source` into running.
    ///
    /// On success, returns the transaction and the pre-commit image of
    /// running; the caller hands the image to the confirmed-commit machine
    /// (or drops it for a plain commit).
    pub(crate) async fn candidate_commit(
        &mut self,
        source: &str,
    ) -> Result<(Transaction, XmlNode), Vec<RpcError>> {
        // 1. Snapshot running as the rollback image.
        self.stores
            .ensure("running")
            .map_err(|e| vec![e.to_rpc_error()])?;
        let rollback_image = self
            .stores
            .get("running")
            .map_err(|e| vec![e.to_rpc_error()])?;

        // 2. Validate the source.
        let candidate_tree = self.validate_db(source)?;

        // 3. Diff running against the source.
        let tx = Transaction {
            source: source.to_string(),
            target: "running".to_string(),
            diff: diff_trees(&rollback_image, &candidate_tree, &self.schema),
        };

        // 4. Inspection pass; a veto aborts before anything is applied.
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.pre_commit(&tx).await {
                let name = plugin.name().to_string();
                warn!(plugin = name.as_str(), error = %e, "pre-commit veto");
                return Err(vec![RpcError::operation_failed(
                    ErrorType::Application,
                    format!("{name}: {e}"),
                )]);
            }
        }

        // 5. Apply; remember which plugins succeeded for reverse unwind.
        let mut applied: Vec<usize> = Vec::new();
        let mut failure: Option<(String, String)> = None;
        for (idx, plugin) in self.plugins.iter_mut().enumerate() {
            match plugin.commit(&tx).await {
                Ok(()) => applied.push(idx),
                Err(e) => {
                    failure = Some((plugin.name().to_string(), e.to_string()));
                    break;
                }
            }
        }
        if let Some((name, reason)) = failure {
            self.abort_commit(&tx, &applied, &rollback_image).await;
            return Err(vec![RpcError::operation_failed(
                ErrorType::Application,
                format!("{name}: {reason}"),
            )]);
        }

        // 6. Promote: running becomes the source tree, candidate is reset
        //    from the new running.
        if let Err(e) = self.stores.put_tree("running", &candidate_tree) {
            self.abort_commit(&tx, &applied, &rollback_image).await;
            return Err(vec![e.to_rpc_error()]);
        }
        if source != "candidate" {
            if let Err(e) = self.stores.put_tree("candidate", &candidate_tree) {
                warn!(error = %e, "candidate reset after commit failed");
            }
        }

        // 7. Post-promotion notifications, best effort.
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.commit_done(&tx).await {
                warn!(plugin = plugin.name(), error = %e, "commit-done failed");
            }
        }

        // 8. Publish on the internal event stream.
        let _ = self.commit_events.send(CommitNotification {
            datastore: "running".to_string(),
            changed_paths: tx.changed_paths(),
        });

        // NACM rules may have changed with the config.
        self.rebuild_nacm();

        info!(source = source, changes = tx.diff.len(), "commit complete");
        Ok((tx, rollback_image))
    }

    /// Unwinds applied plugins in reverse order and restores running.
    pub(crate) async fn abort_commit(
        &mut self,
        tx: &Transaction,
        applied: &[usize],
        rollback_image: &XmlNode,
    ) {
        for &idx in applied.iter().rev() {
            if let Some(plugin) = self.plugins.get_mut(idx) {
                if let Err(e) = plugin.abort(tx).await {
                    error!(plugin = plugin.name(), error = %e, "abort callback failed");
                }
            }
        }
        if let Err(e) = self.stores.put_tree("running", rollback_image) {
            error!(error = %e, "failed to restore running from pre-commit image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confmgr_types::parse_xml;
    use confmgr_yang::{LeafType, Module, Schema, SchemaNode};
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::new().with_module(
            Module::new("srv", "urn:srv", "srv")
                .with_node(
                    SchemaNode::container("servers").with_child(
                        SchemaNode::list("server", ["name"])
                            .with_child(SchemaNode::leaf("name", LeafType::string()))
                            .with_child(SchemaNode::leaf("port", LeafType::uint16())),
                    ),
                )
                .with_node(SchemaNode::leaf("mode", LeafType::string())),
        )
    }

    #[test]
    fn test_diff_leaf_change() {
        let old = parse_xml(r#"<config><mode xmlns="urn:srv">a</mode></config>"#).unwrap();
        let new = parse_xml(r#"<config><mode xmlns="urn:srv">b</mode></config>"#).unwrap();
        let diff = diff_trees(&old, &new, &schema());
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "/mode");
        assert!(diff[0].is_change());
        assert_eq!(diff[0].before.as_ref().unwrap().body(), Some("a"));
        assert_eq!(diff[0].after.as_ref().unwrap().body(), Some("b"));
    }

    #[test]
    fn test_diff_add_and_delete_list_entries() {
        let old = parse_xml(
            r#"<config><servers xmlns="urn:srv">
               <server><name>a</name><port>80</port></server>
               <server><name>b</name><port>81</port></server>
               </servers></config>"#,
        )
        .unwrap();
        let new = parse_xml(
            r#"<config><servers xmlns="urn:srv">
               <server><name>b</name><port>81</port></server>
               <server><name>c</name><port>82</port></server>
               </servers></config>"#,
        )
        .unwrap();
        let diff = diff_trees(&old, &new, &schema());
        assert_eq!(diff.len(), 2);
        let removed = diff.iter().find(|d| d.is_delete()).unwrap();
        assert_eq!(removed.path, "/servers/server[name='a']");
        let added = diff.iter().find(|d| d.is_add()).unwrap();
        assert_eq!(added.path, "/servers/server[name='c']");
    }

    #[test]
    fn test_diff_nested_leaf_in_list_entry() {
        let old = parse_xml(
            r#"<config><servers xmlns="urn:srv">
               <server><name>a</name><port>80</port></server>
               </servers></config>"#,
        )
        .unwrap();
        let new = parse_xml(
            r#"<config><servers xmlns="urn:srv">
               <server><name>a</name><port>8080</port></server>
               </servers></config>"#,
        )
        .unwrap();
        let diff = diff_trees(&old, &new, &schema());
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "/servers/server[name='a']/port");
    }

    #[test]
    fn test_diff_identical_trees_is_empty() {
        let tree = parse_xml(r#"<config><mode xmlns="urn:srv">a</mode></config>"#).unwrap();
        assert!(diff_trees(&tree, &tree, &schema()).is_empty());
    }
}
