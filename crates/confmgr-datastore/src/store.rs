//! The datastore set: named stores, persistence, cache, and locks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use confmgr_common::netconf::RpcError;
use confmgr_common::{BackendError, DbFormat, NacmMode};
use confmgr_types::{parse_xml, DataPath, XmlNode};
use confmgr_yang::{Schema, SchemaNode};

use crate::edit::{apply_edit, EditOp};

/// Result type for datastore operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Datastore operation outcomes beyond plain success.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The named datastore does not exist.
    #[error("datastore '{0}' not found")]
    NotFound(String),

    /// The operation conflicts with existing content or a held lock; the
    /// carried error is ready to send to the client.
    #[error("{0}")]
    Conflict(RpcError),

    /// The store itself failed (I/O, corrupt file).
    #[error(transparent)]
    Fatal(#[from] BackendError),
}

impl StoreError {
    /// Translates to the protocol error the client should see.
    pub fn to_rpc_error(&self) -> RpcError {
        use confmgr_common::netconf::ErrorType;
        match self {
            StoreError::NotFound(name) => RpcError::invalid_value(
                ErrorType::Protocol,
                format!("No such database: {name}"),
            ),
            StoreError::Conflict(err) => err.clone(),
            StoreError::Fatal(err) => {
                RpcError::operation_failed(ErrorType::Application, err.to_string())
            }
        }
    }
}

/// Which nodes a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Content {
    /// Configuration nodes only.
    Config,
    /// State nodes only.
    Nonconfig,
    /// Everything.
    #[default]
    All,
}

impl std::str::FromStr for Content {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(Content::Config),
            "nonconfig" => Ok(Content::Nonconfig),
            "all" => Ok(Content::All),
            other => Err(BackendError::config(
                "content",
                format!("expected config|nonconfig|all, got '{other}'"),
            )),
        }
    }
}

/// Configuration for a [`DatastoreSet`].
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// Directory holding one `<name>_db` file per store.
    pub dir: PathBuf,
    /// Persisted format.
    pub format: DbFormat,
    /// Pretty-print persisted XML.
    pub pretty: bool,
    /// Keep loaded trees in memory (write-through).
    pub cache: bool,
}

impl DatastoreConfig {
    /// Creates a config with defaults: XML format, compact, cache on.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            format: DbFormat::Xml,
            pretty: false,
            cache: true,
        }
    }

    /// Sets the persisted format.
    pub fn with_format(mut self, format: DbFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables pretty-printing.
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Enables or disables the cache.
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }
}

/// The set of named datastores.
///
/// Stores are created on first touch and persisted as one file each. The
/// `lock`/`unlock` bookkeeping is advisory; the RPC dispatcher enforces it
/// for protocol operations.
pub struct DatastoreSet {
    config: DatastoreConfig,
    cache: HashMap<String, XmlNode>,
    schema: Option<Arc<Schema>>,
    locks: HashMap<String, u32>,
    nacm_mode: NacmMode,
    nacm_tree: Option<XmlNode>,
}

impl DatastoreSet {
    /// Creates a datastore set over a directory.
    pub fn new(config: DatastoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| BackendError::io("creating datastore directory", e))?;
        Ok(Self {
            config,
            cache: HashMap::new(),
            schema: None,
            locks: HashMap::new(),
            nacm_mode: NacmMode::Disabled,
            nacm_tree: None,
        })
    }

    /// Attaches the schema used for list-key matching and content filtering.
    pub fn set_schema(&mut self, schema: Arc<Schema>) {
        self.schema = Some(schema);
    }

    /// Toggles the cache; disabling drops all cached trees.
    pub fn set_cache(&mut self, enabled: bool) {
        self.config.cache = enabled;
        if !enabled {
            self.cache.clear();
        }
    }

    /// Sets pretty-printing of persisted XML.
    pub fn set_pretty(&mut self, pretty: bool) {
        self.config.pretty = pretty;
    }

    /// Sets the persisted format for subsequent writes.
    pub fn set_format(&mut self, format: DbFormat) {
        self.config.format = format;
    }

    /// Records the NACM mode for the backend to read back.
    pub fn set_nacm_mode(&mut self, mode: NacmMode) {
        self.nacm_mode = mode;
    }

    /// The recorded NACM mode.
    pub fn nacm_mode(&self) -> NacmMode {
        self.nacm_mode
    }

    /// Holds the externally loaded NACM tree.
    pub fn set_nacm_tree(&mut self, tree: Option<XmlNode>) {
        self.nacm_tree = tree;
    }

    /// The externally loaded NACM tree, if any.
    pub fn nacm_tree(&self) -> Option<&XmlNode> {
        self.nacm_tree.as_ref()
    }

    fn db_file(&self, name: &str) -> PathBuf {
        self.config.dir.join(format!("{name}_db"))
    }

    /// True if the named store exists (cached or on disk).
    pub fn exists(&self, name: &str) -> bool {
        self.cache.contains_key(name) || self.db_file(name).exists()
    }

    /// Creates an empty store; fails if it already exists.
    pub fn create(&mut self, name: &str) -> StoreResult<()> {
        if self.exists(name) {
            return Err(StoreError::Conflict(RpcError::data_exists(format!(
                "datastore '{name}' already exists"
            ))));
        }
        self.write(name, &empty_root())?;
        debug!(datastore = name, "created");
        Ok(())
    }

    /// Creates the store if missing, leaving existing content alone.
    pub fn ensure(&mut self, name: &str) -> StoreResult<()> {
        if !self.exists(name) {
            self.write(name, &empty_root())?;
        }
        Ok(())
    }

    /// Replaces the store content with an empty tree.
    pub fn reset(&mut self, name: &str) -> StoreResult<()> {
        self.write(name, &empty_root())?;
        info!(datastore = name, "reset to empty");
        Ok(())
    }

    /// Deletes the named store.
    pub fn delete(&mut self, name: &str) -> StoreResult<()> {
        let file = self.db_file(name);
        if !self.exists(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.cache.remove(name);
        if file.exists() {
            std::fs::remove_file(&file)
                .map_err(|e| BackendError::io(format!("deleting {}", file.display()), e))?;
        }
        debug!(datastore = name, "deleted");
        Ok(())
    }

    /// Copies `src` over `dst` atomically; observers see old or new content,
    /// never a mix.
    pub fn copy(&mut self, src: &str, dst: &str) -> StoreResult<()> {
        let tree = self.get(src)?;
        self.write(dst, &tree)?;
        debug!(src = src, dst = dst, "copied");
        Ok(())
    }

    /// Returns the full tree of the named store.
    pub fn get(&mut self, name: &str) -> StoreResult<XmlNode> {
        if self.config.cache {
            if let Some(tree) = self.cache.get(name) {
                return Ok(tree.clone());
            }
        }
        let tree = self.load(name)?;
        if self.config.cache {
            self.cache.insert(name.to_string(), tree.clone());
        }
        Ok(tree)
    }

    /// Reads with a path filter, content selector, and depth limit.
    ///
    /// Returns the children of the store root after projection, ready to be
    /// wrapped in a `<data>` reply.
    pub fn get_filtered(
        &mut self,
        name: &str,
        path: Option<&DataPath>,
        content: Content,
        depth: Option<u32>,
    ) -> StoreResult<Vec<XmlNode>> {
        let tree = self.get(name)?;
        let mut root = match path {
            Some(path) => project(&tree, path),
            None => tree,
        };
        if content != Content::All {
            if let Some(schema) = self.schema.clone() {
                filter_content(&mut root, &schema, content);
            }
        }
        if let Some(depth) = depth {
            truncate_depth(&mut root, depth);
        }
        Ok(root.children().to_vec())
    }

    /// Replaces the whole tree of the named store.
    pub fn put_tree(&mut self, name: &str, tree: &XmlNode) -> StoreResult<()> {
        self.write(name, tree)
    }

    /// Applies an `edit-config` payload to the named store.
    ///
    /// `payload` is the `<config>` element; `default_op` applies where no
    /// `operation` attribute overrides it. The store is created on first
    /// touch, and the result is persisted before returning (write-through).
    pub fn put(&mut self, name: &str, payload: &XmlNode, default_op: EditOp) -> StoreResult<()> {
        let mut tree = if self.exists(name) {
            self.get(name)?
        } else {
            empty_root()
        };
        let schema = self.schema.clone();
        apply_edit(&mut tree, payload, default_op, schema.as_deref())
            .map_err(StoreError::Conflict)?;
        self.write(name, &tree)
    }

    /// Takes the advisory lock for a session.
    pub fn lock(&mut self, name: &str, session_id: u32) -> StoreResult<()> {
        match self.locks.get(name) {
            Some(&holder) if holder != session_id => {
                Err(StoreError::Conflict(RpcError::lock_denied(
                    holder,
                    format!("Operation failed, lock is already held by session {holder}"),
                )))
            }
            _ => {
                self.locks.insert(name.to_string(), session_id);
                debug!(datastore = name, session = session_id, "locked");
                Ok(())
            }
        }
    }

    /// Releases the advisory lock held by a session.
    pub fn unlock(&mut self, name: &str, session_id: u32) -> StoreResult<()> {
        match self.locks.get(name) {
            Some(&holder) if holder == session_id => {
                self.locks.remove(name);
                debug!(datastore = name, session = session_id, "unlocked");
                Ok(())
            }
            Some(&holder) => Err(StoreError::Conflict(RpcError::lock_denied(
                holder,
                "lock is held by another session",
            ))),
            None => Err(StoreError::Conflict(RpcError::operation_failed(
                confmgr_common::netconf::ErrorType::Protocol,
                format!("lock on '{name}' is not held"),
            ))),
        }
    }

    /// The session holding the lock on a store, if any.
    pub fn lock_holder(&self, name: &str) -> Option<u32> {
        self.locks.get(name).copied()
    }

    /// Drops every lock held by a session; used when a session dies.
    pub fn release_session_locks(&mut self, session_id: u32) {
        self.locks.retain(|name, holder| {
            if *holder == session_id {
                debug!(datastore = name.as_str(), session = session_id, "lock released");
                false
            } else {
                true
            }
        });
    }

    fn load(&self, name: &str) -> StoreResult<XmlNode> {
        let file = self.db_file(name);
        if !file.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let text = std::fs::read_to_string(&file)
            .map_err(|e| BackendError::io(format!("reading {}", file.display()), e))?;
        let tree = match self.config.format {
            DbFormat::Xml => parse_xml(&text).map_err(BackendError::from)?,
            DbFormat::Json => serde_json::from_str(&text).map_err(|e| {
                BackendError::datastore("load", format!("corrupt JSON store '{name}': {e}"))
            })?,
        };
        Ok(tree)
    }

    /// Persists and refreshes the cache: temp file plus rename so readers
    /// see old or new content only.
    fn write(&mut self, name: &str, tree: &XmlNode) -> StoreResult<()> {
        let file = self.db_file(name);
        let text = match self.config.format {
            DbFormat::Xml if self.config.pretty => tree.render_pretty(),
            DbFormat::Xml => tree.render(),
            DbFormat::Json => serde_json::to_string(tree).map_err(|e| {
                BackendError::datastore("write", format!("encoding '{name}': {e}"))
            })?,
        };
        let tmp = file.with_extension("tmp");
        std::fs::write(&tmp, &text)
            .map_err(|e| BackendError::io(format!("writing {}", tmp.display()), e))?;
        std::fs::rename(&tmp, &file)
            .map_err(|e| BackendError::io(format!("renaming {}", tmp.display()), e))?;
        if self.config.cache {
            self.cache.insert(name.to_string(), tree.clone());
        } else {
            self.cache.remove(name);
        }
        Ok(())
    }
}

fn empty_root() -> XmlNode {
    XmlNode::new("config")
}

/// Builds the minimal tree containing every node the path matches, with
/// its ancestor chain preserved.
fn project(root: &XmlNode, path: &DataPath) -> XmlNode {
    let mut out = XmlNode::new(root.name());
    if let Some(ns) = root.namespace() {
        out.set_namespace(ns);
    }
    project_level(root, path.steps(), &mut out);
    out
}

fn project_level(node: &XmlNode, steps: &[confmgr_types::PathStep], out: &mut XmlNode) {
    let Some(step) = steps.first() else {
        // Path exhausted: keep the whole subtree.
        *out = node.clone();
        return;
    };
    for child in node.children() {
        if child.name() != step.name() {
            continue;
        }
        if !step
            .predicates()
            .iter()
            .all(|(k, v)| child.find_body(k) == Some(v.as_str()))
        {
            continue;
        }
        let mut projected = XmlNode::new(child.name());
        if let Some(ns) = child.namespace() {
            projected.set_namespace(ns);
        }
        project_level(child, &steps[1..], &mut projected);
        out.push(projected);
    }
}

/// Prunes config or state subtrees according to the schema.
fn filter_content(root: &mut XmlNode, schema: &Schema, content: Content) {
    let nodes = std::mem::take(root.children_mut());
    *root.children_mut() = nodes
        .into_iter()
        .filter_map(|mut child| {
            let snode = schema.find_top(child.namespace(), child.name())?;
            filter_node(&mut child, snode, content).then_some(child)
        })
        .collect();
}

/// Returns false if the node should be dropped entirely.
fn filter_node(node: &mut XmlNode, snode: &SchemaNode, content: Content) -> bool {
    let keep_here = match content {
        Content::Config => snode.is_config(),
        Content::Nonconfig => true, // interior config nodes stay as scaffolding
        Content::All => true,
    };
    if !keep_here {
        return false;
    }
    let children = std::mem::take(node.children_mut());
    *node.children_mut() = children
        .into_iter()
        .filter_map(|mut child| {
            let child_snode = snode.find_data_child(child.name())?;
            filter_node(&mut child, child_snode, content).then_some(child)
        })
        .collect();
    if content == Content::Nonconfig && snode.is_config() && node.is_leaf() {
        // A config leaf with nothing state-related below it.
        return false;
    }
    true
}

fn truncate_depth(node: &mut XmlNode, depth: u32) {
    if depth == 0 {
        node.children_mut().clear();
        return;
    }
    for child in node.children_mut() {
        truncate_depth(child, depth - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confmgr_common::netconf::ErrorTag;
    use confmgr_yang::{LeafType, Module};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn new_set(dir: &TempDir) -> DatastoreSet {
        DatastoreSet::new(DatastoreConfig::new(dir.path())).unwrap()
    }

    fn payload(s: &str) -> XmlNode {
        parse_xml(s).unwrap()
    }

    #[test]
    fn test_create_exists_delete() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        assert!(!set.exists("candidate"));
        set.create("candidate").unwrap();
        assert!(set.exists("candidate"));
        assert!(matches!(
            set.create("candidate"),
            Err(StoreError::Conflict(_))
        ));
        set.delete("candidate").unwrap();
        assert!(!set.exists("candidate"));
        assert!(matches!(set.delete("candidate"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        set.put(
            "candidate",
            &payload(r#"<config><x xmlns="urn:ex">7</x></config>"#),
            EditOp::Merge,
        )
        .unwrap();
        let tree = set.get("candidate").unwrap();
        assert_eq!(tree.find_body("x"), Some("7"));
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let mut set = new_set(&dir);
            set.put(
                "running",
                &payload(r#"<config><x xmlns="urn:ex">7</x></config>"#),
                EditOp::Merge,
            )
            .unwrap();
        }
        let mut set = new_set(&dir);
        assert_eq!(set.get("running").unwrap().find_body("x"), Some("7"));
    }

    #[test]
    fn test_json_format_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut set =
            DatastoreSet::new(DatastoreConfig::new(dir.path()).with_format(DbFormat::Json))
                .unwrap();
        set.put(
            "running",
            &payload(r#"<config><x xmlns="urn:ex">7</x></config>"#),
            EditOp::Merge,
        )
        .unwrap();
        set.set_cache(false); // force reload from disk
        assert_eq!(set.get("running").unwrap().find_body("x"), Some("7"));
    }

    #[test]
    fn test_copy_is_wholesale() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        set.put(
            "candidate",
            &payload(r#"<config><x xmlns="urn:ex">7</x></config>"#),
            EditOp::Merge,
        )
        .unwrap();
        set.put(
            "running",
            &payload(r#"<config><y xmlns="urn:ex">1</y></config>"#),
            EditOp::Merge,
        )
        .unwrap();
        set.copy("candidate", "running").unwrap();
        let running = set.get("running").unwrap();
        assert_eq!(running.find_body("x"), Some("7"));
        assert!(running.find("y").is_none());
    }

    #[test]
    fn test_put_create_conflict() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        let p = payload(r#"<config><x xmlns="urn:ex">7</x></config>"#);
        set.put("candidate", &p, EditOp::Create).unwrap();
        let err = set.put("candidate", &p, EditOp::Create).unwrap_err();
        match err {
            StoreError::Conflict(e) => assert_eq!(e.tag(), ErrorTag::DataExists),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lock_mutual_exclusion() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        set.lock("running", 1).unwrap();
        let err = set.lock("running", 2).unwrap_err();
        match err {
            StoreError::Conflict(e) => {
                assert_eq!(e.tag(), ErrorTag::LockDenied);
                let info = e.to_error_xml();
                let info = info.find("error-info").unwrap();
                assert_eq!(info.find_body("session-id"), Some("1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Relock by the holder is fine, unlock frees it.
        set.lock("running", 1).unwrap();
        set.unlock("running", 1).unwrap();
        set.lock("running", 2).unwrap();
    }

    #[test]
    fn test_release_session_locks() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        set.lock("running", 1).unwrap();
        set.lock("candidate", 1).unwrap();
        set.release_session_locks(1);
        assert_eq!(set.lock_holder("running"), None);
        assert_eq!(set.lock_holder("candidate"), None);
    }

    #[test]
    fn test_get_filtered_by_path() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        set.put(
            "running",
            &payload(
                r#"<config><servers xmlns="urn:srv">
                   <server><name>a</name><port>80</port></server>
                   <server><name>b</name><port>81</port></server>
                   </servers></config>"#,
            ),
            EditOp::Merge,
        )
        .unwrap();
        let path = DataPath::parse("/servers/server[name='b']").unwrap();
        let nodes = set
            .get_filtered("running", Some(&path), Content::All, None)
            .unwrap();
        assert_eq!(nodes.len(), 1);
        let servers = &nodes[0];
        assert_eq!(servers.name(), "servers");
        assert_eq!(servers.children().len(), 1);
        assert_eq!(servers.children()[0].find_body("name"), Some("b"));
    }

    #[test]
    fn test_get_filtered_depth() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        set.put(
            "running",
            &payload(r#"<config><a xmlns="urn:ex"><b><c>1</c></b></a></config>"#),
            EditOp::Merge,
        )
        .unwrap();
        let nodes = set
            .get_filtered("running", None, Content::All, Some(2))
            .unwrap();
        let a = &nodes[0];
        let b = a.find("b").unwrap();
        assert!(b.children().is_empty());
    }

    #[test]
    fn test_content_filter_drops_state() {
        let dir = TempDir::new().unwrap();
        let mut set = new_set(&dir);
        let schema = Schema::new().with_module(
            Module::new("m", "urn:m", "m").with_node(
                SchemaNode::container("box")
                    .with_child(SchemaNode::leaf("speed", LeafType::uint32()))
                    .with_child(SchemaNode::leaf("counters", LeafType::uint32()).state()),
            ),
        );
        set.set_schema(Arc::new(schema));
        set.put(
            "running",
            &payload(
                r#"<config><box xmlns="urn:m"><speed>10</speed><counters>5</counters></box></config>"#,
            ),
            EditOp::Merge,
        )
        .unwrap();
        let nodes = set
            .get_filtered("running", None, Content::Config, None)
            .unwrap();
        let bx = &nodes[0];
        assert!(bx.find("speed").is_some());
        assert!(bx.find("counters").is_none());
    }
}
