//! Backend plugin capability object and registry.
//!
//! Plugins observe and veto configuration transactions. Callbacks run in
//! registration order; on an aborted commit the engine invokes `abort` in
//! reverse order over the plugins whose `commit` had succeeded. Callbacks
//! run inside the backend's event loop and must not block.

use async_trait::async_trait;

use confmgr_common::BackendResult;
use confmgr_types::XmlNode;
use confmgr_yang::Module;

use crate::commit::Transaction;

/// A backend plugin.
///
/// All methods default to no-ops so plugins implement only what they need.
///
/// # Lifecycle
///
/// 1. `modules()` contributes schema before any datastore is read
/// 2. `init()` at daemon startup, before startup-mode processing
/// 3. `start()` once the backend is serving
/// 4. `pre_commit` / `commit` / `commit_done` / `abort` per transaction
/// 5. `exit()` at shutdown
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    /// Plugin name for logs and error attribution.
    fn name(&self) -> &str;

    /// YANG modules this plugin contributes to the loaded schema.
    fn modules(&self) -> Vec<Module> {
        Vec::new()
    }

    /// Called once at startup.
    async fn init(&mut self) -> BackendResult<()> {
        Ok(())
    }

    /// Called when the backend starts serving clients.
    async fn start(&mut self) -> BackendResult<()> {
        Ok(())
    }

    /// State data merged into `get` replies.
    ///
    /// Return a subtree rooted at a top-level data node; conflicting
    /// contributions turn the whole reply into an error.
    async fn state_data(&mut self) -> BackendResult<Option<XmlNode>> {
        Ok(None)
    }

    /// Inspection pass over the diff; returning an error aborts the commit
    /// before any plugin has applied anything.
    async fn pre_commit(&mut self, _tx: &Transaction) -> BackendResult<()> {
        Ok(())
    }

    /// Applies the transaction. An error triggers `abort` on every plugin
    /// whose `commit` already returned ok, in reverse order.
    async fn commit(&mut self, _tx: &Transaction) -> BackendResult<()> {
        Ok(())
    }

    /// Post-promotion notification; failures are logged, never fatal.
    async fn commit_done(&mut self, _tx: &Transaction) -> BackendResult<()> {
        Ok(())
    }

    /// Undoes a previously applied `commit` for this transaction.
    async fn abort(&mut self, _tx: &Transaction) -> BackendResult<()> {
        Ok(())
    }

    /// Called once at shutdown.
    async fn exit(&mut self) {}
}

/// Plugins in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn BackendPlugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin; order of registration is invocation order.
    pub fn register(&mut self, plugin: Box<dyn BackendPlugin>) {
        tracing::info!(plugin = plugin.name(), "registered backend plugin");
        self.plugins.push(plugin);
    }

    /// All plugins in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn BackendPlugin>> {
        self.plugins.iter_mut()
    }

    /// Plugins by index; used for reverse-order abort.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Box<dyn BackendPlugin>> {
        self.plugins.get_mut(idx)
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// True when no plugin is registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Schema modules contributed by every plugin, in registration order.
    pub fn collect_modules(&self) -> Vec<Module> {
        self.plugins.iter().flat_map(|p| p.modules()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: String,
        calls: Vec<&'static str>,
    }

    #[async_trait]
    impl BackendPlugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn commit(&mut self, _tx: &Transaction) -> BackendResult<()> {
            self.calls.push("commit");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_defaults_are_noops() {
        let mut plugin = Recorder {
            name: "rec".into(),
            calls: Vec::new(),
        };
        let tx = Transaction::empty("candidate", "running");
        plugin.init().await.unwrap();
        plugin.pre_commit(&tx).await.unwrap();
        plugin.commit(&tx).await.unwrap();
        plugin.commit_done(&tx).await.unwrap();
        assert_eq!(plugin.calls, vec!["commit"]);
    }

    #[test]
    fn test_registration_order() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(Recorder {
            name: "first".into(),
            calls: Vec::new(),
        }));
        registry.register(Box::new(Recorder {
            name: "second".into(),
            calls: Vec::new(),
        }));
        let names: Vec<_> = registry.iter_mut().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
