//! The backend context object.
//!
//! [`Backend`] owns every piece of shared state and is threaded explicitly
//! through the RPC handlers, the commit engine, and the startup code. Tests
//! instantiate one per test over a scratch datastore directory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use confmgr_common::{BackendOptions, BackendResult, NacmMode};
use confmgr_datastore::{DatastoreConfig, DatastoreSet};
use confmgr_yang::Schema;

use crate::confirm::ConfirmCtx;
use crate::dispatch::UserRpcHandler;
use crate::event::{BackendEvent, CommitNotification};
use crate::nacm::NacmConfig;
use crate::plugin::{BackendPlugin, PluginRegistry};
use crate::session::SessionTable;
use crate::startup::StartupStatus;

/// Capacity of the commit notification stream.
const COMMIT_EVENT_CAPACITY: usize = 64;

/// Shared state of one backend instance.
pub struct Backend {
    pub(crate) opts: BackendOptions,
    pub(crate) stores: DatastoreSet,
    pub(crate) schema: Arc<Schema>,
    pub(crate) plugins: PluginRegistry,
    pub(crate) sessions: SessionTable,
    pub(crate) nacm: Option<NacmConfig>,
    pub(crate) confirm: ConfirmCtx,
    pub(crate) commit_events: broadcast::Sender<CommitNotification>,
    pub(crate) event_tx: mpsc::UnboundedSender<BackendEvent>,
    pub(crate) startup_status: StartupStatus,
    pub(crate) user_handlers: HashMap<String, Arc<dyn UserRpcHandler>>,
}

impl Backend {
    /// Creates a backend over the configured datastore directory.
    ///
    /// Returns the backend plus the receiving end of its event queue; the
    /// server loop drains that queue.
    pub fn new(
        opts: BackendOptions,
    ) -> BackendResult<(Self, mpsc::UnboundedReceiver<BackendEvent>)> {
        let store_config = DatastoreConfig::new(&opts.db_dir)
            .with_format(opts.db_format)
            .with_pretty(opts.db_pretty)
            .with_cache(opts.db_cache);
        let mut stores = DatastoreSet::new(store_config).map_err(store_fatal)?;
        stores.set_nacm_mode(opts.nacm_mode);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (commit_events, _) = broadcast::channel(COMMIT_EVENT_CAPACITY);
        let backend = Self {
            opts,
            stores,
            schema: Arc::new(Schema::new()),
            plugins: PluginRegistry::new(),
            sessions: SessionTable::new(),
            nacm: None,
            confirm: ConfirmCtx::new(),
            commit_events,
            event_tx,
            startup_status: StartupStatus::Err,
            user_handlers: HashMap::new(),
        };
        Ok((backend, event_rx))
    }

    /// Registers a plugin; must happen before [`Backend::init`].
    pub fn register_plugin(&mut self, plugin: Box<dyn BackendPlugin>) {
        self.plugins.register(plugin);
    }

    /// Registers a handler for a user-defined RPC name.
    pub fn register_rpc_handler(&mut self, name: impl Into<String>, handler: Arc<dyn UserRpcHandler>) {
        self.user_handlers.insert(name.into(), handler);
    }

    /// Initializes plugins, builds the schema, and runs startup-mode
    /// processing. The backend serves RPCs afterwards.
    pub async fn init(&mut self) -> BackendResult<()> {
        // Schema first: datastore list matching and validation need it.
        let mut schema = Schema::new();
        for module in self.plugins.collect_modules() {
            schema.add_module(module);
        }
        self.schema = Arc::new(schema);
        self.stores.set_schema(Arc::clone(&self.schema));

        for plugin in self.plugins.iter_mut() {
            plugin.init().await?;
        }

        self.run_startup().await?;
        self.rebuild_nacm();

        for plugin in self.plugins.iter_mut() {
            plugin.start().await?;
        }
        info!(status = ?self.startup_status, "backend initialized");
        Ok(())
    }

    /// Rebuilds the NACM ruleset from its configured source.
    ///
    /// Internal mode reads the `nacm` subtree of running; external mode uses
    /// the tree loaded at startup. Called after every successful commit.
    pub(crate) fn rebuild_nacm(&mut self) {
        self.nacm = match self.opts.nacm_mode {
            NacmMode::Disabled => None,
            NacmMode::External => self.stores.nacm_tree().map(NacmConfig::from_tree),
            NacmMode::Internal => self
                .stores
                .get("running")
                .ok()
                .and_then(|tree| tree.find("nacm").map(NacmConfig::from_tree)),
        };
    }

    /// Opens a session without a transport, already in READY state.
    ///
    /// Used by tests and in-process front-ends.
    pub fn open_local_session(&mut self, username: &str) -> u32 {
        let id = self.sessions.open("local", username, None);
        if let Some(session) = self.sessions.get_mut(id) {
            session.mark_ready();
        }
        id
    }

    /// Subscribes to the internal commit notification stream.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommitNotification> {
        self.commit_events.subscribe()
    }

    /// The startup status computed by [`Backend::init`].
    pub fn startup_status(&self) -> StartupStatus {
        self.startup_status
    }

    /// Current confirmed-commit state.
    pub fn confirmed_commit_state(&self) -> crate::confirm::ConfirmedCommitState {
        self.confirm.state()
    }

    /// The loaded schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Direct datastore access for tests and embedding front-ends.
    pub fn datastores(&mut self) -> &mut DatastoreSet {
        &mut self.stores
    }

    /// The session table.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Sender half of the backend event queue (timers, transports).
    pub fn event_sender(&self) -> mpsc::UnboundedSender<BackendEvent> {
        self.event_tx.clone()
    }

    /// Processes one queued event outside the socket server.
    ///
    /// In-process embeddings and tests drain the event queue through this;
    /// the socket server has its own loop that also routes replies.
    pub async fn process_event(&mut self, event: BackendEvent) -> Option<String> {
        match event {
            BackendEvent::Message {
                session_id,
                payload,
            } => self.handle_frame(session_id, &payload).await,
            BackendEvent::Disconnect { session_id } => {
                self.teardown_session(session_id).await;
                None
            }
            BackendEvent::ConfirmTimeout { epoch } => {
                self.on_confirm_timeout(epoch).await;
                None
            }
            BackendEvent::Connect { .. } => None,
        }
    }

    /// Runs plugin exit callbacks; the backend is done afterwards.
    pub async fn terminate(&mut self) {
        for plugin in self.plugins.iter_mut() {
            plugin.exit().await;
        }
        info!("backend terminated");
    }
}

fn store_fatal(err: confmgr_datastore::StoreError) -> confmgr_common::BackendError {
    match err {
        confmgr_datastore::StoreError::Fatal(e) => e,
        other => confmgr_common::BackendError::datastore("init", other.to_string()),
    }
}
