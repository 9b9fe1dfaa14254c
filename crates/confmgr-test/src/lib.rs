//! Test harness and fixtures for the confmgr backend.
//!
//! [`TestBackend`] stands up a complete backend over a scratch datastore
//! directory, with the example schema loaded and a ready session attached,
//! so tests drive the same dispatch path a socket client would.

pub mod fixtures;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use confmgr_common::{BackendOptions, BackendResult};
use confmgr_types::{parse_xml, XmlNode};
use confmgr_yang::Module;
use confmgrd::{Backend, BackendEvent, BackendPlugin, Transaction};

/// A backend instance over a temporary datastore directory.
pub struct TestBackend {
    backend: Backend,
    event_rx: mpsc::UnboundedReceiver<BackendEvent>,
    session_id: u32,
    // Keeps the datastore directory alive for the test's duration.
    _dir: TempDir,
}

impl TestBackend {
    /// Builds and initializes a backend with the example schema.
    pub async fn new() -> Self {
        Self::with_plugins(vec![]).await
    }

    /// Builds a backend with extra plugins registered before init.
    pub async fn with_plugins(plugins: Vec<Box<dyn BackendPlugin>>) -> Self {
        Self::with_config(plugins, |_| {}).await
    }

    /// Builds a backend with NACM enforcing from the running datastore.
    pub async fn with_nacm_internal() -> Self {
        Self::with_config(vec![], |opts| {
            opts.nacm_mode = confmgr_common::NacmMode::Internal;
        })
        .await
    }

    /// Builds a backend with plugins and an option hook applied before init.
    pub async fn with_config(
        plugins: Vec<Box<dyn BackendPlugin>>,
        mutate: impl FnOnce(&mut BackendOptions),
    ) -> Self {
        let mut opts = BackendOptions::default();
        let dir = TempDir::new().expect("tempdir");
        opts.db_dir = dir.path().to_path_buf();
        mutate(&mut opts);
        let (mut backend, event_rx) = Backend::new(opts).expect("backend");
        backend.register_plugin(Box::new(fixtures::SchemaPlugin::example()));
        for plugin in plugins {
            backend.register_plugin(plugin);
        }
        backend.init().await.expect("init");
        let session_id = backend.open_local_session("admin");
        Self {
            backend,
            event_rx,
            session_id,
            _dir: dir,
        }
    }

    /// The default session id.
    pub fn session(&self) -> u32 {
        self.session_id
    }

    /// Opens another session for multi-client tests.
    pub fn open_session(&mut self, username: &str) -> u32 {
        self.backend.open_local_session(username)
    }

    /// Direct access to the backend under test.
    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    /// Sends one operation on the default session, returning the raw reply.
    pub async fn rpc(&mut self, body: &str) -> String {
        self.rpc_as(self.session_id, body).await
    }

    /// Sends one operation on a specific session.
    pub async fn rpc_as(&mut self, session_id: u32, body: &str) -> String {
        let frame = format!(r#"<rpc message-id="1">{body}</rpc>"#);
        self.backend
            .handle_frame(session_id, &frame)
            .await
            .expect("rpc always yields a reply")
    }

    /// Delivers every queued backend event (e.g. expired timers).
    pub async fn pump_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.backend.process_event(event).await;
        }
    }

    /// The committed value of `/x` in a datastore, if any.
    pub async fn get_x(&mut self, source: &str) -> Option<String> {
        let reply = self
            .rpc(&format!("<get-config><source><{source}/></source></get-config>"))
            .await;
        let tree = parse_xml(&reply).expect("reply parses");
        tree.find("data")
            .and_then(|d| d.find("x"))
            .and_then(|x| x.body())
            .map(str::to_string)
    }
}

/// Parses a reply and returns its first `rpc-error`, if any.
pub fn first_error(reply: &str) -> Option<XmlNode> {
    let tree = parse_xml(reply).ok()?;
    tree.find("rpc-error").cloned()
}

/// True for a plain `<rpc-reply><ok/></rpc-reply>`.
pub fn is_ok_reply(reply: &str) -> bool {
    parse_xml(reply)
        .map(|tree| tree.find("ok").is_some())
        .unwrap_or(false)
}

/// Body of a child element of the first rpc-error, e.g. `error-tag`.
pub fn error_field(reply: &str, field: &str) -> Option<String> {
    first_error(reply)?.find_body(field).map(str::to_string)
}

/// A plugin that records every callback invocation and can be told to fail.
pub struct RecordingPlugin {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    fail_commit: bool,
}

impl RecordingPlugin {
    /// Creates a recorder writing into the shared log.
    pub fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            log,
            fail_commit: false,
        }
    }

    /// Makes the `commit` callback fail.
    pub fn failing(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    fn record(&self, phase: &str) {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("{}:{}", self.name, phase));
    }
}

#[async_trait]
impl BackendPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn modules(&self) -> Vec<Module> {
        Vec::new()
    }

    async fn pre_commit(&mut self, _tx: &Transaction) -> BackendResult<()> {
        self.record("pre-commit");
        Ok(())
    }

    async fn commit(&mut self, _tx: &Transaction) -> BackendResult<()> {
        self.record("commit");
        if self.fail_commit {
            return Err(confmgr_common::BackendError::plugin(
                self.name.clone(),
                "refusing to apply",
            ));
        }
        Ok(())
    }

    async fn commit_done(&mut self, _tx: &Transaction) -> BackendResult<()> {
        self.record("commit-done");
        Ok(())
    }

    async fn abort(&mut self, _tx: &Transaction) -> BackendResult<()> {
        self.record("abort");
        Ok(())
    }
}
