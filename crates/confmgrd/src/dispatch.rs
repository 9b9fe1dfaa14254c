//! RPC dispatch: parse, authorize, route, reply.
//!
//! Every inbound frame yields at most one reply: `hello` yields none, an
//! `rpc` always yields exactly one `rpc-reply`. Handlers are looked up by
//! exact operation name; unknown names fall through to user-registered
//! handlers and then to `operation-not-supported`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use confmgr_common::netconf::{self, ErrorType, RpcError};
use confmgr_datastore::{Content, EditOp};
use confmgr_types::{parse_xml, DataPath, XmlNode};

use crate::backend::Backend;
use crate::nacm::{AccessOp, NacmRequest};
use crate::session::SessionState;

/// Capabilities advertised in the server hello.
const SERVER_CAPABILITIES: &[&str] = &[
    "urn:ietf:params:netconf:base:1.0",
    "urn:ietf:params:netconf:base:1.1",
    "urn:ietf:params:netconf:capability:candidate:1.0",
    "urn:ietf:params:netconf:capability:confirmed-commit:1.1",
    "urn:ietf:params:netconf:capability:validate:1.1",
    "urn:ietf:params:netconf:capability:startup:1.0",
    "urn:ietf:params:netconf:capability:xpath:1.0",
];

/// Handler for an application-defined RPC.
///
/// Handlers receive the operation element and return the reply children;
/// the dispatcher wraps them in the `rpc-reply` envelope.
#[async_trait]
pub trait UserRpcHandler: Send + Sync {
    /// Handles one invocation.
    async fn handle(&self, input: &XmlNode, session_id: u32) -> Result<Vec<XmlNode>, RpcError>;
}

impl Backend {
    /// The server `<hello>` for a new session.
    pub fn hello_message(&self, session_id: u32) -> String {
        let mut capabilities = XmlNode::new("capabilities");
        for cap in SERVER_CAPABILITIES {
            capabilities.push(XmlNode::new("capability").with_body(*cap));
        }
        XmlNode::new("hello")
            .with_namespace(confmgr_types::NETCONF_BASE_NS)
            .with_child(capabilities)
            .with_child(XmlNode::new("session-id").with_body(session_id.to_string()))
            .render()
    }

    /// Processes one inbound frame; returns the reply to send, if any.
    ///
    /// A client `hello` produces no reply. Everything else produces exactly
    /// one `rpc-reply`, malformed input included. When a per-RPC deadline is
    /// configured the handler is abandoned at its next suspension point on
    /// expiry and `resource-denied` is returned.
    pub async fn handle_frame(&mut self, session_id: u32, text: &str) -> Option<String> {
        let tree = match parse_xml(text) {
            Ok(tree) => tree,
            Err(e) => {
                return Some(RpcError::malformed_message(e.to_string()).to_message_string());
            }
        };
        match tree.name() {
            "hello" => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.mark_ready();
                    debug!(session = session_id, "hello received");
                }
                None
            }
            "rpc" => {
                let deadline = self.opts.rpc_timeout;
                let reply = match deadline {
                    Some(limit) => {
                        match tokio::time::timeout(limit, self.handle_rpc(session_id, &tree)).await
                        {
                            Ok(reply) => reply,
                            Err(_) => with_message_id(
                                RpcError::resource_denied(
                                    ErrorType::Application,
                                    format!("request deadline of {}s exceeded", limit.as_secs()),
                                )
                                .to_reply_xml(),
                                &tree,
                            ),
                        }
                    }
                    None => self.handle_rpc(session_id, &tree).await,
                };
                Some(reply.render())
            }
            other => Some(
                RpcError::malformed_message(format!("unexpected <{other}> message"))
                    .to_message_string(),
            ),
        }
    }

    async fn handle_rpc(&mut self, session_id: u32, rpc: &XmlNode) -> XmlNode {
        let Some(session) = self.sessions.get(session_id) else {
            return with_message_id(
                RpcError::operation_failed(ErrorType::Rpc, "no such session")
                    .to_reply_xml(),
                rpc,
            );
        };
        if session.state() == SessionState::Closed {
            return with_message_id(
                RpcError::operation_failed(ErrorType::Rpc, "session is closing").to_reply_xml(),
                rpc,
            );
        }
        // Trusted front-ends may carry the end user in a `username`
        // attribute; it is honored only when credential verification is
        // switched off in the options.
        let username = match rpc.attr("username") {
            Some(user) if !self.opts.nacm_credentials => user.to_string(),
            _ => session.username().to_string(),
        };

        let Some(op) = rpc.children().first() else {
            return with_message_id(
                RpcError::malformed_message("rpc without operation").to_reply_xml(),
                rpc,
            );
        };
        let op = op.clone();
        debug!(session = session_id, op = op.name(), "rpc received");

        // RPC authorization; close-session can never be denied.
        if op.name() != "close-session" {
            if let Some(nacm) = &self.nacm {
                let decision = nacm.authorize(&NacmRequest {
                    user: &username,
                    op: AccessOp::Exec,
                    rpc_name: Some(op.name()),
                    module: None,
                    path: None,
                });
                if !decision.is_permit() {
                    info!(session = session_id, op = op.name(), "rpc denied by nacm");
                    return with_message_id(
                        decision.to_rpc_error(AccessOp::Exec).to_reply_xml(),
                        rpc,
                    );
                }
            }
        }

        let result = match op.name() {
            "get" => self.rpc_get(&op, &username).await,
            "get-config" => self.rpc_get_config(&op, &username),
            "edit-config" => self.rpc_edit_config(session_id, &op, &username),
            "copy-config" => self.rpc_copy_config(session_id, &op),
            "delete-config" => self.rpc_delete_config(session_id, &op),
            "lock" => self.rpc_lock(session_id, &op),
            "unlock" => self.rpc_unlock(session_id, &op),
            "commit" => self.rpc_commit(session_id, &op).await,
            "cancel-commit" => self.rpc_cancel_commit(session_id, &op).await,
            "discard-changes" => self.rpc_discard_changes(),
            "validate" => self.rpc_validate(&op),
            "close-session" => self.rpc_close_session(session_id).await,
            "kill-session" => self.rpc_kill_session(session_id, &op).await,
            name => match self.user_handlers.get(name).cloned() {
                Some(handler) => handler
                    .handle(&op, session_id)
                    .await
                    .map(|children| {
                        if children.is_empty() {
                            netconf::ok_reply()
                        } else {
                            let mut reply = XmlNode::new("rpc-reply");
                            for child in children {
                                reply.push(child);
                            }
                            reply
                        }
                    }),
                None => Err(RpcError::operation_not_supported(
                    ErrorType::Protocol,
                    format!("unknown operation <{name}>"),
                )),
            },
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => err.to_reply_xml(),
        };
        with_message_id(reply, rpc)
    }

    async fn rpc_get(&mut self, op: &XmlNode, username: &str) -> Result<XmlNode, RpcError> {
        let path = parse_filter(op)?;
        let nodes = self
            .stores
            .get_filtered("running", path.as_ref(), Content::All, None)
            .map_err(|e| e.to_rpc_error())?;
        let mut data = XmlNode::new("data");
        for node in self.prune_unreadable(nodes, username) {
            data.push(node);
        }

        // Merge plugin state data into the reply; a conflicting
        // contribution turns the reply into an operation-failed error.
        let mut acc = Some(data);
        for plugin in self.plugins.iter_mut() {
            let state = match plugin.state_data().await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "state data callback failed");
                    continue;
                }
            };
            let wrapped = XmlNode::new("data").with_child(state);
            match netconf::try_merge(&mut acc, &wrapped) {
                netconf::MergeOutcome::Ok => {}
                // The accumulator now holds the error reply itself.
                netconf::MergeOutcome::Failed => {
                    return Ok(acc.unwrap_or_else(|| {
                        RpcError::operation_failed(ErrorType::Rpc, "state data merge failed")
                            .to_reply_xml()
                    }));
                }
                netconf::MergeOutcome::Fatal => {
                    warn!(plugin = plugin.name(), "unmergeable state data ignored");
                }
            }
        }
        let data = acc.unwrap_or_else(|| XmlNode::new("data"));
        Ok(XmlNode::new("rpc-reply").with_child(data))
    }

    fn rpc_get_config(&mut self, op: &XmlNode, username: &str) -> Result<XmlNode, RpcError> {
        let source = db_arg(op, "source")?;
        let path = parse_filter(op)?;
        let nodes = self
            .stores
            .get_filtered(&source, path.as_ref(), Content::Config, None)
            .map_err(|e| e.to_rpc_error())?;
        Ok(netconf::data_reply(self.prune_unreadable(nodes, username)))
    }

    /// Drops top-level subtrees the user may not read.
    fn prune_unreadable(&self, nodes: Vec<XmlNode>, username: &str) -> Vec<XmlNode> {
        let Some(nacm) = &self.nacm else {
            return nodes;
        };
        nodes
            .into_iter()
            .filter(|node| {
                let path = DataPath::parse(&format!("/{}", node.name())).ok();
                let module = node
                    .namespace()
                    .and_then(|ns| self.schema.module_by_namespace(ns))
                    .map(|m| m.name().to_string());
                nacm.authorize(&NacmRequest {
                    user: username,
                    op: AccessOp::Read,
                    rpc_name: None,
                    module: module.as_deref(),
                    path: path.as_ref(),
                })
                .is_permit()
            })
            .collect()
    }

    fn rpc_edit_config(
        &mut self,
        session_id: u32,
        op: &XmlNode,
        username: &str,
    ) -> Result<XmlNode, RpcError> {
        let target = db_arg(op, "target")?;
        self.check_lock(&target, session_id)?;
        let default_op = match op.find_body("default-operation") {
            Some(raw) => EditOp::from_str(raw).map_err(|_| {
                RpcError::invalid_value(
                    ErrorType::Protocol,
                    format!("unknown default-operation '{raw}'"),
                )
            })?,
            None => EditOp::Merge,
        };
        let config = op
            .find("config")
            .ok_or_else(|| {
                RpcError::missing_element(ErrorType::Protocol, "config", "edit-config without config")
            })?
            .clone();

        // Write authorization per touched top-level subtree, before any
        // mutation happens.
        if let Some(nacm) = &self.nacm {
            for child in config.children() {
                let access = match child.attr("operation") {
                    Some("delete") | Some("remove") => AccessOp::Delete,
                    Some("create") => AccessOp::Create,
                    _ => AccessOp::Update,
                };
                let path = DataPath::parse(&format!("/{}", child.name())).ok();
                let module = child
                    .namespace()
                    .and_then(|ns| self.schema.module_by_namespace(ns))
                    .map(|m| m.name().to_string());
                let decision = nacm.authorize(&NacmRequest {
                    user: username,
                    op: access,
                    rpc_name: None,
                    module: module.as_deref(),
                    path: path.as_ref(),
                });
                if !decision.is_permit() {
                    info!(session = session_id, node = child.name(), "edit denied by nacm");
                    return Err(decision.to_rpc_error(access));
                }
            }
        }

        let test_only = op.find_body("test-option") == Some("test-only");
        if test_only {
            // Apply against a scratch copy, validate, discard.
            self.stores
                .copy(&target, "tmp")
                .or_else(|_| self.stores.reset("tmp"))
                .map_err(|e| e.to_rpc_error())?;
            self.stores
                .put("tmp", &config, default_op)
                .map_err(|e| e.to_rpc_error())?;
            return match self.validate_db("tmp") {
                Ok(_) => Ok(netconf::ok_reply()),
                Err(errors) => Ok(netconf::error_reply(errors.iter())),
            };
        }

        self.stores
            .put(&target, &config, default_op)
            .map_err(|e| e.to_rpc_error())?;
        Ok(netconf::ok_reply())
    }

    fn rpc_copy_config(&mut self, session_id: u32, op: &XmlNode) -> Result<XmlNode, RpcError> {
        let target = db_arg(op, "target")?;
        self.check_lock(&target, session_id)?;
        // Inline <config> source or a named datastore.
        let inline = op.find("source").and_then(|s| s.find("config"));
        match inline {
            Some(config) => {
                let mut root = XmlNode::new("config");
                for child in config.children() {
                    root.push(child.clone());
                }
                self.stores
                    .put_tree(&target, &root)
                    .map_err(|e| e.to_rpc_error())?;
            }
            None => {
                let source = db_arg(op, "source")?;
                self.stores
                    .copy(&source, &target)
                    .map_err(|e| e.to_rpc_error())?;
            }
        }
        Ok(netconf::ok_reply())
    }

    fn rpc_delete_config(&mut self, session_id: u32, op: &XmlNode) -> Result<XmlNode, RpcError> {
        let target = db_arg(op, "target")?;
        if target == "running" {
            return Err(RpcError::invalid_value(
                ErrorType::Protocol,
                "the running datastore cannot be deleted",
            ));
        }
        self.check_lock(&target, session_id)?;
        self.stores.delete(&target).map_err(|e| e.to_rpc_error())?;
        Ok(netconf::ok_reply())
    }

    fn rpc_lock(&mut self, session_id: u32, op: &XmlNode) -> Result<XmlNode, RpcError> {
        let target = db_arg(op, "target")?;
        if target == "candidate" && self.candidate_dirty() {
            return Err(RpcError::operation_failed(
                ErrorType::Protocol,
                "candidate has uncommitted changes",
            ));
        }
        self.stores
            .lock(&target, session_id)
            .map_err(|e| e.to_rpc_error())?;
        Ok(netconf::ok_reply())
    }

    fn rpc_unlock(&mut self, session_id: u32, op: &XmlNode) -> Result<XmlNode, RpcError> {
        let target = db_arg(op, "target")?;
        self.stores
            .unlock(&target, session_id)
            .map_err(|e| e.to_rpc_error())?;
        Ok(netconf::ok_reply())
    }

    /// True when candidate differs from running.
    fn candidate_dirty(&mut self) -> bool {
        match (self.stores.get("candidate"), self.stores.get("running")) {
            (Ok(candidate), Ok(running)) => candidate != running,
            _ => false,
        }
    }

    async fn rpc_commit(&mut self, session_id: u32, op: &XmlNode) -> Result<XmlNode, RpcError> {
        if op.find("confirmed").is_some() {
            let timeout = match op.find_body("confirm-timeout") {
                Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                    RpcError::invalid_value(
                        ErrorType::Protocol,
                        format!("bad confirm-timeout '{raw}'"),
                    )
                })?),
                None => Duration::from_secs(self.opts.confirmed_commit_timeout),
            };
            let persist = op.find_body("persist").map(str::to_string);
            self.confirm.may_extend(session_id, persist.as_deref())?;

            let (_tx, image) = match self.candidate_commit("candidate").await {
                Ok(v) => v,
                Err(errors) => return Ok(netconf::error_reply(errors.iter())),
            };
            if self.confirm.is_active() {
                // Follow-up confirmed commit: new timeout, original image.
                self.confirm
                    .extend(timeout, session_id, persist, self.event_tx.clone());
            } else {
                if let Err(e) = self.stores.put_tree("rollback", &image) {
                    warn!(error = %e, "could not park rollback image on disk");
                }
                self.confirm
                    .arm(timeout, image, session_id, persist, self.event_tx.clone());
            }
            return Ok(netconf::ok_reply());
        }

        // Plain commit; may finalize a pending confirmed commit.
        if self.confirm.is_active() {
            let persist_id = op.find_body("persist-id").map(str::to_string);
            self.confirm.may_finalize(session_id, persist_id.as_deref())?;
            if let Err(errors) = self.candidate_commit("candidate").await {
                return Ok(netconf::error_reply(errors.iter()));
            }
            self.confirm.finalize();
            if self.stores.exists("rollback") {
                let _ = self.stores.delete("rollback");
            }
            info!(session = session_id, "confirmed commit finalized");
            return Ok(netconf::ok_reply());
        }

        if let Err(errors) = self.candidate_commit("candidate").await {
            return Ok(netconf::error_reply(errors.iter()));
        }
        Ok(netconf::ok_reply())
    }

    async fn rpc_cancel_commit(
        &mut self,
        session_id: u32,
        op: &XmlNode,
    ) -> Result<XmlNode, RpcError> {
        let persist_id = op.find_body("persist-id").map(str::to_string);
        let image = self
            .confirm
            .begin_cancel(session_id, persist_id.as_deref())?;
        let errs = self.do_rollback(image).await;
        if errs == 0 {
            Ok(netconf::ok_reply())
        } else {
            Err(RpcError::rollback_failed(
                ErrorType::Application,
                format!("rollback completed with error flags {errs:#04b}"),
            ))
        }
    }

    fn rpc_discard_changes(&mut self) -> Result<XmlNode, RpcError> {
        // Candidate is reset from running; a pending confirmed-commit
        // rollback image is deliberately left untouched.
        self.stores
            .copy("running", "candidate")
            .map_err(|e| e.to_rpc_error())?;
        Ok(netconf::ok_reply())
    }

    fn rpc_validate(&mut self, op: &XmlNode) -> Result<XmlNode, RpcError> {
        let source = db_arg(op, "source")?;
        match self.validate_db(&source) {
            Ok(_) => Ok(netconf::ok_reply()),
            Err(errors) => Ok(netconf::error_reply(errors.iter())),
        }
    }

    async fn rpc_close_session(&mut self, session_id: u32) -> Result<XmlNode, RpcError> {
        self.teardown_session(session_id).await;
        Ok(netconf::ok_reply())
    }

    async fn rpc_kill_session(&mut self, session_id: u32, op: &XmlNode) -> Result<XmlNode, RpcError> {
        let target: u32 = op
            .find_body("session-id")
            .ok_or_else(|| {
                RpcError::missing_element(ErrorType::Protocol, "session-id", "kill-session")
            })?
            .parse()
            .map_err(|_| RpcError::invalid_value(ErrorType::Protocol, "bad session-id"))?;
        if target == session_id {
            return Err(RpcError::invalid_value(
                ErrorType::Protocol,
                "cannot kill the current session",
            ));
        }
        if self.sessions.get(target).is_none() {
            return Err(RpcError::invalid_value(
                ErrorType::Protocol,
                format!("no session with id {target}"),
            ));
        }
        info!(by = session_id, killed = target, "kill-session");
        self.teardown_session(target).await;
        Ok(netconf::ok_reply())
    }

    /// Releases everything a dying session holds. Idempotent; the transport
    /// disconnect event for an already-removed session is a no-op.
    pub async fn teardown_session(&mut self, session_id: u32) {
        self.stores.release_session_locks(session_id);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.mark_closed();
        }
        self.sessions.close(session_id);
        if let Some(image) = self.confirm.on_session_closed(session_id) {
            info!(
                session = session_id,
                "confirming session gone; rolling back"
            );
            self.do_rollback(image).await;
        }
    }

    fn check_lock(&self, db: &str, session_id: u32) -> Result<(), RpcError> {
        match self.stores.lock_holder(db) {
            Some(holder) if holder != session_id => Err(RpcError::in_use(
                ErrorType::Protocol,
                format!("datastore '{db}' is locked by session {holder}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Extracts the datastore name from `<source>`/`<target>` arguments.
fn db_arg(op: &XmlNode, which: &str) -> Result<String, RpcError> {
    op.find_db_name(which)
        .map(str::to_string)
        .ok_or_else(|| {
            RpcError::missing_element(
                ErrorType::Protocol,
                which,
                format!("<{}> requires <{which}>", op.name()),
            )
        })
}

/// Parses the optional `<filter>`: xpath select is supported, subtree is not.
fn parse_filter(op: &XmlNode) -> Result<Option<DataPath>, RpcError> {
    let Some(filter) = op.find("filter") else {
        return Ok(None);
    };
    if let Some(select) = filter.attr("select") {
        let path = DataPath::parse(select).map_err(|e| {
            RpcError::invalid_value(ErrorType::Protocol, format!("bad select path: {e}"))
        })?;
        return Ok(Some(path));
    }
    if !filter.children().is_empty() {
        return Err(RpcError::operation_not_supported(
            ErrorType::Protocol,
            "subtree filtering is not supported; use an xpath select",
        ));
    }
    Ok(None)
}

fn with_message_id(mut reply: XmlNode, rpc: &XmlNode) -> XmlNode {
    if let Some(id) = rpc.attr("message-id") {
        reply.set_attr("message-id", id);
    }
    reply
}

