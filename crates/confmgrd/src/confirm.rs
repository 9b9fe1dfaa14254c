//! Confirmed-commit lifecycle (RFC 6241 §8.4).
//!
//! A confirmed commit parks the pre-commit image of running and arms a
//! one-shot timer. The commit becomes permanent when re-affirmed in time
//! (plain `commit`, matching the originating session or persist-id) and is
//! rolled back automatically on timer expiry, explicit `cancel-commit`, or
//! disconnect of the originating session in ephemeral mode.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use confmgr_common::netconf::{ErrorType, RpcError};
use confmgr_types::XmlNode;

use crate::backend::Backend;
use crate::commit::{diff_trees, Transaction};
use crate::event::BackendEvent;

/// Logged when an unconfirmed commit has been rolled back.
pub const COMMIT_NOT_CONFIRMED: &str = "Commit was not confirmed; automatic rollback complete.";

/// Rollback result flag: the image could not be applied to running.
pub const ROLLBACK_NOT_APPLIED: u8 = 1;
/// Rollback result flag: the parked rollback store was not deleted.
pub const ROLLBACK_DB_NOT_DELETED: u8 = 2;
/// Rollback result flag: the failsafe configuration was applied instead.
pub const ROLLBACK_FAILSAFE_APPLIED: u8 = 4;

/// Confirmed-commit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmedCommitState {
    /// No confirmed commit in progress.
    #[default]
    Inactive,
    /// In progress with a persist-id; survives the originating session.
    Persistent,
    /// In progress without persist; tied to the originating session.
    Ephemeral,
    /// Rollback has been triggered and is being applied.
    Rollback,
}

/// The confirmed-commit context; one per backend.
#[derive(Debug, Default)]
pub struct ConfirmCtx {
    state: ConfirmedCommitState,
    persist_id: Option<String>,
    session_id: Option<u32>,
    rollback_image: Option<XmlNode>,
    cancel: Option<oneshot::Sender<()>>,
    epoch: u64,
}

impl ConfirmCtx {
    /// Creates an inactive context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConfirmedCommitState {
        self.state
    }

    /// True while a confirmed commit is pending.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConfirmedCommitState::Ephemeral | ConfirmedCommitState::Persistent
        )
    }

    /// Session that issued the pending confirmed commit.
    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// Checks whether `session_id` may issue a follow-up confirmed commit.
    ///
    /// An ephemeral confirmed commit is owned by its session; a persistent
    /// one is taken over by presenting the matching persist-id.
    pub fn may_extend(&self, session_id: u32, persist_id: Option<&str>) -> Result<(), RpcError> {
        match self.state {
            ConfirmedCommitState::Inactive => Ok(()),
            ConfirmedCommitState::Ephemeral => {
                if self.session_id == Some(session_id) {
                    Ok(())
                } else {
                    Err(RpcError::operation_failed(
                        ErrorType::Protocol,
                        "a confirmed-commit is already in progress from another session",
                    ))
                }
            }
            ConfirmedCommitState::Persistent => {
                if persist_id.is_some() && persist_id == self.persist_id.as_deref() {
                    Ok(())
                } else if self.session_id == Some(session_id) {
                    Ok(())
                } else {
                    Err(RpcError::invalid_value(
                        ErrorType::Protocol,
                        "persist-id does not match the pending confirmed-commit",
                    ))
                }
            }
            ConfirmedCommitState::Rollback => Err(RpcError::in_use(
                ErrorType::Protocol,
                "rollback in progress",
            )),
        }
    }

    /// Checks whether a plain `commit` from `session_id` finalizes the
    /// pending confirmed commit.
    pub fn may_finalize(&self, session_id: u32, persist_id: Option<&str>) -> Result<(), RpcError> {
        match self.state {
            ConfirmedCommitState::Ephemeral => {
                if self.session_id == Some(session_id) {
                    Ok(())
                } else {
                    Err(RpcError::operation_failed(
                        ErrorType::Protocol,
                        "only the confirming session can finalize this commit",
                    ))
                }
            }
            ConfirmedCommitState::Persistent => {
                if persist_id.is_some() && persist_id == self.persist_id.as_deref() {
                    Ok(())
                } else {
                    Err(RpcError::invalid_value(
                        ErrorType::Protocol,
                        "persist-id does not match the pending confirmed-commit",
                    ))
                }
            }
            _ => Ok(()),
        }
    }

    /// Arms the context after a successful confirmed commit.
    pub fn arm(
        &mut self,
        timeout: Duration,
        image: XmlNode,
        session_id: u32,
        persist_id: Option<String>,
        event_tx: mpsc::UnboundedSender<BackendEvent>,
    ) {
        self.state = if persist_id.is_some() {
            ConfirmedCommitState::Persistent
        } else {
            ConfirmedCommitState::Ephemeral
        };
        self.persist_id = persist_id;
        self.session_id = Some(session_id);
        self.rollback_image = Some(image);
        self.spawn_timer(timeout, event_tx);
        info!(
            state = ?self.state,
            session = session_id,
            timeout_s = timeout.as_secs(),
            "confirmed-commit armed"
        );
    }

    /// Restarts the timer for a follow-up confirmed commit, preserving the
    /// original rollback image. A persist-id in the follow-up re-binds the
    /// pending commit (takeover); mode may flip accordingly.
    pub fn extend(
        &mut self,
        timeout: Duration,
        session_id: u32,
        persist_id: Option<String>,
        event_tx: mpsc::UnboundedSender<BackendEvent>,
    ) {
        if persist_id.is_some() {
            self.state = ConfirmedCommitState::Persistent;
            self.persist_id = persist_id;
        }
        self.session_id = Some(session_id);
        self.spawn_timer(timeout, event_tx);
        info!(timeout_s = timeout.as_secs(), "confirmed-commit extended");
    }

    /// Finalizes: cancels the timer and discards the rollback image.
    pub fn finalize(&mut self) -> Option<XmlNode> {
        self.cancel_timer();
        self.persist_id = None;
        self.session_id = None;
        self.state = ConfirmedCommitState::Inactive;
        self.rollback_image.take()
    }

    /// Timer expiry; returns the image to roll back to if the epoch is
    /// current and a confirmed commit is pending.
    pub fn on_timeout(&mut self, epoch: u64) -> Option<XmlNode> {
        if epoch != self.epoch || !self.is_active() {
            return None;
        }
        self.begin_rollback()
    }

    /// Session death; an ephemeral confirmed commit rolls back when its
    /// originating session goes away.
    pub fn on_session_closed(&mut self, session_id: u32) -> Option<XmlNode> {
        if self.state == ConfirmedCommitState::Ephemeral && self.session_id == Some(session_id) {
            return self.begin_rollback();
        }
        None
    }

    /// Explicit `cancel-commit`. Without a persist-id the canceling session
    /// must be the originating one.
    pub fn begin_cancel(
        &mut self,
        session_id: u32,
        persist_id: Option<&str>,
    ) -> Result<XmlNode, RpcError> {
        if !self.is_active() {
            return Err(RpcError::operation_failed(
                ErrorType::Protocol,
                "no confirmed-commit is in progress",
            ));
        }
        match persist_id {
            Some(id) => {
                if self.persist_id.as_deref() != Some(id) {
                    return Err(RpcError::invalid_value(
                        ErrorType::Protocol,
                        "persist-id does not match the pending confirmed-commit",
                    ));
                }
            }
            None => {
                if self.session_id != Some(session_id) {
                    return Err(RpcError::operation_failed(
                        ErrorType::Protocol,
                        "cancel-commit must come from the confirming session",
                    ));
                }
            }
        }
        self.begin_rollback().ok_or_else(|| {
            RpcError::operation_failed(ErrorType::Application, "rollback image missing")
        })
    }

    fn begin_rollback(&mut self) -> Option<XmlNode> {
        self.cancel_timer();
        self.state = ConfirmedCommitState::Rollback;
        self.persist_id = None;
        self.session_id = None;
        self.rollback_image.take()
    }

    /// Returns to INACTIVE after rollback has been applied.
    pub fn rollback_done(&mut self) {
        self.state = ConfirmedCommitState::Inactive;
    }

    fn spawn_timer(&mut self, timeout: Duration, event_tx: mpsc::UnboundedSender<BackendEvent>) {
        self.cancel_timer();
        self.epoch += 1;
        let epoch = self.epoch;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel = Some(cancel_tx);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = event_tx.send(BackendEvent::ConfirmTimeout { epoch });
                }
                _ = cancel_rx => {}
            }
        });
    }

    /// Cancels any armed timer; safe to call repeatedly.
    fn cancel_timer(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Backend {
    /// Applies a parked rollback image to running.
    ///
    /// Returns the result flags; `0` is full success. The confirmed-commit
    /// context is INACTIVE afterwards regardless.
    pub(crate) async fn do_rollback(&mut self, image: XmlNode) -> u8 {
        let mut errs: u8 = 0;

        let current = match self.stores.get("running") {
            Ok(tree) => tree,
            Err(e) => {
                error!(error = %e, "cannot read running for rollback");
                self.confirm.rollback_done();
                return ROLLBACK_NOT_APPLIED;
            }
        };
        let tx = Transaction {
            source: "rollback".to_string(),
            target: "running".to_string(),
            diff: diff_trees(&current, &image, &self.schema),
        };

        if let Err(e) = self.stores.put_tree("running", &image) {
            error!(error = %e, "rollback image could not be applied");
            errs |= ROLLBACK_NOT_APPLIED;
        } else {
            for plugin in self.plugins.iter_mut() {
                if let Err(e) = plugin.commit(&tx).await {
                    warn!(plugin = plugin.name(), error = %e, "plugin failed during rollback");
                    errs |= ROLLBACK_NOT_APPLIED;
                }
            }
        }

        if errs & ROLLBACK_NOT_APPLIED != 0 {
            if self.load_failsafe().await.is_ok() {
                errs |= ROLLBACK_FAILSAFE_APPLIED;
            }
        }

        // Reset candidate so it mirrors the restored running.
        if let Err(e) = self.stores.copy("running", "candidate") {
            warn!(error = %e, "candidate reset after rollback failed");
        }

        if self.stores.exists("rollback") {
            if let Err(e) = self.stores.delete("rollback") {
                warn!(error = %e, "rollback store not deleted");
                errs |= ROLLBACK_DB_NOT_DELETED;
            }
        }

        self.confirm.rollback_done();
        self.rebuild_nacm();

        if errs == 0 {
            info!("{}", COMMIT_NOT_CONFIRMED);
        } else {
            error!(flags = errs, "rollback completed with errors");
        }
        errs
    }

    /// Reacts to a confirmed-commit timer event from the event loop.
    pub(crate) async fn on_confirm_timeout(&mut self, epoch: u64) {
        if let Some(image) = self.confirm.on_timeout(epoch) {
            self.do_rollback(image).await;
        }
    }
}
