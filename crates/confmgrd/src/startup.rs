//! Startup-mode processing.
//!
//! The four modes differ in where running comes from: `init` wipes it,
//! `none` trusts the persisted image, `running` re-commits a copy of the
//! persisted running, and `startup` commits the persisted startup store.
//! When the chosen source turns out invalid the failsafe configuration is
//! applied instead and the degraded status is recorded.

use tracing::{info, warn};

use confmgr_common::{BackendError, BackendResult, StartupMode};
use confmgr_datastore::{EditOp, StoreError};
use confmgr_types::parse_xml;

use crate::backend::Backend;
use crate::commit::{diff_trees, Transaction};

/// Outcome of startup processing.
///
/// An uncategorized error is fatal and aborts startup; a parse-category
/// error degrades to `Err`; a validation failure degrades to `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStatus {
    /// Configuration loaded and committed.
    Ok,
    /// Source failed validation; failsafe applied.
    Invalid,
    /// Source could not be parsed; failsafe applied.
    Err,
}

impl Backend {
    /// Runs the configured startup mode and records the status.
    pub(crate) async fn run_startup(&mut self) -> BackendResult<()> {
        self.stores.ensure("running").map_err(fatal)?;

        let mode = self.opts.startup_mode;
        let (mut status, mut reason) = match mode {
            StartupMode::Init => {
                self.stores.reset("running").map_err(fatal)?;
                (StartupStatus::Ok, None)
            }
            StartupMode::None => (StartupStatus::Ok, None),
            StartupMode::Running => {
                self.stores.copy("running", "tmp").map_err(fatal)?;
                self.startup_commit("tmp").await?
            }
            StartupMode::Startup => {
                self.stores.ensure("startup").map_err(fatal)?;
                self.startup_commit("startup").await?
            }
        };

        if status == StartupStatus::Ok && mode != StartupMode::None {
            if let Some(file) = self.opts.extra_config.clone() {
                let (extra_status, extra_reason) = self.merge_extra_config(&file).await?;
                status = extra_status;
                reason = extra_reason;
            }
        }

        if status != StartupStatus::Ok {
            if let Some(reason) = &reason {
                warn!(status = ?status, "startup source rejected: {reason}");
            }
            self.load_failsafe().await?;
        }

        // Initiate the shared candidate from whatever running ended up as.
        self.stores.copy("running", "candidate").map_err(fatal)?;
        self.startup_status = status;
        info!(mode = ?mode, status = ?status, "startup complete");
        Ok(())
    }

    /// Validates and commits a startup source store into running.
    async fn startup_commit(
        &mut self,
        db: &str,
    ) -> BackendResult<(StartupStatus, Option<String>)> {
        // Read first so parse-category failures are distinguished from
        // validation failures.
        match self.stores.get(db) {
            Ok(_) => {}
            Err(StoreError::Fatal(err)) if err.is_parse() => {
                return Ok((StartupStatus::Err, Some(err.to_string())));
            }
            Err(StoreError::NotFound(_)) => {
                self.stores.ensure(db).map_err(fatal)?;
            }
            Err(err) => return Err(fatal(err)),
        }
        match self.candidate_commit(db).await {
            Ok((_, _image)) => Ok((StartupStatus::Ok, None)),
            Err(errors) => {
                let reason = errors
                    .iter()
                    .map(|e| e.log_summary())
                    .collect::<Vec<_>>()
                    .join("; ");
                Ok((StartupStatus::Invalid, Some(reason)))
            }
        }
    }

    /// Merges the `-c` extra XML into running without running the commit
    /// chain, re-validating the result.
    async fn merge_extra_config(
        &mut self,
        file: &std::path::Path,
    ) -> BackendResult<(StartupStatus, Option<String>)> {
        let text = std::fs::read_to_string(file)
            .map_err(|e| BackendError::io(format!("reading extra config {}", file.display()), e))?;
        let tree = match parse_xml(&text) {
            Ok(tree) => tree,
            Err(e) => return Ok((StartupStatus::Err, Some(e.to_string()))),
        };
        self.stores.copy("running", "tmp").map_err(fatal)?;
        if let Err(e) = self.stores.put("tmp", &tree, EditOp::Merge) {
            return Ok((StartupStatus::Invalid, Some(e.to_rpc_error().log_summary())));
        }
        match self.validate_db("tmp") {
            Ok(merged) => {
                self.stores.put_tree("running", &merged).map_err(fatal)?;
                info!(file = %file.display(), "extra configuration merged");
                Ok((StartupStatus::Ok, None))
            }
            Err(errors) => {
                let reason = errors
                    .iter()
                    .map(|e| e.log_summary())
                    .collect::<Vec<_>>()
                    .join("; ");
                Ok((StartupStatus::Invalid, Some(reason)))
            }
        }
    }

    /// Applies the failsafe configuration to running.
    ///
    /// An empty failsafe store is created on first use, so a box without a
    /// provisioned failsafe falls back to an empty configuration.
    pub(crate) async fn load_failsafe(&mut self) -> BackendResult<()> {
        self.stores.ensure("failsafe").map_err(fatal)?;
        let previous = self.stores.get("running").map_err(fatal)?;
        let failsafe = self.stores.get("failsafe").map_err(fatal)?;
        self.stores.put_tree("running", &failsafe).map_err(fatal)?;
        let tx = Transaction {
            source: "failsafe".to_string(),
            target: "running".to_string(),
            diff: diff_trees(&previous, &failsafe, &self.schema),
        };
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.commit(&tx).await {
                warn!(plugin = plugin.name(), error = %e, "plugin failed applying failsafe");
            }
        }
        warn!("failsafe configuration applied");
        Ok(())
    }
}

fn fatal(err: StoreError) -> BackendError {
    match err {
        StoreError::Fatal(e) => e,
        other => BackendError::datastore("startup", other.to_string()),
    }
}
