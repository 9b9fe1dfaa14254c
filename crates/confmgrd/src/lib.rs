//! The confmgr backend daemon.
//!
//! A single-threaded cooperative event loop serves NETCONF clients over a
//! control socket: sessions are attached, RPCs are authorized through NACM
//! and dispatched to handlers, edits land in the candidate datastore, and
//! `commit` drives the validate / plugin / promote pipeline with confirmed
//! commit and automatic rollback on top.
//!
//! The [`Backend`] context object owns all shared state (options,
//! datastores, schema, plugin registry, session table, confirmed-commit
//! machine). It is passed explicitly; there is no process-global handle.

pub mod backend;
pub mod commit;
pub mod confirm;
pub mod dispatch;
pub mod event;
pub mod nacm;
pub mod pidfile;
pub mod plugin;
pub mod server;
pub mod session;
pub mod startup;

pub use backend::Backend;
pub use commit::{DiffEntry, Transaction};
pub use confirm::{ConfirmedCommitState, COMMIT_NOT_CONFIRMED};
pub use dispatch::UserRpcHandler;
pub use event::{BackendEvent, CommitNotification};
pub use nacm::{AccessOp, NacmConfig};
pub use plugin::BackendPlugin;
pub use startup::StartupStatus;
