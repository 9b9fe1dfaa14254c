//! Named configuration datastores for the confmgr backend.
//!
//! A [`DatastoreSet`] manages the named configuration instances the backend
//! works with (candidate, running, startup, failsafe, scratch stores), each
//! persisted as one file under the datastore directory. Edits follow
//! NETCONF `edit-config` semantics ([`EditOp`]); copies are atomic at the
//! file level; a write-through cache keeps hot stores in memory.

mod edit;
mod store;

pub use edit::EditOp;
pub use store::{Content, DatastoreConfig, DatastoreSet, StoreError, StoreResult};
