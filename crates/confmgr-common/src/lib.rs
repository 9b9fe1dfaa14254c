//! Shared infrastructure for the confmgr backend.
//!
//! This crate carries the pieces every layer of the backend needs:
//!
//! - [`BackendError`]: the internal error type, with constructor helpers
//! - [`netconf`]: RFC 6241 `<rpc-error>` construction and rendering
//! - [`options`]: the backend option set and its XML config-file loader

pub mod error;
pub mod netconf;
pub mod options;

pub use error::{BackendError, BackendResult};
pub use netconf::{ErrorTag, ErrorType, MergeOutcome, RpcError};
pub use options::{BackendOptions, DbFormat, LogDest, NacmMode, SockFamily, StartupMode};
