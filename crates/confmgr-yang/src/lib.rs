//! YANG schema API and validation for the confmgr backend.
//!
//! The backend does not parse YANG source; schemas are supplied through the
//! builder API in [`schema`] by plugins or embedding applications. The
//! [`validate`] module checks configuration trees against a loaded schema
//! and reports violations as NETCONF error fragments.

pub mod schema;
pub mod validate;

pub use schema::{LeafType, Module, MustConstraint, NodeKind, Schema, SchemaNode};
pub use validate::{validate, MAX_VALIDATION_ERRORS};
