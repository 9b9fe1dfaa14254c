//! Core data types for the confmgr configuration backend.
//!
//! This crate provides the building blocks shared by every other confmgr
//! crate:
//!
//! - [`XmlNode`]: a namespace-aware XML document tree
//! - [`parse_xml`]: a parser producing [`XmlNode`] trees from text
//! - [`DataPath`]: slash-separated data node paths with key predicates
//! - [`PathExpr`]: the restricted predicate expressions used by schema
//!   `when`/`must` constraints

mod path;
mod xml;

pub mod parse;

pub use parse::{parse_xml, XmlParseError};
pub use path::{DataPath, PathExpr, PathStep};
pub use xml::{escape_xml, XmlNode};

/// Base NETCONF namespace (RFC 6241).
pub const NETCONF_BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// Common error type for malformed paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("invalid path step: {0}")]
    InvalidStep(String),

    #[error("unterminated predicate in: {0}")]
    UnterminatedPredicate(String),

    #[error("invalid expression: {0}")]
    InvalidExpr(String),
}
