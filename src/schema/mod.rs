//! Versioned schema metadata for cache documents.
//!
//! The registry is a static YAML table read once at startup. Exactly one version is
//! current; older versions only describe how a legacy document is recognised and
//! lifted into the current layout.

pub mod error;
pub mod registry;
