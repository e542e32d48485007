//! Mapping between logical measures and the cache variables that store them.

pub mod error;
pub mod registry;
