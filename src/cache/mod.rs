//! On-disk cache documents, their codec and migrations, and the per-directory
//! summary index.

pub mod codec;
pub mod document;
pub mod error;
pub mod migration;
pub mod store;
pub mod summary;
pub mod table;
