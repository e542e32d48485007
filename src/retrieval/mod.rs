//! Gap-only retrieval: decides which (place, measure, year) combinations must be
//! fetched, writes fetched data back into the cache and derives aggregates.

pub mod aggregates;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod progress;
