//! Satchel is a client-side, offline-first document database platform.
//!
//! # Features
//!
//! - Document model with causal metadata
//!     - revisions, vector clocks, tombstones
//!     - prototype-pollution-safe ingestion
//! - Reactive queries
//!     - declarative filter/sort/limit/projection specs
//!     - EventReduce: O(1) incremental result maintenance
//!     - live queries with debouncing and replayed state
//! - Materialized views
//!     - named registry, incremental windows, deltas
//!     - aggregations with group-by
//! - Cross-tab coordination
//!     - leader election, advisory locks, change sync
//!     - in-memory broadcast hub as the single-process fallback
//! - Pluggable storage through the `StoreAdapter` trait

// Re-export shared types and adapter traits from satchel-types
pub use satchel_types::change;
pub use satchel_types::channel;
pub use satchel_types::document;
pub use satchel_types::error;
pub use satchel_types::filter;
pub use satchel_types::merge;
pub use satchel_types::query;
pub use satchel_types::store_adapter;
pub use satchel_types::types;
pub use satchel_types::utils;
pub use satchel_types::vclock;

// Feature crate re-exports
pub use satchel_query as live;
pub use satchel_tabs as tabs;
pub use satchel_view as view;

// Local modules
pub mod db;
pub mod prelude;

pub use crate::db::{Collection, Database, DatabaseBuilder, DatabaseConfig};

// vim: ts=4
