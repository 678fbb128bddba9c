//! Reactive query engine: the EventReduce change→action compiler and live
//! queries maintained under a change stream.

pub mod live;
pub mod reduce;

pub use live::{LiveQuery, LiveQueryConfig, LiveQueryState};
pub use reduce::{apply_action, insertion_index, reduce, Action};

// vim: ts=4
