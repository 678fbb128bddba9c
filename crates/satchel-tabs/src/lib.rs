//! Cross-tab coordination for Satchel: tab identity, the in-memory
//! broadcast hub, leader election, advisory locks, and change sync.
//!
//! Every protocol runs over the `TabChannel` capability with a distinct
//! channel name, and degrades to sensible single-tab behavior when no
//! channel is configured.

pub mod hub;
pub mod leader;
pub mod lock;
pub mod sync;
pub mod tabs;

pub use hub::{ChannelHub, MemoryChannel};
pub use leader::{ElectionConfig, LeaderChanged, LeaderElector, LeaderState};
pub use lock::{LockConfig, LockManager, LockRecord};
pub use sync::{CrossTabSync, SyncConfig};
pub use tabs::{TabInfo, TabManager};

// vim: ts=4
