//! Broadcast channel capability for cross-tab protocols.
//!
//! Each protocol (leader election, locks, sync) uses its own named channel.
//! Messages are JSON objects with a discriminated `type` field. Senders
//! receive their own messages back, so protocol implementations tag every
//! message with a tab id and skip self-originated traffic.
//!
//! Components accept `Option<Arc<dyn TabChannel>>`; `None` is the
//! single-process fallback and must behave like a channel with no peers.

use futures_core::Stream;
use serde_json::Value;
use std::fmt::Debug;
use std::pin::Pin;

use crate::error::DbResult;

/// Stream of raw protocol messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

/// A named broadcast channel shared between sibling tabs.
pub trait TabChannel: Send + Sync + Debug {
	fn name(&self) -> &str;

	/// Broadcast a message to every subscriber, including this tab.
	fn send(&self, msg: &Value) -> DbResult<()>;

	/// Subscribe to messages sent after this call.
	fn subscribe(&self) -> MessageStream;

	/// Close the channel. Subsequent sends fail with `ChannelClosed`;
	/// subscriber streams end.
	fn close(&self);
}

// vim: ts=4
