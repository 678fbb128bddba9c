//! In-memory broadcast hub: the single-process implementation of the
//! `TabChannel` capability.
//!
//! A hub owns one tokio broadcast channel per name; every handle obtained
//! for the same name shares it, so "tabs" created from the same hub see
//! each other's messages — including their own, exactly like the browser
//! BroadcastChannel loopback the protocols are written against.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use satchel_types::channel::{MessageStream, TabChannel};
use satchel_types::prelude::*;

/// Default per-channel buffer.
const DEFAULT_CAPACITY: usize = 256;

/// Registry of named in-memory broadcast channels.
#[derive(Debug)]
pub struct ChannelHub {
	channels: RwLock<HashMap<Box<str>, tokio::sync::broadcast::Sender<Value>>>,
	capacity: usize,
}

impl Default for ChannelHub {
	fn default() -> Self {
		Self::new()
	}
}

impl ChannelHub {
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		Self { channels: RwLock::new(HashMap::new()), capacity }
	}

	/// Handle on the named channel, creating it on first use. Handles for
	/// the same name share delivery.
	pub fn channel(&self, name: &str) -> Arc<MemoryChannel> {
		let tx = {
			let channels = self.channels.read().unwrap_or_else(std::sync::PoisonError::into_inner);
			channels.get(name).cloned()
		};
		let tx = match tx {
			Some(tx) => tx,
			None => {
				let mut channels =
					self.channels.write().unwrap_or_else(std::sync::PoisonError::into_inner);
				channels
					.entry(name.into())
					.or_insert_with(|| tokio::sync::broadcast::channel(self.capacity).0)
					.clone()
			}
		};
		Arc::new(MemoryChannel { name: name.into(), tx, closed: AtomicBool::new(false) })
	}
}

/// One tab's handle on a hub channel.
#[derive(Debug)]
pub struct MemoryChannel {
	name: Box<str>,
	tx: tokio::sync::broadcast::Sender<Value>,
	closed: AtomicBool,
}

impl TabChannel for MemoryChannel {
	fn name(&self) -> &str {
		&self.name
	}

	fn send(&self, msg: &Value) -> DbResult<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::ChannelClosed);
		}
		// No subscribers is not an error; the message is simply dropped.
		let _ = self.tx.send(msg.clone());
		Ok(())
	}

	fn subscribe(&self) -> MessageStream {
		let mut rx = self.tx.subscribe();
		let name = self.name.to_string();

		Box::pin(async_stream::stream! {
			loop {
				match rx.recv().await {
					Ok(msg) => yield msg,
					Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
						warn!("channel '{}' lagged, missed {} messages", name, n);
						continue;
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
				}
			}
		})
	}

	fn close(&self) {
		self.closed.store(true, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::StreamExt;
	use serde_json::json;

	#[tokio::test]
	async fn same_name_shares_delivery() {
		let hub = ChannelHub::new();
		let a = hub.channel("satchel:test");
		let b = hub.channel("satchel:test");

		let mut stream = b.subscribe();
		a.send(&json!({"type": "ping"})).unwrap();

		let msg = stream.next().await.unwrap();
		assert_eq!(msg, json!({"type": "ping"}));
	}

	#[tokio::test]
	async fn sender_receives_its_own_messages() {
		let hub = ChannelHub::new();
		let a = hub.channel("satchel:test");

		let mut stream = a.subscribe();
		a.send(&json!({"n": 1})).unwrap();

		assert_eq!(stream.next().await.unwrap(), json!({"n": 1}));
	}

	#[tokio::test]
	async fn different_names_are_isolated() {
		let hub = ChannelHub::new();
		let a = hub.channel("satchel:leader");
		let b = hub.channel("satchel:lock");

		let mut stream = b.subscribe();
		a.send(&json!({"n": 1})).unwrap();
		b.send(&json!({"n": 2})).unwrap();

		assert_eq!(stream.next().await.unwrap(), json!({"n": 2}));
	}

	#[tokio::test]
	async fn closed_channel_rejects_sends() {
		let hub = ChannelHub::new();
		let a = hub.channel("satchel:test");
		a.close();

		assert!(matches!(a.send(&json!({})), Err(Error::ChannelClosed)));
	}

	#[tokio::test]
	async fn close_is_per_handle() {
		let hub = ChannelHub::new();
		let a = hub.channel("satchel:test");
		let b = hub.channel("satchel:test");
		a.close();

		// b's handle on the shared channel keeps working.
		let mut stream = b.subscribe();
		b.send(&json!({"n": 1})).unwrap();
		assert_eq!(stream.next().await.unwrap(), json!({"n": 1}));
	}
}

// vim: ts=4
