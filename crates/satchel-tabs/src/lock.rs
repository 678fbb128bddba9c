//! Advisory locks over the broadcast channel.
//!
//! Locks are named, cooperative, and expiring. At most one non-expired
//! holder exists per resource across tabs. The acquire protocol is
//! priority-ordered on request time (older requests tend to win, tab id as
//! tiebreak) but only mutual exclusion and liveness are guaranteed, not
//! FIFO fairness:
//!
//! 1. A held, non-expired lock is extended and re-granted to its holder.
//! 2. Otherwise the tab broadcasts `request` and waits; the attempt fails
//!    after `3 × heartbeat_interval`.
//! 3. A `rejected` from the holder or a stronger contender stands the
//!    attempt down; it keeps waiting for `released` until the deadline.
//! 4. An uncontested grace period claims the lock and broadcasts
//!    `acquired`; a `released` from whoever stood the attempt down
//!    re-requests, so multiple waiters re-arbitrate instead of colliding.
//! 5. A peer's `acquired` records the holder and fails any pending attempt.
//!
//! Without a channel every acquire succeeds immediately (single-tab case).

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use satchel_types::channel::TabChannel;
use satchel_types::prelude::*;

/// Lock protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LockMessage {
	#[serde(rename_all = "camelCase")]
	Request { resource: Box<str>, tab_id: Box<str>, priority: u64 },
	#[serde(rename_all = "camelCase")]
	Acquired { resource: Box<str>, tab_id: Box<str>, expires_at: Timestamp },
	#[serde(rename_all = "camelCase")]
	Released { resource: Box<str>, tab_id: Box<str> },
	#[serde(rename_all = "camelCase")]
	Rejected { resource: Box<str>, tab_id: Box<str>, target: Box<str> },
}

/// Lock timing parameters.
#[derive(Debug, Clone)]
pub struct LockConfig {
	/// How long a granted lock lives without extension.
	pub lock_expiry: Duration,
	/// Protocol pacing; the acquire deadline is three times this.
	pub heartbeat_interval: Duration,
}

impl Default for LockConfig {
	fn default() -> Self {
		Self {
			lock_expiry: Duration::from_millis(30_000),
			heartbeat_interval: Duration::from_millis(1000),
		}
	}
}

/// One advisory lock grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
	pub resource: Box<str>,
	pub holder_id: Box<str>,
	pub acquired_at: Timestamp,
	pub expires_at: Timestamp,
}

impl LockRecord {
	fn is_expired(&self, now: Timestamp) -> bool {
		now > self.expires_at
	}
}

/// An in-flight acquire attempt.
struct PendingAcquire {
	priority: u64,
	/// Tab that stood this attempt down (holder or stronger contender).
	stood_down_by: Option<Box<str>>,
	tx: Option<tokio::sync::oneshot::Sender<bool>>,
}

/// Lock and pending tables live under one mutex so protocol handling never
/// observes them out of step.
#[derive(Default)]
struct LockTables {
	locks: HashMap<Box<str>, LockRecord>,
	pending: HashMap<Box<str>, PendingAcquire>,
}

struct LockInner {
	tab_id: Box<str>,
	config: LockConfig,
	channel: Option<Arc<dyn TabChannel>>,
	tables: Mutex<LockTables>,
	destroyed: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LockInner {
	fn send(&self, msg: &LockMessage) {
		let Some(channel) = &self.channel else { return };
		let value = match serde_json::to_value(msg) {
			Ok(value) => value,
			Err(e) => {
				warn!("failed to encode lock message: {}", e);
				return;
			}
		};
		if let Err(e) = channel.send(&value) {
			// Absorbed: the expiry sweep restores correctness.
			warn!("lock channel send failed: {}", e);
		}
	}

	fn grant_locked(&self, tables: &mut LockTables, resource: &str) -> LockRecord {
		let now = Timestamp::now();
		let record = LockRecord {
			resource: resource.into(),
			holder_id: self.tab_id.clone(),
			acquired_at: now,
			expires_at: now.saturating_add_millis(self.config.lock_expiry.as_millis() as u64),
		};
		tables.locks.insert(resource.into(), record.clone());
		record
	}

	/// Acquire locally and announce it, resolving the pending attempt.
	fn grant_pending_locked(&self, tables: &mut LockTables, resource: &str) {
		let record = self.grant_locked(tables, resource);
		if let Some(mut pending) = tables.pending.remove(resource) {
			if let Some(tx) = pending.tx.take() {
				let _ = tx.send(true);
			}
		}
		self.send(&LockMessage::Acquired {
			resource: resource.into(),
			tab_id: self.tab_id.clone(),
			expires_at: record.expires_at,
		});
	}

	/// Claim the lock once a grace period passes with no challenger and no
	/// live holder. Safe to run any number of times; a resolved or
	/// stood-down attempt makes it a no-op.
	fn spawn_claim(inner: &Arc<Self>, resource: Box<str>) {
		let inner = Arc::clone(inner);
		tokio::spawn(async move {
			tokio::time::sleep(inner.config.heartbeat_interval).await;
			if inner.destroyed.load(Ordering::Acquire) {
				return;
			}
			let Ok(mut tables) = inner.tables.lock() else { return };
			let now = Timestamp::now();
			let holder_alive =
				tables.locks.get(&resource).is_some_and(|r| !r.is_expired(now));
			let unchallenged =
				tables.pending.get(&resource).is_some_and(|p| p.stood_down_by.is_none());
			if unchallenged && !holder_alive {
				inner.grant_pending_locked(&mut tables, &resource);
			}
		});
	}

	fn handle_message(inner: &Arc<Self>, msg: LockMessage) {
		match msg {
			LockMessage::Request { resource, tab_id, priority } => {
				if tab_id == inner.tab_id {
					return;
				}
				let Ok(mut tables) = inner.tables.lock() else { return };
				let now = Timestamp::now();
				let held_by_me = tables
					.locks
					.get(&resource)
					.is_some_and(|r| r.holder_id == inner.tab_id && !r.is_expired(now));
				if held_by_me {
					// The holder outranks any request.
					inner.send(&LockMessage::Rejected {
						resource,
						tab_id: inner.tab_id.clone(),
						target: tab_id,
					});
					return;
				}
				let my_tab = inner.tab_id.clone();
				let Some(pending) = tables.pending.get_mut(&resource) else { return };
				// Lower priority value means an older request; tab id
				// breaks exact ties.
				if (pending.priority, my_tab.as_ref()) < (priority, tab_id.as_ref()) {
					inner.send(&LockMessage::Rejected {
						resource,
						tab_id: my_tab,
						target: tab_id,
					});
				} else {
					pending.stood_down_by = Some(tab_id);
				}
			}
			LockMessage::Acquired { resource, tab_id, expires_at } => {
				if tab_id == inner.tab_id {
					return;
				}
				let Ok(mut tables) = inner.tables.lock() else { return };
				let now = Timestamp::now();
				tables.locks.insert(
					resource.clone(),
					LockRecord {
						resource: resource.clone(),
						holder_id: tab_id,
						acquired_at: now,
						expires_at,
					},
				);
				// A peer won the race: the pending attempt fails.
				if let Some(mut pending) = tables.pending.remove(&resource) {
					if let Some(tx) = pending.tx.take() {
						let _ = tx.send(false);
					}
				}
			}
			LockMessage::Released { resource, tab_id } => {
				if tab_id == inner.tab_id {
					return;
				}
				// When whoever stood us down lets go, re-request instead of
				// grabbing straight away: concurrent waiters re-arbitrate
				// through the normal priority path.
				let requeue = {
					let Ok(mut tables) = inner.tables.lock() else { return };
					if tables.locks.get(&resource).is_some_and(|r| r.holder_id == tab_id) {
						tables.locks.remove(&resource);
					}
					match tables.pending.get_mut(&resource) {
						Some(pending)
							if pending.stood_down_by.is_none()
								|| pending.stood_down_by.as_deref()
									== Some(tab_id.as_ref()) =>
						{
							pending.stood_down_by = None;
							Some(pending.priority)
						}
						_ => None,
					}
				};
				if let Some(priority) = requeue {
					inner.send(&LockMessage::Request {
						resource: resource.clone(),
						tab_id: inner.tab_id.clone(),
						priority,
					});
					Self::spawn_claim(inner, resource);
				}
			}
			LockMessage::Rejected { resource, tab_id, target } => {
				if target != inner.tab_id {
					return;
				}
				let Ok(mut tables) = inner.tables.lock() else { return };
				if let Some(pending) = tables.pending.get_mut(&resource) {
					pending.stood_down_by = Some(tab_id);
				}
			}
		}
	}
}

/// Named advisory locks shared between sibling tabs.
pub struct LockManager {
	inner: Arc<LockInner>,
}

impl LockManager {
	pub fn new(
		tab_id: impl Into<Box<str>>,
		channel: Option<Arc<dyn TabChannel>>,
		config: LockConfig,
	) -> Self {
		let inner = Arc::new(LockInner {
			tab_id: tab_id.into(),
			config,
			channel,
			tables: Mutex::new(LockTables::default()),
			destroyed: AtomicBool::new(false),
			tasks: Mutex::new(Vec::new()),
		});

		if let Some(channel) = &inner.channel {
			let mut stream = channel.subscribe();
			let rx_inner = Arc::clone(&inner);
			let handle = tokio::spawn(async move {
				while let Some(value) = stream.next().await {
					if rx_inner.destroyed.load(Ordering::Acquire) {
						break;
					}
					match serde_json::from_value::<LockMessage>(value) {
						Ok(msg) => LockInner::handle_message(&rx_inner, msg),
						Err(e) => debug!("ignoring unparseable lock message: {}", e),
					}
				}
			});
			if let Ok(mut tasks) = inner.tasks.lock() {
				tasks.push(handle);
			}
		}

		// Expiry sweep
		let sweep_inner = Arc::clone(&inner);
		let handle = tokio::spawn(async move {
			loop {
				tokio::time::sleep(sweep_inner.config.heartbeat_interval).await;
				if sweep_inner.destroyed.load(Ordering::Acquire) {
					break;
				}
				let now = Timestamp::now();
				if let Ok(mut tables) = sweep_inner.tables.lock() {
					tables.locks.retain(|_, record| !record.is_expired(now));
				}
			}
		});
		if let Ok(mut tasks) = inner.tasks.lock() {
			tasks.push(handle);
		}

		Self { inner }
	}

	pub fn tab_id(&self) -> &str {
		&self.inner.tab_id
	}

	/// Try to acquire an advisory lock. Resolves `false` on contention or
	/// timeout, never an error.
	pub async fn acquire(&self, resource: &str) -> bool {
		if self.inner.destroyed.load(Ordering::Acquire) {
			return false;
		}
		let now = Timestamp::now();

		let rx = {
			let Ok(mut tables) = self.inner.tables.lock() else { return false };

			if let Some(record) = tables.locks.get(resource) {
				if !record.is_expired(now) {
					if record.holder_id == self.inner.tab_id {
						// Extend and re-grant.
						let extended = self.inner.grant_locked(&mut tables, resource);
						self.inner.send(&LockMessage::Acquired {
							resource: resource.into(),
							tab_id: self.inner.tab_id.clone(),
							expires_at: extended.expires_at,
						});
						return true;
					}
					// Held by a live peer: queue behind it until the
					// deadline, hoping for a release.
				} else {
					tables.locks.remove(resource);
				}
			}

			if self.inner.channel.is_none() {
				self.inner.grant_locked(&mut tables, resource);
				return true;
			}

			if tables.pending.contains_key(resource) {
				debug!("acquire of '{}' already pending on this tab", resource);
				return false;
			}

			let (tx, rx) = tokio::sync::oneshot::channel();
			tables.pending.insert(
				resource.into(),
				PendingAcquire { priority: now.0, stood_down_by: None, tx: Some(tx) },
			);
			self.inner.send(&LockMessage::Request {
				resource: resource.into(),
				tab_id: self.inner.tab_id.clone(),
				priority: now.0,
			});
			rx
		};

		LockInner::spawn_claim(&self.inner, resource.into());

		let deadline = self.inner.config.heartbeat_interval * 3;
		let granted = match tokio::time::timeout(deadline, rx).await {
			Ok(Ok(granted)) => granted,
			_ => false,
		};
		if !granted {
			if let Ok(mut tables) = self.inner.tables.lock() {
				tables.pending.remove(resource);
			}
		}
		granted
	}

	/// Release a lock. Only the holder may release; anything else is a
	/// no-op returning `false`.
	pub fn release(&self, resource: &str) -> bool {
		let Ok(mut tables) = self.inner.tables.lock() else { return false };
		let held = tables
			.locks
			.get(resource)
			.is_some_and(|r| r.holder_id == self.inner.tab_id);
		if !held {
			return false;
		}
		tables.locks.remove(resource);
		self.inner.send(&LockMessage::Released {
			resource: resource.into(),
			tab_id: self.inner.tab_id.clone(),
		});
		true
	}

	/// Release every lock held by this tab (tab close path).
	pub fn release_all(&self) {
		let Ok(mut tables) = self.inner.tables.lock() else { return };
		let mine: Vec<Box<str>> = tables
			.locks
			.values()
			.filter(|r| r.holder_id == self.inner.tab_id)
			.map(|r| r.resource.clone())
			.collect();
		for resource in mine {
			tables.locks.remove(&resource);
			self.inner.send(&LockMessage::Released {
				resource,
				tab_id: self.inner.tab_id.clone(),
			});
		}
	}

	pub fn is_held_by_me(&self, resource: &str) -> bool {
		let now = Timestamp::now();
		self.inner
			.tables
			.lock()
			.map(|tables| {
				tables
					.locks
					.get(resource)
					.is_some_and(|r| r.holder_id == self.inner.tab_id && !r.is_expired(now))
			})
			.unwrap_or(false)
	}

	/// Current non-expired grant for a resource, if any.
	pub fn lock_record(&self, resource: &str) -> Option<LockRecord> {
		let now = Timestamp::now();
		self.inner
			.tables
			.lock()
			.ok()
			.and_then(|tables| tables.locks.get(resource).cloned())
			.filter(|r| !r.is_expired(now))
	}

	/// Run `f` under the lock; `None` when the lock was not acquired.
	pub async fn with_lock<T, Fut>(&self, resource: &str, f: impl FnOnce() -> Fut) -> Option<T>
	where
		Fut: Future<Output = T>,
	{
		if !self.acquire(resource).await {
			return None;
		}
		let result = f().await;
		self.release(resource);
		Some(result)
	}

	/// Release everything and stop protocol tasks. Idempotent.
	pub fn destroy(&self) {
		if self.inner.destroyed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.release_all();
		if let Ok(mut tasks) = self.inner.tasks.lock() {
			for task in tasks.drain(..) {
				task.abort();
			}
		}
	}
}

impl Drop for LockManager {
	fn drop(&mut self) {
		self.destroy();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hub::ChannelHub;
	use std::sync::atomic::AtomicUsize;

	fn config() -> LockConfig {
		LockConfig {
			lock_expiry: Duration::from_millis(60_000),
			heartbeat_interval: Duration::from_millis(30),
		}
	}

	fn manager(hub: &ChannelHub, tab_id: &str) -> LockManager {
		LockManager::new(tab_id, Some(hub.channel("satchel:lock")), config())
	}

	#[tokio::test]
	async fn no_channel_acquires_immediately() {
		let locks = LockManager::new("tab-solo", None, config());
		assert!(locks.acquire("res").await);
		assert!(locks.is_held_by_me("res"));

		assert!(locks.release("res"));
		assert!(!locks.is_held_by_me("res"));
	}

	#[tokio::test]
	async fn held_lock_is_extended_on_reacquire() {
		let locks = LockManager::new("tab-solo", None, config());
		assert!(locks.acquire("res").await);
		let first = locks.lock_record("res").unwrap();

		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(locks.acquire("res").await);
		let second = locks.lock_record("res").unwrap();
		assert!(second.expires_at >= first.expires_at);
	}

	#[tokio::test]
	async fn uncontested_acquire_over_channel_succeeds() {
		let hub = ChannelHub::new();
		let locks = manager(&hub, "tab-a");
		assert!(locks.acquire("res").await);
		assert!(locks.is_held_by_me("res"));
	}

	#[tokio::test]
	async fn contended_acquire_fails_within_deadline() {
		let hub = ChannelHub::new();
		let a = manager(&hub, "tab-a");
		let b = manager(&hub, "tab-b");

		assert!(a.acquire("res").await);

		let started = std::time::Instant::now();
		assert!(!b.acquire("res").await);
		// Bounded wait: 3 x heartbeat_interval plus scheduling margin.
		assert!(started.elapsed() < Duration::from_millis(300));
		assert!(a.is_held_by_me("res"));
		assert!(!b.is_held_by_me("res"));
	}

	#[tokio::test]
	async fn release_hands_over_to_waiting_contender() {
		let hub = ChannelHub::new();
		let a = manager(&hub, "tab-a");
		let b = Arc::new(manager(&hub, "tab-b"));

		assert!(a.acquire("res").await);

		let waiter = tokio::spawn({
			let b = Arc::clone(&b);
			async move { b.acquire("res").await }
		});

		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(a.release("res"));

		assert!(waiter.await.unwrap());
		assert!(b.is_held_by_me("res"));
	}

	#[tokio::test]
	async fn simultaneous_acquires_grant_exactly_one() {
		let hub = ChannelHub::new();
		let a = manager(&hub, "tab-a");
		let b = manager(&hub, "tab-b");

		let (got_a, got_b) = tokio::join!(a.acquire("res"), b.acquire("res"));
		assert!(got_a ^ got_b, "exactly one tab must win (a: {}, b: {})", got_a, got_b);
	}

	#[tokio::test]
	async fn with_lock_returns_none_when_contended() {
		let hub = ChannelHub::new();
		let a = manager(&hub, "tab-a");
		let b = manager(&hub, "tab-b");

		assert!(a.acquire("res").await);
		let result = b.with_lock("res", || async { 42 }).await;
		assert_eq!(result, None);
	}

	#[tokio::test]
	async fn with_lock_runs_critical_sections_mutually_excluded() {
		let hub = ChannelHub::new();
		let managers: Vec<LockManager> =
			["tab-a", "tab-b", "tab-c"].iter().map(|id| manager(&hub, id)).collect();

		let inside = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for m in managers {
			let inside = Arc::clone(&inside);
			let max_seen = Arc::clone(&max_seen);
			handles.push(tokio::spawn(async move {
				m.with_lock("res", || async {
					let current = inside.fetch_add(1, Ordering::SeqCst) + 1;
					max_seen.fetch_max(current, Ordering::SeqCst);
					tokio::time::sleep(Duration::from_millis(10)).await;
					inside.fetch_sub(1, Ordering::SeqCst);
				})
				.await
				.is_some()
			}));
		}

		let mut granted = 0;
		for handle in handles {
			if handle.await.unwrap() {
				granted += 1;
			}
		}

		assert!(granted >= 1);
		assert_eq!(max_seen.load(Ordering::SeqCst), 1, "two tabs were inside the lock");
	}

	#[tokio::test]
	async fn expired_locks_are_swept_and_reacquirable() {
		let hub = ChannelHub::new();
		let short = LockConfig {
			lock_expiry: Duration::from_millis(50),
			heartbeat_interval: Duration::from_millis(20),
		};
		let a = LockManager::new("tab-a", Some(hub.channel("satchel:lock")), short.clone());
		let b = LockManager::new("tab-b", Some(hub.channel("satchel:lock")), short);

		assert!(a.acquire("res").await);
		tokio::time::sleep(Duration::from_millis(80)).await;

		assert!(!a.is_held_by_me("res"));
		assert!(b.acquire("res").await);
	}

	#[tokio::test]
	async fn only_the_holder_may_release() {
		let hub = ChannelHub::new();
		let a = manager(&hub, "tab-a");
		let b = manager(&hub, "tab-b");

		assert!(a.acquire("res").await);
		assert!(!b.release("res"));
		assert!(a.is_held_by_me("res"));
	}

	#[tokio::test]
	async fn release_all_frees_every_held_resource() {
		let locks = LockManager::new("tab-solo", None, config());
		assert!(locks.acquire("r1").await);
		assert!(locks.acquire("r2").await);

		locks.release_all();
		assert!(!locks.is_held_by_me("r1"));
		assert!(!locks.is_held_by_me("r2"));
	}
}

// vim: ts=4
