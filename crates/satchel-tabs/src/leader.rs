//! Leader election over a broadcast channel.
//!
//! At most one leader across sibling tabs at any time, with eventual
//! convergence to exactly one whenever at least one tab is alive. Priority
//! is the complement of the tab's creation time (the oldest tab wins, tab
//! id as tiebreak). Messages are not totally ordered across tabs;
//! correctness relies on the priority tie-breaks and on
//! `leader_timeout > 2 × heartbeat_interval`, not on FIFO delivery.
//!
//! Protocol sketch:
//! 1. Without a channel, the tab adopts leadership immediately.
//! 2. Otherwise broadcast `election` and wait `2 × heartbeat_interval`; if
//!    no stronger election arrives, become leader and start heartbeating.
//! 3. A stronger `election` cancels the pending one; a leader steps down.
//! 4. A `heartbeat` adopts the sender as leader and refreshes liveness.
//! 5. A missed heartbeat (`leader_timeout`) starts a new election.
//! 6. An `abdicate` clears the leader and re-elects after a randomized
//!    jitter of at most 500 ms to reduce re-collision.

use futures::StreamExt;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use satchel_types::channel::TabChannel;
use satchel_types::prelude::*;

use crate::tabs::TabInfo;

/// Maximum randomized delay before re-electing after an abdication.
const ABDICATE_JITTER_MS: u64 = 500;

/// Election protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ElectionMessage {
	#[serde(rename_all = "camelCase")]
	Election { tab_id: Box<str>, priority: u64 },
	#[serde(rename_all = "camelCase")]
	Heartbeat { tab_id: Box<str>, priority: u64 },
	#[serde(rename_all = "camelCase")]
	Abdicate { tab_id: Box<str> },
}

/// Election timing parameters.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
	pub heartbeat_interval: Duration,
	pub leader_timeout: Duration,
}

impl Default for ElectionConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_millis(1000),
			leader_timeout: Duration::from_millis(3000),
		}
	}
}

impl ElectionConfig {
	/// The timeout must exceed two heartbeat intervals, or a healthy leader
	/// could be deposed between beats.
	pub fn validate(&self) -> DbResult<()> {
		if self.leader_timeout <= self.heartbeat_interval * 2 {
			return Err(Error::ValidationError(
				"leader_timeout must exceed 2 x heartbeat_interval".to_string(),
			));
		}
		Ok(())
	}
}

/// Observable election state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderState {
	pub leader_id: Option<Box<str>>,
	pub elected_at: Option<Timestamp>,
	pub last_heartbeat: Option<Timestamp>,
	pub is_leader: bool,
}

/// Emitted whenever the leader identity changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChanged {
	pub leader_id: Option<Box<str>>,
	pub is_self: bool,
}

struct ElectorInner {
	tab: TabInfo,
	config: ElectionConfig,
	channel: Option<Arc<dyn TabChannel>>,
	state: Mutex<LeaderState>,
	events_tx: tokio::sync::broadcast::Sender<LeaderChanged>,
	/// Bumping the epoch cancels any pending election wait.
	election_epoch: AtomicU64,
	election_pending: AtomicBool,
	destroyed: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ElectorInner {
	fn send(&self, msg: &ElectionMessage) {
		let Some(channel) = &self.channel else { return };
		let value = match serde_json::to_value(msg) {
			Ok(value) => value,
			Err(e) => {
				warn!("failed to encode election message: {}", e);
				return;
			}
		};
		if let Err(e) = channel.send(&value) {
			// Absorbed: a later heartbeat or election restores correctness.
			warn!("election channel send failed: {}", e);
		}
	}

	/// True when (priority, tab_id) beats this tab.
	fn outranks_me(&self, priority: u64, tab_id: &str) -> bool {
		(priority, std::cmp::Reverse(tab_id))
			> (self.tab.priority(), std::cmp::Reverse(self.tab.tab_id.as_ref()))
	}

	fn spawn(&self, handle: JoinHandle<()>) {
		if let Ok(mut tasks) = self.tasks.lock() {
			tasks.push(handle);
		}
	}

	/// Update leader identity, refresh liveness, and emit on change.
	fn set_leader(&self, leader_id: Option<Box<str>>, is_self: bool) {
		let changed = {
			let Ok(mut state) = self.state.lock() else { return };
			let changed = state.leader_id != leader_id || state.is_leader != is_self;
			let now = Timestamp::now();
			if state.leader_id != leader_id {
				state.elected_at = leader_id.as_ref().map(|_| now);
			}
			state.last_heartbeat = leader_id.as_ref().map(|_| now);
			state.leader_id = leader_id.clone();
			state.is_leader = is_self;
			changed
		};
		if changed {
			debug!(
				"tab {} sees leader {:?} (self: {})",
				self.tab.tab_id, leader_id, is_self
			);
			let _ = self.events_tx.send(LeaderChanged { leader_id, is_self });
		}
	}

	fn refresh_heartbeat(&self, leader_id: &str) {
		if let Ok(mut state) = self.state.lock() {
			if state.leader_id.as_deref() == Some(leader_id) {
				state.last_heartbeat = Some(Timestamp::now());
			}
		}
	}

	fn is_leader(&self) -> bool {
		self.state.lock().map(|s| s.is_leader).unwrap_or(false)
	}

	fn cancel_pending_election(&self) {
		self.election_epoch.fetch_add(1, Ordering::AcqRel);
		self.election_pending.store(false, Ordering::Release);
	}

	fn become_leader(inner: &Arc<Self>) {
		if inner.destroyed.load(Ordering::Acquire) {
			return;
		}
		inner.election_pending.store(false, Ordering::Release);
		inner.set_leader(Some(inner.tab.tab_id.clone()), true);

		let beat = Arc::clone(inner);
		let handle = tokio::spawn(async move {
			loop {
				if beat.destroyed.load(Ordering::Acquire) || !beat.is_leader() {
					break;
				}
				beat.send(&ElectionMessage::Heartbeat {
					tab_id: beat.tab.tab_id.clone(),
					priority: beat.tab.priority(),
				});
				tokio::time::sleep(beat.config.heartbeat_interval).await;
			}
		});
		inner.spawn(handle);
	}

	/// Broadcast an election and claim leadership if nothing stronger
	/// answers within two heartbeat intervals.
	fn start_election(inner: &Arc<Self>) {
		if inner.destroyed.load(Ordering::Acquire)
			|| inner.election_pending.swap(true, Ordering::AcqRel)
		{
			return;
		}
		let epoch = inner.election_epoch.fetch_add(1, Ordering::AcqRel) + 1;
		debug!("tab {} starts election (epoch {})", inner.tab.tab_id, epoch);
		inner.send(&ElectionMessage::Election {
			tab_id: inner.tab.tab_id.clone(),
			priority: inner.tab.priority(),
		});

		let wait = Arc::clone(inner);
		let handle = tokio::spawn(async move {
			tokio::time::sleep(wait.config.heartbeat_interval * 2).await;
			if wait.destroyed.load(Ordering::Acquire) {
				return;
			}
			if wait.election_epoch.load(Ordering::Acquire) != epoch {
				// Canceled by a stronger election or a heartbeat.
				return;
			}
			Self::become_leader(&wait);
		});
		inner.spawn(handle);
	}

	fn handle_message(inner: &Arc<Self>, msg: ElectionMessage) {
		match msg {
			ElectionMessage::Election { tab_id, priority } => {
				if tab_id == inner.tab.tab_id {
					return;
				}
				if inner.outranks_me(priority, &tab_id) {
					inner.cancel_pending_election();
					if inner.is_leader() {
						// A stronger candidate is running: step down and let
						// its heartbeat re-establish the leader.
						inner.set_leader(None, false);
					}
				} else if inner.is_leader() {
					// Reassert so the weaker candidate cancels.
					inner.send(&ElectionMessage::Heartbeat {
						tab_id: inner.tab.tab_id.clone(),
						priority: inner.tab.priority(),
					});
				} else if !inner.election_pending.load(Ordering::Acquire) {
					// A weaker tab is electing itself while we are idle;
					// our own election outranks it.
					Self::start_election(inner);
				}
			}
			ElectionMessage::Heartbeat { tab_id, priority } => {
				if tab_id == inner.tab.tab_id {
					return;
				}
				if inner.is_leader() {
					if inner.outranks_me(priority, &tab_id) {
						inner.set_leader(Some(tab_id), false);
					} else {
						inner.send(&ElectionMessage::Heartbeat {
							tab_id: inner.tab.tab_id.clone(),
							priority: inner.tab.priority(),
						});
					}
					return;
				}
				inner.cancel_pending_election();
				let known = {
					let state = inner.state.lock();
					state.map(|s| s.leader_id.clone()).unwrap_or(None)
				};
				if known.as_deref() == Some(tab_id.as_ref()) {
					inner.refresh_heartbeat(&tab_id);
				} else {
					inner.set_leader(Some(tab_id), false);
				}
			}
			ElectionMessage::Abdicate { tab_id } => {
				if tab_id == inner.tab.tab_id {
					return;
				}
				let was_leader = {
					let state = inner.state.lock();
					state.map(|s| s.leader_id.as_deref() == Some(tab_id.as_ref())).unwrap_or(false)
				};
				if !was_leader {
					return;
				}
				inner.set_leader(None, false);

				// Randomized jitter reduces re-collision between the
				// surviving tabs' elections.
				let retry = Arc::clone(inner);
				let jitter = Duration::from_millis(rand::rng().random_range(0..=ABDICATE_JITTER_MS));
				let handle = tokio::spawn(async move {
					tokio::time::sleep(jitter).await;
					Self::start_election(&retry);
				});
				inner.spawn(handle);
			}
		}
	}
}

/// Elects exactly one leader among sibling tabs.
pub struct LeaderElector {
	inner: Arc<ElectorInner>,
}

impl LeaderElector {
	pub fn new(
		tab: TabInfo,
		channel: Option<Arc<dyn TabChannel>>,
		config: ElectionConfig,
	) -> Self {
		let (events_tx, _) = tokio::sync::broadcast::channel(64);
		Self {
			inner: Arc::new(ElectorInner {
				tab,
				config,
				channel,
				state: Mutex::new(LeaderState::default()),
				events_tx,
				election_epoch: AtomicU64::new(0),
				election_pending: AtomicBool::new(false),
				destroyed: AtomicBool::new(false),
				tasks: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Join the election: adopt leadership directly without a channel,
	/// otherwise start the broadcast handshake and the liveness monitor.
	pub fn start(&self) -> DbResult<()> {
		self.inner.config.validate()?;

		let Some(channel) = &self.inner.channel else {
			ElectorInner::become_leader(&self.inner);
			return Ok(());
		};

		// Receive task
		let mut stream = channel.subscribe();
		let inner = Arc::clone(&self.inner);
		self.inner.spawn(tokio::spawn(async move {
			while let Some(value) = stream.next().await {
				if inner.destroyed.load(Ordering::Acquire) {
					break;
				}
				match serde_json::from_value::<ElectionMessage>(value) {
					Ok(msg) => ElectorInner::handle_message(&inner, msg),
					Err(e) => debug!("ignoring unparseable election message: {}", e),
				}
			}
		}));

		// Liveness monitor: detect missed heartbeats.
		let inner = Arc::clone(&self.inner);
		self.inner.spawn(tokio::spawn(async move {
			loop {
				tokio::time::sleep(inner.config.heartbeat_interval).await;
				if inner.destroyed.load(Ordering::Acquire) {
					break;
				}
				if inner.is_leader() || inner.election_pending.load(Ordering::Acquire) {
					continue;
				}
				let stale = {
					let Ok(state) = inner.state.lock() else { continue };
					match (&state.leader_id, state.last_heartbeat) {
						(Some(_), Some(seen)) => {
							Timestamp::now().millis_since(seen)
								> inner.config.leader_timeout.as_millis() as u64
						}
						(Some(_), None) => true,
						(None, _) => true,
					}
				};
				if stale {
					inner.set_leader(None, false);
					ElectorInner::start_election(&inner);
				}
			}
		}));

		ElectorInner::start_election(&self.inner);
		Ok(())
	}

	pub fn state(&self) -> LeaderState {
		self.inner.state.lock().map(|s| s.clone()).unwrap_or_default()
	}

	pub fn is_leader(&self) -> bool {
		self.inner.is_leader()
	}

	pub fn leader_id(&self) -> Option<Box<str>> {
		self.state().leader_id
	}

	pub fn tab_id(&self) -> &str {
		&self.inner.tab.tab_id
	}

	/// Leader-change notifications.
	pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LeaderChanged> {
		self.inner.events_tx.subscribe()
	}

	/// Abdicate if leader, then tear down timers and the channel
	/// subscription. Idempotent.
	pub fn destroy(&self) {
		if self.inner.destroyed.swap(true, Ordering::AcqRel) {
			return;
		}
		if self.inner.is_leader() {
			self.inner
				.send(&ElectionMessage::Abdicate { tab_id: self.inner.tab.tab_id.clone() });
		}
		self.inner.set_leader(None, false);
		if let Ok(mut tasks) = self.inner.tasks.lock() {
			for task in tasks.drain(..) {
				task.abort();
			}
		}
	}
}

impl Drop for LeaderElector {
	fn drop(&mut self) {
		self.destroy();
	}
}


// vim: ts=4
