#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_protocol::messages::{ChatInfoBody, ChatMessage, Frame, UserInfo};
use parley_store::Store;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Tunables for a room's event loop.
#[derive(Debug, Clone)]
pub struct RoomConfig {
	/// Maximum queued outbound frames per subscriber before eviction.
	pub subscriber_queue_capacity: usize,

	pub command_queue_capacity: usize,
}

impl Default for RoomConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 32,
			command_queue_capacity: 16,
		}
	}
}

/// Snapshot used for the room listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomInfo {
	pub online_users: usize,
	pub has_password: bool,
}

enum RoomCommand {
	Subscribe {
		username: String,
		public_key: Vec<u8>,
		reply: oneshot::Sender<mpsc::Receiver<Frame>>,
	},
	Unsubscribe {
		username: String,
	},
	Broadcast {
		frame: Frame,
	},
	Publish {
		username: String,
		frame: Frame,
	},
	Info {
		reply: oneshot::Sender<RoomInfo>,
	},
}

/// The room's event loop has stopped.
#[derive(Debug, Error)]
#[error("room event loop is not running")]
pub struct RoomUnavailable;

/// Cheap cloneable handle to one room's event loop.
///
/// All mutation goes through the command channel; the subscriber set is
/// owned exclusively by the loop task.
#[derive(Clone)]
pub struct RoomHandle {
	name: Arc<str>,
	password_hash: Arc<Vec<u8>>,
	hidden: bool,
	cmd_tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn hidden(&self) -> bool {
		self.hidden
	}

	pub fn has_password(&self) -> bool {
		!self.password_hash.is_empty()
	}

	/// Constant-time check of a client-supplied plaintext password against
	/// the stored SHA-256 hash. Unprotected rooms accept anything.
	pub fn check_password(&self, password: &str) -> bool {
		if self.password_hash.is_empty() {
			return true;
		}
		let digest = Sha256::digest(password.as_bytes());
		self.password_hash.as_slice().ct_eq(digest.as_slice()).into()
	}

	/// Join the room. The returned receiver is the subscriber's bounded
	/// sink; a duplicate username gets an error frame followed by sink
	/// closure.
	pub async fn subscribe(&self, username: String, public_key: Vec<u8>) -> Result<mpsc::Receiver<Frame>, RoomUnavailable> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(RoomCommand::Subscribe {
				username,
				public_key,
				reply,
			})
			.await
			.map_err(|_| RoomUnavailable)?;
		rx.await.map_err(|_| RoomUnavailable)
	}

	pub async fn unsubscribe(&self, username: &str) {
		let _ = self
			.cmd_tx
			.send(RoomCommand::Unsubscribe {
				username: username.to_string(),
			})
			.await;
	}

	/// Fan a frame out to every subscriber.
	pub async fn broadcast(&self, frame: Frame) {
		let _ = self.cmd_tx.send(RoomCommand::Broadcast { frame }).await;
	}

	/// Deliver a frame to one subscriber, if present.
	pub async fn publish(&self, username: &str, frame: Frame) {
		let _ = self
			.cmd_tx
			.send(RoomCommand::Publish {
				username: username.to_string(),
				frame,
			})
			.await;
	}

	pub async fn info(&self) -> Option<RoomInfo> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx.send(RoomCommand::Info { reply }).await.ok()?;
		rx.await.ok()
	}
}

/// Start a room event loop and return its handle.
pub fn spawn_room(
	name: &str,
	password_hash: Vec<u8>,
	hidden: bool,
	store: Arc<dyn Store>,
	cfg: RoomConfig,
) -> RoomHandle {
	let (cmd_tx, cmd_rx) = mpsc::channel(cfg.command_queue_capacity);
	let task = RoomTask {
		name: name.to_string(),
		has_password: !password_hash.is_empty(),
		// a sink must at least hold the join bootstrap plus a couple of events
		sink_capacity: cfg.subscriber_queue_capacity.max(3),
		store,
		subscribers: HashMap::new(),
	};
	tokio::spawn(task.run(cmd_rx));

	RoomHandle {
		name: Arc::from(name),
		password_hash: Arc::new(password_hash),
		hidden,
		cmd_tx,
	}
}

struct Subscriber {
	sink: mpsc::Sender<Frame>,
	public_key: Vec<u8>,
}

struct RoomTask {
	name: String,
	has_password: bool,
	sink_capacity: usize,
	store: Arc<dyn Store>,
	subscribers: HashMap<String, Subscriber>,
}

impl RoomTask {
	async fn run(mut self, mut cmd_rx: mpsc::Receiver<RoomCommand>) {
		while let Some(cmd) = cmd_rx.recv().await {
			match cmd {
				RoomCommand::Subscribe {
					username,
					public_key,
					reply,
				} => self.handle_subscribe(username, public_key, reply).await,
				RoomCommand::Unsubscribe { username } => {
					if self.subscribers.remove(&username).is_some() {
						debug!(room = %self.name, user = %username, "unsubscribed");
						self.fan_out(Frame::UserLeft(username));
					}
				}
				RoomCommand::Broadcast { frame } => self.fan_out(frame),
				RoomCommand::Publish { username, frame } => self.deliver(&username, frame),
				RoomCommand::Info { reply } => {
					let _ = reply.send(RoomInfo {
						online_users: self.subscribers.len(),
						has_password: self.has_password,
					});
				}
			}
		}
		debug!(room = %self.name, "room event loop stopped");
	}

	async fn handle_subscribe(
		&mut self,
		username: String,
		public_key: Vec<u8>,
		reply: oneshot::Sender<mpsc::Receiver<Frame>>,
	) {
		let (sink, rx) = mpsc::channel(self.sink_capacity);

		if self.subscribers.contains_key(&username) {
			warn!(room = %self.name, user = %username, "duplicate subscribe rejected");
			let _ = sink.try_send(Frame::error("Username is already a part of the chat"));
			drop(sink);
			let _ = reply.send(rx);
			return;
		}

		let joined = Frame::UserJoined(UserInfo {
			username: username.clone(),
			public_key: public_key.clone(),
		});

		// The bootstrap lists the joining user plus every subscriber the
		// join notice actually reached.
		let mut users = vec![UserInfo {
			username: username.clone(),
			public_key: public_key.clone(),
		}];
		let mut evicted = Vec::new();
		for (other, sub) in &self.subscribers {
			if sub.sink.try_send(joined.clone()).is_ok() {
				users.push(UserInfo {
					username: other.clone(),
					public_key: sub.public_key.clone(),
				});
			} else {
				evicted.push(other.clone());
			}
		}
		for name in evicted {
			self.evict(name);
		}

		let messages = match self.store.messages_for_recipient(&self.name, &username).await {
			Ok(history) => history
				.into_iter()
				.map(|m| ChatMessage {
					sender: m.sender,
					timestamp_ms: m.timestamp_ms,
					ciphertext: m.ciphertext,
				})
				.collect(),
			Err(err) => {
				warn!(room = %self.name, user = %username, error = %err, "history query failed, joining with empty history");
				Vec::new()
			}
		};

		let _ = sink.try_send(Frame::ChatInfo(ChatInfoBody {
			my_username: username.clone(),
			users,
			messages,
		}));

		debug!(room = %self.name, user = %username, subscribers = self.subscribers.len() + 1, "subscribed");
		self.subscribers.insert(username, Subscriber { sink, public_key });
		let _ = reply.send(rx);
	}

	fn fan_out(&mut self, frame: Frame) {
		let mut evicted = Vec::new();
		for (name, sub) in &self.subscribers {
			if sub.sink.try_send(frame.clone()).is_err() {
				evicted.push(name.clone());
			}
		}
		for name in evicted {
			self.evict(name);
		}
	}

	fn deliver(&mut self, username: &str, frame: Frame) {
		let Some(sub) = self.subscribers.get(username) else {
			return;
		};
		if sub.sink.try_send(frame).is_err() {
			self.evict(username.to_string());
		}
	}

	/// Drop a subscriber whose sink is full or closed, and tell the rest.
	fn evict(&mut self, username: String) {
		if self.subscribers.remove(&username).is_none() {
			return;
		}
		metrics::counter!("parley_server_subscriber_evictions_total").increment(1);
		warn!(room = %self.name, user = %username, "evicting subscriber with full or closed sink");
		self.fan_out(Frame::UserLeft(username));
	}
}
