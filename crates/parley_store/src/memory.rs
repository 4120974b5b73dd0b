#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
	NewMessage, NewRoom, NewUser, RecipientCiphertext, RoomRecord, Store, StoreError, StoredCiphertext, UserRecord,
};

/// In-memory store used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	next_id: i64,
	users: HashMap<String, UserRecord>,
	rooms: HashMap<String, RoomRecord>,
	messages: Vec<StoredMessage>,
}

struct StoredMessage {
	room_name: String,
	timestamp_ms: i64,
	sender: String,
	per_recipient: Vec<RecipientCiphertext>,
}

impl Inner {
	fn next_id(&mut self) -> i64 {
		self.next_id += 1;
		self.next_id
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn insert_user(&self, user: NewUser) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		if inner.users.contains_key(&user.username) {
			return Err(StoreError::Duplicate);
		}
		let id = inner.next_id();
		inner.users.insert(
			user.username.clone(),
			UserRecord {
				id,
				username: user.username,
				public_key: user.public_key,
			},
		);
		Ok(())
	}

	async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.users.get(username).cloned())
	}

	async fn insert_room(&self, room: NewRoom) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		if inner.rooms.contains_key(&room.name) {
			return Err(StoreError::Duplicate);
		}
		let id = inner.next_id();
		inner.rooms.insert(
			room.name.clone(),
			RoomRecord {
				id,
				name: room.name,
				created_ms: room.created_ms,
				password_hash: room.password_hash,
				hidden: room.hidden,
			},
		);
		Ok(())
	}

	async fn find_room(&self, name: &str) -> Result<Option<RoomRecord>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(name).cloned())
	}

	async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
		let inner = self.inner.lock().await;
		let mut rooms: Vec<RoomRecord> = inner.rooms.values().cloned().collect();
		rooms.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(rooms)
	}

	async fn insert_message(&self, message: NewMessage) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		inner.messages.push(StoredMessage {
			room_name: message.room_name,
			timestamp_ms: message.timestamp_ms,
			sender: message.sender,
			per_recipient: message.per_recipient,
		});
		Ok(())
	}

	async fn messages_for_recipient(
		&self,
		room_name: &str,
		recipient: &str,
	) -> Result<Vec<StoredCiphertext>, StoreError> {
		let inner = self.inner.lock().await;
		let mut out = Vec::new();
		for message in inner.messages.iter().filter(|m| m.room_name == room_name) {
			if let Some(entry) = message.per_recipient.iter().find(|e| e.recipient == recipient) {
				out.push(StoredCiphertext {
					sender: message.sender.clone(),
					timestamp_ms: message.timestamp_ms,
					ciphertext: entry.ciphertext.clone(),
				});
			}
		}
		Ok(out)
	}
}
