#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use parley_domain::{RoomName, RoomPassword};
use parley_store::{NewRoom, Store, StoreError};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::server::error::{RequestError, storage_or_conflict};
use crate::server::room::{RoomConfig, RoomHandle, spawn_room};
use crate::util::time::unix_ms_now;

/// All live rooms, keyed by name. Room records are the persistent source
/// of truth; the directory mirrors them with running event loops. Rooms
/// are never torn down while the server runs, even when empty.
pub struct RoomDirectory {
	rooms: RwLock<HashMap<String, RoomHandle>>,
	store: Arc<dyn Store>,
	cfg: RoomConfig,
}

impl RoomDirectory {
	pub fn new(store: Arc<dyn Store>, cfg: RoomConfig) -> Self {
		Self {
			rooms: RwLock::new(HashMap::new()),
			store,
			cfg,
		}
	}

	/// Start event loops for every persisted room. Called once at startup.
	pub async fn hydrate(&self) -> Result<usize, StoreError> {
		let records = self.store.list_rooms().await?;
		let mut map = self.rooms.write();
		let mut added = 0;
		for record in records {
			if map.contains_key(&record.name) {
				continue;
			}
			let handle = spawn_room(
				&record.name,
				record.password_hash,
				record.hidden,
				Arc::clone(&self.store),
				self.cfg.clone(),
			);
			map.insert(record.name.clone(), handle);
			added += 1;
		}
		Ok(added)
	}

	/// Create a room: persist the record, then start its event loop. A
	/// name collision (in memory or on the unique index) is a conflict.
	pub async fn create(&self, name: &RoomName, password: &RoomPassword, hidden: bool) -> Result<(), RequestError> {
		if self.rooms.read().contains_key(name.as_str()) {
			return Err(RequestError::Conflict("Chat room name is already taken"));
		}

		let password_hash = hash_password(password);
		self.store
			.insert_room(NewRoom {
				name: name.as_str().to_string(),
				created_ms: unix_ms_now(),
				password_hash: password_hash.clone(),
				hidden,
			})
			.await
			.map_err(|e| storage_or_conflict(e, "Chat room name is already taken"))?;

		let handle = spawn_room(name.as_str(), password_hash, hidden, Arc::clone(&self.store), self.cfg.clone());
		self.rooms.write().insert(name.as_str().to_string(), handle);
		info!(room = %name, hidden, "created chat room");
		Ok(())
	}

	pub fn get(&self, name: &str) -> Option<RoomHandle> {
		self.rooms.read().get(name).cloned()
	}

	pub fn list(&self) -> Vec<RoomHandle> {
		self.rooms.read().values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.rooms.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.rooms.read().is_empty()
	}
}

/// SHA-256 of the plaintext, or empty for unprotected rooms.
pub fn hash_password(password: &RoomPassword) -> Vec<u8> {
	if password.is_empty() {
		Vec::new()
	} else {
		Sha256::digest(password.as_str().as_bytes()).to_vec()
	}
}
