#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// An authenticated user bound to one live connection.
///
/// `current_room` is the only field mutated after login; it sits behind a
/// per-user mutex so sessions can flip it without touching the registry
/// lock. Lock order is registry → user, and only registry iteration takes
/// both.
pub struct SessionUser {
	pub username: String,
	/// PEM-encoded PKCS#1 RSA public key, byte-exact as registered.
	pub public_key: Vec<u8>,
	current_room: Mutex<Option<String>>,
}

impl SessionUser {
	pub fn new(username: String, public_key: Vec<u8>) -> Self {
		Self {
			username,
			public_key,
			current_room: Mutex::new(None),
		}
	}

	pub fn current_room(&self) -> Option<String> {
		self.current_room.lock().clone()
	}

	pub fn set_current_room(&self, room: Option<String>) {
		*self.current_room.lock() = room;
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("connection is already registered")]
	AlreadyRegistered,

	#[error("connection is not registered")]
	NotRegistered,

	#[error("username is already attached to a live session")]
	UsernameTaken,
}

/// Process-wide map from connection id to its session user (`None` until
/// login succeeds). One mutex covers the whole map.
#[derive(Default)]
pub struct Registry {
	inner: Mutex<HashMap<u64, Option<Arc<SessionUser>>>>,
}

impl Registry {
	/// Record a freshly accepted connection.
	pub fn insert(&self, conn_id: u64) -> Result<(), RegistryError> {
		let mut map = self.inner.lock();
		if map.contains_key(&conn_id) {
			return Err(RegistryError::AlreadyRegistered);
		}
		map.insert(conn_id, None);
		Ok(())
	}

	/// Bind a user to a connection after a successful challenge response.
	///
	/// Fails if the username is already attached to any live connection;
	/// a username has at most one live session.
	pub fn attach(&self, conn_id: u64, user: Arc<SessionUser>) -> Result<(), RegistryError> {
		let mut map = self.inner.lock();
		if map.values().flatten().any(|existing| existing.username == user.username) {
			return Err(RegistryError::UsernameTaken);
		}
		match map.get_mut(&conn_id) {
			Some(slot) => {
				*slot = Some(user);
				Ok(())
			}
			None => Err(RegistryError::NotRegistered),
		}
	}

	pub fn user(&self, conn_id: u64) -> Option<Arc<SessionUser>> {
		self.inner.lock().get(&conn_id).cloned().flatten()
	}

	pub fn remove(&self, conn_id: u64) -> Option<Arc<SessionUser>> {
		self.inner.lock().remove(&conn_id).flatten()
	}

	/// Call `f` for every authenticated user currently in `room_name`.
	///
	/// The registry mutex is held for the duration: `f` must be cheap and
	/// must not re-enter the registry. Callers doing I/O should collect
	/// targets here and act after the call returns.
	pub fn for_each_in_room(&self, room_name: &str, mut f: impl FnMut(u64, &Arc<SessionUser>)) {
		let map = self.inner.lock();
		for (conn_id, slot) in map.iter() {
			if let Some(user) = slot
				&& user.current_room().as_deref() == Some(room_name)
			{
				f(*conn_id, user);
			}
		}
	}

	/// Number of live connections, authenticated or not.
	pub fn count(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn count_in_room(&self, room_name: &str) -> usize {
		let mut n = 0;
		self.for_each_in_room(room_name, |_, _| n += 1);
		n
	}
}
