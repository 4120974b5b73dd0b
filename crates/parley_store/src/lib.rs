#![forbid(unsafe_code)]

mod memory;
mod sql;

pub use memory::MemoryStore;
pub use sql::SqlStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	/// An insert hit a unique index (username or room name).
	#[error("duplicate key")]
	Duplicate,

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("unsupported database url (expected sqlite: or postgres:)")]
	UnsupportedUrl,
}

/// A registered user as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub id: i64,
	pub username: String,
	/// PEM-encoded PKCS#1 RSA public key, stored byte-exact as registered.
	pub public_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
	pub username: String,
	pub public_key: Vec<u8>,
}

/// A chat room as persisted. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
	pub id: i64,
	pub name: String,
	pub created_ms: i64,
	/// SHA-256 of the plaintext password, or empty for unprotected rooms.
	pub password_hash: Vec<u8>,
	pub hidden: bool,
}

#[derive(Debug, Clone)]
pub struct NewRoom {
	pub name: String,
	pub created_ms: i64,
	pub password_hash: Vec<u8>,
	pub hidden: bool,
}

/// One per-recipient ciphertext inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientCiphertext {
	pub recipient: String,
	pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
	pub room_name: String,
	pub timestamp_ms: i64,
	pub sender: String,
	pub per_recipient: Vec<RecipientCiphertext>,
}

/// The per-recipient projection of a stored message, as served to a
/// joining client: only the single ciphertext addressed to that user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCiphertext {
	pub sender: String,
	pub timestamp_ms: i64,
	pub ciphertext: Vec<u8>,
}

/// Thin adapter over the persistent collections.
///
/// `users.username` and `rooms.name` are unique; inserts that violate
/// either fail with [`StoreError::Duplicate`] so callers can surface a
/// conflict instead of a generic storage error.
#[async_trait]
pub trait Store: Send + Sync {
	async fn insert_user(&self, user: NewUser) -> Result<(), StoreError>;

	async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

	async fn insert_room(&self, room: NewRoom) -> Result<(), StoreError>;

	async fn find_room(&self, name: &str) -> Result<Option<RoomRecord>, StoreError>;

	async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError>;

	async fn insert_message(&self, message: NewMessage) -> Result<(), StoreError>;

	/// History bootstrap for a joining user: messages in `room_name`
	/// projected to the entries addressed to `recipient`, oldest first.
	async fn messages_for_recipient(&self, room_name: &str, recipient: &str)
	-> Result<Vec<StoredCiphertext>, StoreError>;
}
