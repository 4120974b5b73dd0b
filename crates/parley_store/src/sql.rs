#![forbid(unsafe_code)]

use async_trait::async_trait;
use sqlx::{PgPool, Row, SqlitePool};
use tracing::info;

use crate::{
	NewMessage, NewRoom, NewUser, RoomRecord, Store, StoreError, StoredCiphertext, UserRecord,
};

/// SQL-backed store, selected by the database URL scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(SqlitePool),
	Postgres(PgPool),
}

fn map_insert_err(err: sqlx::Error) -> StoreError {
	if let sqlx::Error::Database(db) = &err
		&& db.is_unique_violation()
	{
		return StoreError::Duplicate;
	}
	StoreError::Database(err)
}

impl SqlStore {
	/// Connect and run migrations. `sqlite:` and `postgres:` URLs are
	/// supported.
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		if database_url.starts_with("sqlite:") {
			let pool = SqlitePool::connect(database_url).await?;
			sqlx::migrate!("migrations/sqlite").run(&pool).await?;
			info!("connected to sqlite store");
			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPool::connect(database_url).await?;
			sqlx::migrate!("migrations/postgres").run(&pool).await?;
			info!("connected to postgres store");
			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(StoreError::UnsupportedUrl)
		}
	}
}

#[async_trait]
impl Store for SqlStore {
	async fn insert_user(&self, user: NewUser) -> Result<(), StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO users (username, public_key) VALUES (?, ?)")
					.bind(&user.username)
					.bind(&user.public_key)
					.execute(pool)
					.await
					.map_err(map_insert_err)?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO users (username, public_key) VALUES ($1, $2)")
					.bind(&user.username)
					.bind(&user.public_key)
					.execute(pool)
					.await
					.map_err(map_insert_err)?;
			}
		}
		Ok(())
	}

	async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
		let row = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as::<_, (i64, String, Vec<u8>)>(
					"SELECT id, username, public_key FROM users WHERE username = ?",
				)
				.bind(username)
				.fetch_optional(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as::<_, (i64, String, Vec<u8>)>(
					"SELECT id, username, public_key FROM users WHERE username = $1",
				)
				.bind(username)
				.fetch_optional(pool)
				.await?
			}
		};

		Ok(row.map(|(id, username, public_key)| UserRecord {
			id,
			username,
			public_key,
		}))
	}

	async fn insert_room(&self, room: NewRoom) -> Result<(), StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO rooms (name, created_ms, password_hash, hidden) VALUES (?, ?, ?, ?)")
					.bind(&room.name)
					.bind(room.created_ms)
					.bind(&room.password_hash)
					.bind(room.hidden)
					.execute(pool)
					.await
					.map_err(map_insert_err)?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO rooms (name, created_ms, password_hash, hidden) VALUES ($1, $2, $3, $4)")
					.bind(&room.name)
					.bind(room.created_ms)
					.bind(&room.password_hash)
					.bind(room.hidden)
					.execute(pool)
					.await
					.map_err(map_insert_err)?;
			}
		}
		Ok(())
	}

	async fn find_room(&self, name: &str) -> Result<Option<RoomRecord>, StoreError> {
		let row = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as::<_, (i64, String, i64, Vec<u8>, bool)>(
					"SELECT id, name, created_ms, password_hash, hidden FROM rooms WHERE name = ?",
				)
				.bind(name)
				.fetch_optional(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as::<_, (i64, String, i64, Vec<u8>, bool)>(
					"SELECT id, name, created_ms, password_hash, hidden FROM rooms WHERE name = $1",
				)
				.bind(name)
				.fetch_optional(pool)
				.await?
			}
		};

		Ok(row.map(row_to_room))
	}

	async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
		let rows = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as::<_, (i64, String, i64, Vec<u8>, bool)>(
					"SELECT id, name, created_ms, password_hash, hidden FROM rooms ORDER BY name",
				)
				.fetch_all(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as::<_, (i64, String, i64, Vec<u8>, bool)>(
					"SELECT id, name, created_ms, password_hash, hidden FROM rooms ORDER BY name",
				)
				.fetch_all(pool)
				.await?
			}
		};

		Ok(rows.into_iter().map(row_to_room).collect())
	}

	async fn insert_message(&self, message: NewMessage) -> Result<(), StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let result = sqlx::query("INSERT INTO messages (room_name, timestamp_ms, sender) VALUES (?, ?, ?)")
					.bind(&message.room_name)
					.bind(message.timestamp_ms)
					.bind(&message.sender)
					.execute(&mut *tx)
					.await?;
				let message_id = result.last_insert_rowid();

				for entry in &message.per_recipient {
					sqlx::query("INSERT INTO message_recipients (message_id, recipient, ciphertext) VALUES (?, ?, ?)")
						.bind(message_id)
						.bind(&entry.recipient)
						.bind(&entry.ciphertext)
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let row =
					sqlx::query("INSERT INTO messages (room_name, timestamp_ms, sender) VALUES ($1, $2, $3) RETURNING id")
						.bind(&message.room_name)
						.bind(message.timestamp_ms)
						.bind(&message.sender)
						.fetch_one(&mut *tx)
						.await?;
				let message_id: i64 = row.try_get(0)?;

				for entry in &message.per_recipient {
					sqlx::query("INSERT INTO message_recipients (message_id, recipient, ciphertext) VALUES ($1, $2, $3)")
						.bind(message_id)
						.bind(&entry.recipient)
						.bind(&entry.ciphertext)
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
		}
		Ok(())
	}

	async fn messages_for_recipient(
		&self,
		room_name: &str,
		recipient: &str,
	) -> Result<Vec<StoredCiphertext>, StoreError> {
		let rows = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as::<_, (String, i64, Vec<u8>)>(
					"SELECT m.sender, m.timestamp_ms, r.ciphertext \
					FROM messages m JOIN message_recipients r ON r.message_id = m.id \
					WHERE m.room_name = ? AND r.recipient = ? \
					ORDER BY m.timestamp_ms ASC, m.id ASC",
				)
				.bind(room_name)
				.bind(recipient)
				.fetch_all(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as::<_, (String, i64, Vec<u8>)>(
					"SELECT m.sender, m.timestamp_ms, r.ciphertext \
					FROM messages m JOIN message_recipients r ON r.message_id = m.id \
					WHERE m.room_name = $1 AND r.recipient = $2 \
					ORDER BY m.timestamp_ms ASC, m.id ASC",
				)
				.bind(room_name)
				.bind(recipient)
				.fetch_all(pool)
				.await?
			}
		};

		Ok(rows
			.into_iter()
			.map(|(sender, timestamp_ms, ciphertext)| StoredCiphertext {
				sender,
				timestamp_ms,
				ciphertext,
			})
			.collect())
	}
}

fn row_to_room(row: (i64, String, i64, Vec<u8>, bool)) -> RoomRecord {
	let (id, name, created_ms, password_hash, hidden) = row;
	RoomRecord {
		id,
		name,
		created_ms,
		password_hash,
		hidden,
	}
}
