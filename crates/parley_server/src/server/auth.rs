#![forbid(unsafe_code)]

use parley_domain::Username;
use parley_protocol::messages::RegisterBody;
use parley_store::{NewUser, Store};
use tracing::debug;

use crate::server::error::{RequestError, storage_or_conflict};

/// Challenge state for one in-flight login. Bound to a single connection
/// and consumed by the first response, successful or not.
pub struct PendingLogin {
	pub username: String,
	pub public_key: Vec<u8>,
	nonce: Vec<u8>,
}

impl PendingLogin {
	/// Constant-time comparison of the client's decrypted nonce.
	pub fn verify(&self, response: &[u8]) -> bool {
		parley_keys::verify_response(&self.nonce, response)
	}
}

/// Validate and persist a new user. The public key must parse as PKCS#1
/// PEM with a 2048-bit modulus before anything touches storage.
pub async fn register(store: &dyn Store, body: RegisterBody) -> Result<Username, RequestError> {
	let username = Username::parse(&body.username)?;
	parley_keys::parse_public_key(&body.public_key).map_err(|e| RequestError::InvalidInput(e.to_string()))?;

	store
		.insert_user(NewUser {
			username: username.as_str().to_string(),
			public_key: body.public_key,
		})
		.await
		.map_err(|e| storage_or_conflict(e, "Username is already taken"))?;

	Ok(username)
}

/// Look up the user and produce a fresh challenge: a 64-byte nonce
/// encrypted to the stored public key. The plaintext nonce never leaves
/// the server.
pub async fn begin_login(store: &dyn Store, username: &str) -> Result<(PendingLogin, Vec<u8>), RequestError> {
	let record = store
		.find_user(username)
		.await
		.map_err(|e| {
			tracing::error!(user = %username, error = %e, "user lookup failed");
			RequestError::Storage
		})?
		.ok_or(RequestError::NotFound("User does not exist"))?;

	let key = parley_keys::parse_public_key(&record.public_key).map_err(|e| {
		tracing::error!(user = %record.username, error = %e, "stored public key failed to parse");
		RequestError::Storage
	})?;

	let challenge = parley_keys::generate_challenge(&key).map_err(|e| {
		tracing::error!(user = %record.username, error = %e, "challenge generation failed");
		RequestError::Storage
	})?;

	debug!(user = %record.username, "issued auth challenge");
	Ok((
		PendingLogin {
			username: record.username,
			public_key: record.public_key,
			nonce: challenge.nonce,
		},
		challenge.ciphertext,
	))
}
