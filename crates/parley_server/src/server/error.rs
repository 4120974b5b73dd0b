#![forbid(unsafe_code)]

use parley_domain::ValidationError;
use parley_store::StoreError;
use thiserror::Error;

/// User-facing request failures.
///
/// The Display strings travel verbatim in ERROR frames. They are
/// diagnostic only; clients rely on the protocol's control flow, never on
/// the wording.
#[derive(Debug, Error)]
pub enum RequestError {
	#[error("Not authenticated")]
	Unauthenticated,

	#[error("{0}")]
	NotFound(&'static str),

	#[error("{0}")]
	Conflict(&'static str),

	#[error("{0}")]
	InvalidInput(String),

	#[error("Invalid auth key")]
	AuthFailed,

	#[error("Internal storage error")]
	Storage,

	#[error("Internal server error")]
	Internal,
}

impl From<ValidationError> for RequestError {
	fn from(err: ValidationError) -> Self {
		RequestError::InvalidInput(err.to_string())
	}
}

/// Map a store failure, turning a unique-key violation into the
/// caller-supplied conflict message.
pub fn storage_or_conflict(err: StoreError, conflict: &'static str) -> RequestError {
	match err {
		StoreError::Duplicate => RequestError::Conflict(conflict),
		other => {
			tracing::error!(error = %other, "store operation failed");
			RequestError::Storage
		}
	}
}
