#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for validating client-supplied identifiers.
///
/// The messages are user-facing; they travel verbatim in ERROR frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("Username must contain at least {0} characters")]
	UsernameTooShort(usize),
	#[error("Username cannot contain more than {0} characters")]
	UsernameTooLong(usize),
	#[error("Username can only contain alphanumeric characters")]
	UsernameNotAlphanumeric,
	#[error("Room name must contain at least {0} characters")]
	RoomNameTooShort(usize),
	#[error("Room name cannot contain more than {0} characters")]
	RoomNameTooLong(usize),
	#[error("Room name can only contain alphanumeric characters")]
	RoomNameNotAlphanumeric,
	#[error("Password must contain at least {0} characters")]
	PasswordTooShort(usize),
	#[error("Password cannot contain more than {0} characters")]
	PasswordTooLong(usize),
}

fn is_alphanumeric(input: &str) -> bool {
	input.chars().all(|ch| ch.is_alphanumeric())
}

/// A validated username: surrounding whitespace trimmed, alphanumeric,
/// 3 to 20 bytes of UTF-8.
///
/// Lengths are byte lengths, so multi-byte scripts hit the bounds
/// earlier than their character count suggests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	pub const MIN_LEN: usize = 3;
	pub const MAX_LEN: usize = 20;

	pub fn parse(input: &str) -> Result<Self, ValidationError> {
		let trimmed = input.trim();
		if trimmed.len() < Self::MIN_LEN {
			return Err(ValidationError::UsernameTooShort(Self::MIN_LEN));
		}
		if trimmed.len() > Self::MAX_LEN {
			return Err(ValidationError::UsernameTooLong(Self::MAX_LEN));
		}
		if !is_alphanumeric(trimmed) {
			return Err(ValidationError::UsernameNotAlphanumeric);
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::parse(s)
	}
}

/// A validated room name: alphanumeric, 3 to 30 bytes of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
	pub const MIN_LEN: usize = 3;
	pub const MAX_LEN: usize = 30;

	pub fn parse(input: &str) -> Result<Self, ValidationError> {
		if input.len() < Self::MIN_LEN {
			return Err(ValidationError::RoomNameTooShort(Self::MIN_LEN));
		}
		if input.len() > Self::MAX_LEN {
			return Err(ValidationError::RoomNameTooLong(Self::MAX_LEN));
		}
		if !is_alphanumeric(input) {
			return Err(ValidationError::RoomNameNotAlphanumeric);
		}
		Ok(Self(input.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomName {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomName::parse(s)
	}
}

/// A validated room password: empty (unprotected room) or 6 to 60 bytes
/// of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomPassword(String);

impl RoomPassword {
	pub const MIN_LEN: usize = 6;
	pub const MAX_LEN: usize = 60;

	pub fn parse(input: &str) -> Result<Self, ValidationError> {
		if input.is_empty() {
			return Ok(Self(String::new()));
		}
		if input.len() < Self::MIN_LEN {
			return Err(ValidationError::PasswordTooShort(Self::MIN_LEN));
		}
		if input.len() > Self::MAX_LEN {
			return Err(ValidationError::PasswordTooLong(Self::MAX_LEN));
		}
		Ok(Self(input.to_string()))
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}
