#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Wire discriminator carried in every frame envelope.
///
/// The numbering is part of the wire contract; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
	Error = 0,
	Ok = 1,
	Register = 2,
	Login = 3,
	Challenge = 4,
	ChallengeResponse = 5,
	CreateRoom = 6,
	GetRooms = 7,
	GetRoomsResponse = 8,
	Join = 9,
	ChatInfo = 10,
	Send = 11,
	ChatMessageReceived = 12,
	UserJoined = 13,
	UserLeft = 14,
	Leave = 15,
	Ping = 16,
	Pong = 17,
}

impl FrameKind {
	pub const fn as_u8(self) -> u8 {
		self as u8
	}

	pub const fn from_u8(value: u8) -> Option<Self> {
		Some(match value {
			0 => FrameKind::Error,
			1 => FrameKind::Ok,
			2 => FrameKind::Register,
			3 => FrameKind::Login,
			4 => FrameKind::Challenge,
			5 => FrameKind::ChallengeResponse,
			6 => FrameKind::CreateRoom,
			7 => FrameKind::GetRooms,
			8 => FrameKind::GetRoomsResponse,
			9 => FrameKind::Join,
			10 => FrameKind::ChatInfo,
			11 => FrameKind::Send,
			12 => FrameKind::ChatMessageReceived,
			13 => FrameKind::UserJoined,
			14 => FrameKind::UserLeft,
			15 => FrameKind::Leave,
			16 => FrameKind::Ping,
			17 => FrameKind::Pong,
			_ => return None,
		})
	}
}

/// Body of a `REGISTER` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBody {
	pub username: String,
	/// PEM-encoded PKCS#1 RSA public key.
	pub public_key: Vec<u8>,
}

/// Body of a `LOGIN` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginBody {
	pub username: String,
}

/// Body of a `CREATE_ROOM` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoomBody {
	pub name: String,
	/// Plaintext room password; empty means the room is unprotected.
	pub password: String,
	pub hidden: bool,
}

/// One room entry in a `GET_ROOMS_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomListing {
	pub name: String,
	pub has_password: bool,
	pub online_users: u32,
}

/// Body of a `GET_ROOMS_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRoomsResponseBody {
	pub total_connected: u32,
	pub rooms: Vec<RoomListing>,
}

/// Body of a `JOIN` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinBody {
	pub name: String,
	pub password: String,
}

/// A user as presented to room members (`CHAT_INFO`, `USER_JOINED`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
	pub username: String,
	pub public_key: Vec<u8>,
}

/// One relayed ciphertext, both live (`CHAT_MESSAGE_RECEIVED`) and
/// historical (`CHAT_INFO`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub sender: String,
	pub timestamp_ms: i64,
	pub ciphertext: Vec<u8>,
}

/// Body of a `CHAT_INFO` bootstrap sent right after a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfoBody {
	pub my_username: String,
	pub users: Vec<UserInfo>,
	pub messages: Vec<ChatMessage>,
}

/// Body of a `SEND` request: one ciphertext per addressed recipient.
///
/// A `BTreeMap` keeps the encoding deterministic for a given value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBody {
	pub encrypted_content: BTreeMap<String, Vec<u8>>,
}

/// A decoded application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Error(String),
	Ok(String),
	Register(RegisterBody),
	Login(LoginBody),
	/// RSA-encrypted login nonce.
	Challenge(Vec<u8>),
	/// Decrypted login nonce, echoed back by the client.
	ChallengeResponse(Vec<u8>),
	CreateRoom(CreateRoomBody),
	GetRooms,
	GetRoomsResponse(GetRoomsResponseBody),
	Join(JoinBody),
	ChatInfo(ChatInfoBody),
	Send(SendBody),
	ChatMessageReceived(ChatMessage),
	UserJoined(UserInfo),
	UserLeft(String),
	Leave,
	Ping,
	Pong,
}

impl Frame {
	pub const fn kind(&self) -> FrameKind {
		match self {
			Frame::Error(_) => FrameKind::Error,
			Frame::Ok(_) => FrameKind::Ok,
			Frame::Register(_) => FrameKind::Register,
			Frame::Login(_) => FrameKind::Login,
			Frame::Challenge(_) => FrameKind::Challenge,
			Frame::ChallengeResponse(_) => FrameKind::ChallengeResponse,
			Frame::CreateRoom(_) => FrameKind::CreateRoom,
			Frame::GetRooms => FrameKind::GetRooms,
			Frame::GetRoomsResponse(_) => FrameKind::GetRoomsResponse,
			Frame::Join(_) => FrameKind::Join,
			Frame::ChatInfo(_) => FrameKind::ChatInfo,
			Frame::Send(_) => FrameKind::Send,
			Frame::ChatMessageReceived(_) => FrameKind::ChatMessageReceived,
			Frame::UserJoined(_) => FrameKind::UserJoined,
			Frame::UserLeft(_) => FrameKind::UserLeft,
			Frame::Leave => FrameKind::Leave,
			Frame::Ping => FrameKind::Ping,
			Frame::Pong => FrameKind::Pong,
		}
	}

	pub fn ok(message: impl Into<String>) -> Self {
		Frame::Ok(message.into())
	}

	pub fn error(message: impl Into<String>) -> Self {
		Frame::Error(message.into())
	}
}
