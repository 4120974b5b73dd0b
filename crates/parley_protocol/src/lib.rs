#![forbid(unsafe_code)]

pub mod framing;
pub mod messages;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default,
	try_decode_frame_from_buffer,
};
pub use messages::{
	ChatInfoBody, ChatMessage, CreateRoomBody, Frame, FrameKind, GetRoomsResponseBody, JoinBody, LoginBody,
	RegisterBody, RoomListing, SendBody, UserInfo,
};
