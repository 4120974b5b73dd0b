#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::messages::{Frame, FrameKind};

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("unknown frame kind: {0}")]
	UnknownKind(u8),

	#[error("malformed frame: {0}")]
	Malformed(String),

	#[error("frame encode error: {0}")]
	Encode(#[from] serde_json::Error),
}

impl FramingError {
	/// Whether the byte stream is still frame-aligned after this error.
	///
	/// A malformed payload is consumed whole (the length prefix was valid),
	/// so the caller may keep decoding. A bogus length prefix is not
	/// survivable.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, FramingError::UnknownKind(_) | FramingError::Malformed(_))
	}
}

/// The envelope as it travels on the wire: `{"kind": <u8>, "body": <variant>}`.
#[derive(Serialize, Deserialize)]
struct Envelope {
	kind: u8,
	body: Value,
}

fn body_to_value(frame: &Frame) -> Result<Value, serde_json::Error> {
	Ok(match frame {
		Frame::Error(s) | Frame::Ok(s) | Frame::UserLeft(s) => Value::String(s.clone()),
		Frame::Challenge(b) | Frame::ChallengeResponse(b) => serde_json::to_value(b)?,
		Frame::Register(b) => serde_json::to_value(b)?,
		Frame::Login(b) => serde_json::to_value(b)?,
		Frame::CreateRoom(b) => serde_json::to_value(b)?,
		Frame::GetRoomsResponse(b) => serde_json::to_value(b)?,
		Frame::Join(b) => serde_json::to_value(b)?,
		Frame::ChatInfo(b) => serde_json::to_value(b)?,
		Frame::Send(b) => serde_json::to_value(b)?,
		Frame::ChatMessageReceived(b) => serde_json::to_value(b)?,
		Frame::UserJoined(b) => serde_json::to_value(b)?,
		Frame::GetRooms | Frame::Leave | Frame::Ping | Frame::Pong => Value::Null,
	})
}

fn malformed(kind: FrameKind, err: serde_json::Error) -> FramingError {
	FramingError::Malformed(format!("bad body for kind {}: {err}", kind.as_u8()))
}

fn frame_from_envelope(env: Envelope) -> Result<Frame, FramingError> {
	let kind = FrameKind::from_u8(env.kind).ok_or(FramingError::UnknownKind(env.kind))?;
	let body = env.body;

	let expect_string = |body: Value| match body {
		Value::String(s) => Ok(s),
		other => Err(FramingError::Malformed(format!(
			"expected string body for kind {}, got {other}",
			kind.as_u8()
		))),
	};

	let frame = match kind {
		FrameKind::Error => Frame::Error(expect_string(body)?),
		FrameKind::Ok => Frame::Ok(expect_string(body)?),
		FrameKind::UserLeft => Frame::UserLeft(expect_string(body)?),
		FrameKind::Challenge => Frame::Challenge(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::ChallengeResponse => {
			Frame::ChallengeResponse(serde_json::from_value(body).map_err(|e| malformed(kind, e))?)
		}
		FrameKind::Register => Frame::Register(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::Login => Frame::Login(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::CreateRoom => Frame::CreateRoom(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::GetRoomsResponse => {
			Frame::GetRoomsResponse(serde_json::from_value(body).map_err(|e| malformed(kind, e))?)
		}
		FrameKind::Join => Frame::Join(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::ChatInfo => Frame::ChatInfo(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::Send => Frame::Send(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::ChatMessageReceived => {
			Frame::ChatMessageReceived(serde_json::from_value(body).map_err(|e| malformed(kind, e))?)
		}
		FrameKind::UserJoined => Frame::UserJoined(serde_json::from_value(body).map_err(|e| malformed(kind, e))?),
		FrameKind::GetRooms | FrameKind::Leave | FrameKind::Ping | FrameKind::Pong => {
			if !body.is_null() {
				return Err(FramingError::Malformed(format!(
					"expected empty body for kind {}",
					kind.as_u8()
				)));
			}
			match kind {
				FrameKind::GetRooms => Frame::GetRooms,
				FrameKind::Leave => Frame::Leave,
				FrameKind::Ping => Frame::Ping,
				_ => Frame::Pong,
			}
		}
	};

	Ok(frame)
}

fn decode_payload(payload: &[u8]) -> Result<Frame, FramingError> {
	let env: Envelope =
		serde_json::from_slice(payload).map_err(|e| FramingError::Malformed(format!("bad envelope: {e}")))?;
	frame_from_envelope(env)
}

/// Encode a frame into a length-prefixed byte buffer.
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let env = Envelope {
		kind: frame.kind().as_u8(),
		body: body_to_value(frame)?,
	};
	let payload = serde_json::to_vec(&env)?;

	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(4 + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(&payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default(frame: &Frame) -> Result<Vec<u8>, FramingError> {
	encode_frame(frame, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame to the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, frame: &Frame, max_frame_size: usize) -> Result<(), FramingError> {
	let encoded = encode_frame(frame, max_frame_size)?;
	buf.reserve(encoded.len());
	buf.put_slice(&encoded);
	Ok(())
}

/// Decode a single frame from the start of `src`, returning the frame and
/// the number of bytes consumed.
pub fn decode_frame(src: &[u8], max_frame_size: usize) -> Result<(Frame, usize), FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let frame = decode_payload(&src[4..need])?;
	Ok((frame, need))
}

/// Try to decode a single frame from a growable buffer.
///
/// Returns `Ok(None)` until a full frame is buffered. On a recoverable
/// error (see [`FramingError::is_recoverable`]) the offending frame has
/// already been consumed from the buffer.
pub fn try_decode_frame_from_buffer(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if buf.len() < need {
		return Ok(None);
	}

	let frame_bytes = buf.split_to(need);
	let frame = decode_payload(&frame_bytes[4..])?;
	Ok(Some(frame))
}
