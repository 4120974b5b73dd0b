#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::BytesMut;
use parley_protocol::framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default,
	try_decode_frame_from_buffer,
};
use parley_protocol::messages::{
	ChatInfoBody, ChatMessage, CreateRoomBody, Frame, GetRoomsResponseBody, JoinBody, LoginBody, RegisterBody,
	RoomListing, SendBody, UserInfo,
};

fn sample_frames() -> Vec<Frame> {
	let mut encrypted_content = BTreeMap::new();
	encrypted_content.insert("alice".to_string(), vec![1, 2, 3]);
	encrypted_content.insert("bob".to_string(), vec![4, 5, 6]);

	vec![
		Frame::Error("boom".to_string()),
		Frame::Ok("fine".to_string()),
		Frame::Register(RegisterBody {
			username: "alice".to_string(),
			public_key: b"-----BEGIN RSA PUBLIC KEY-----".to_vec(),
		}),
		Frame::Login(LoginBody {
			username: "alice".to_string(),
		}),
		Frame::Challenge(vec![0, 255, 128, 7]),
		Frame::ChallengeResponse(vec![9, 8, 7]),
		Frame::CreateRoom(CreateRoomBody {
			name: "lobby".to_string(),
			password: "hunter2".to_string(),
			hidden: true,
		}),
		Frame::GetRooms,
		Frame::GetRoomsResponse(GetRoomsResponseBody {
			total_connected: 3,
			rooms: vec![RoomListing {
				name: "lobby".to_string(),
				has_password: false,
				online_users: 2,
			}],
		}),
		Frame::Join(JoinBody {
			name: "lobby".to_string(),
			password: String::new(),
		}),
		Frame::ChatInfo(ChatInfoBody {
			my_username: "alice".to_string(),
			users: vec![UserInfo {
				username: "alice".to_string(),
				public_key: vec![1, 2],
			}],
			messages: vec![ChatMessage {
				sender: "bob".to_string(),
				timestamp_ms: 1_700_000_000_000,
				ciphertext: vec![7, 7, 7],
			}],
		}),
		Frame::Send(SendBody { encrypted_content }),
		Frame::ChatMessageReceived(ChatMessage {
			sender: "alice".to_string(),
			timestamp_ms: 42,
			ciphertext: vec![0xde, 0xad],
		}),
		Frame::UserJoined(UserInfo {
			username: "carol".to_string(),
			public_key: vec![3, 3],
		}),
		Frame::UserLeft("carol".to_string()),
		Frame::Leave,
		Frame::Ping,
		Frame::Pong,
	]
}

#[test]
fn encode_decode_roundtrip_every_kind() {
	for frame in sample_frames() {
		let encoded = encode_frame_default(&frame).expect("encode");
		let (decoded, consumed) = decode_frame(&encoded, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(consumed, encoded.len());
		assert_eq!(decoded, frame);
	}
}

#[test]
fn encoding_is_deterministic() {
	for frame in sample_frames() {
		let a = encode_frame_default(&frame).expect("encode");
		let b = encode_frame_default(&frame).expect("encode");
		assert_eq!(a, b);
	}
}

#[test]
fn byte_bodies_are_bit_exact() {
	let payload: Vec<u8> = (0u8..=255).collect();
	let encoded = encode_frame_default(&Frame::Challenge(payload.clone())).expect("encode");
	let (decoded, _) = decode_frame(&encoded, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(decoded, Frame::Challenge(payload));
}

#[test]
fn decode_requires_full_frame() {
	let encoded = encode_frame_default(&Frame::Ok("hello".to_string())).expect("encode");

	let err = decode_frame(&encoded[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::InsufficientData { need, have } => assert!(need > have),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn try_decode_from_buffer_incremental() {
	let encoded = encode_frame_default(&Frame::Login(LoginBody {
		username: "alice".to_string(),
	}))
	.expect("encode");

	let mut buf = BytesMut::new();

	buf.extend_from_slice(&encoded[..2]);
	assert!(
		try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&encoded[2..8]);
	assert!(
		try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&encoded[8..]);
	let decoded = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");
	assert_eq!(
		decoded,
		Frame::Login(LoginBody {
			username: "alice".to_string(),
		})
	);
	assert!(buf.is_empty());
}

#[test]
fn two_frames_in_one_buffer() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&encode_frame_default(&Frame::Ping).expect("encode"));
	buf.extend_from_slice(&encode_frame_default(&Frame::Pong).expect("encode"));

	let first = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");
	let second = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");
	assert_eq!(first, Frame::Ping);
	assert_eq!(second, Frame::Pong);
	assert!(buf.is_empty());
}

#[test]
fn encode_rejects_too_large() {
	let frame = Frame::Ok("a".repeat(10_000));
	let err = encode_frame(&frame, 32).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => assert!(len > max),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn decode_rejects_too_large_prefix() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	let err = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, FramingError::FrameTooLarge { .. }));
	assert!(!err.is_recoverable());
}

#[test]
fn kind_body_mismatch_is_recoverable() {
	// A LOGIN frame whose body is a bare string instead of an object.
	let payload = br#"{"kind":3,"body":"alice"}"#;
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	buf.extend_from_slice(payload);

	let err = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(err.is_recoverable(), "got: {err:?}");
	// The malformed frame was consumed; the stream stays aligned.
	assert!(buf.is_empty());
}

#[test]
fn unit_kind_with_body_is_rejected() {
	let payload = br#"{"kind":16,"body":"nope"}"#;
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	buf.extend_from_slice(payload);

	let err = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(err.is_recoverable());
}

#[test]
fn unknown_kind_is_recoverable() {
	let payload = br#"{"kind":99,"body":null}"#;
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	buf.extend_from_slice(payload);

	let err = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, FramingError::UnknownKind(99)));
	assert!(err.is_recoverable());
}
