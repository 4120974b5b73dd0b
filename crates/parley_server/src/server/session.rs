#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_domain::{RoomName, RoomPassword};
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use parley_protocol::messages::{
	ChatMessage, CreateRoomBody, Frame, GetRoomsResponseBody, JoinBody, RoomListing, SendBody,
};
use parley_store::{NewMessage, RecipientCiphertext};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::ServerContext;
use crate::server::auth::{self, PendingLogin};
use crate::server::error::RequestError;
use crate::server::keepalive;
use crate::server::registry::SessionUser;
use crate::server::room::RoomHandle;
use crate::util::time::unix_ms_now;

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub max_frame_size: usize,

	/// Capacity of the single outbound queue feeding the writer task.
	pub outbound_queue_capacity: usize,

	pub keepalive_interval: Duration,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 64,
			keepalive_interval: Duration::from_secs(15),
		}
	}
}

/// Ceiling on how long a session waits to enqueue one outbound frame. A
/// peer that cannot drain its own socket for this long is torn down.
const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle: unauthenticated → lobby → joined. CLOSING is not
/// a variant; it is the single teardown path in `handle_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Unauth,
	Auth,
	InRoom,
}

enum Outcome {
	Continue,
	Joined(mpsc::Receiver<Frame>),
	Left,
}

/// Drive one client connection to completion.
///
/// Owns three tasks: this session loop (sole reader), a writer task (sole
/// writer, fed by one bounded queue), and the keepalive supervisor.
pub async fn handle_connection<S>(conn_id: u64, stream: S, ctx: Arc<ServerContext>) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	ctx.registry
		.insert(conn_id)
		.map_err(|e| anyhow!("register connection {conn_id}: {e}"))?;

	let settings = ctx.settings.clone();
	let (read_half, write_half) = tokio::io::split(stream);

	let (out_tx, out_rx) = mpsc::channel::<Frame>(settings.outbound_queue_capacity);
	let shutdown = Arc::new(Notify::new());
	let pongs = Arc::new(AtomicU64::new(0));

	let writer = spawn_writer(conn_id, write_half, out_rx, Arc::clone(&shutdown), settings.max_frame_size);
	let keepalive = keepalive::spawn(
		conn_id,
		settings.keepalive_interval,
		out_tx.clone(),
		Arc::clone(&pongs),
		Arc::clone(&shutdown),
	);

	let mut session = Session {
		conn_id,
		ctx: Arc::clone(&ctx),
		out_tx,
		pongs,
		phase: Phase::Unauth,
		pending_login: None,
		user: None,
		room: None,
	};
	let mut frames = FrameReader::new(read_half, settings.max_frame_size);
	let mut room_rx: Option<mpsc::Receiver<Frame>> = None;

	let result = session.run(&mut frames, &mut room_rx, &shutdown).await;

	// CLOSING: runs exactly once on every exit path. Leave the room,
	// drop the registry entry, stop the supervisor, drain the writer.
	if let Some(user) = ctx.registry.remove(conn_id) {
		if let Some(room_name) = user.current_room()
			&& let Some(room) = ctx.rooms.get(&room_name)
		{
			room.unsubscribe(&user.username).await;
		}
		info!(conn_id, user = %user.username, total_connected = ctx.registry.count(), "session closed");
	} else {
		info!(conn_id, total_connected = ctx.registry.count(), "connection closed");
	}

	keepalive.abort();
	drop(room_rx);
	drop(session);
	let mut writer = writer;
	if tokio::time::timeout(Duration::from_secs(5), &mut writer).await.is_err() {
		// a write half jammed on a dead peer is cut, not drained
		writer.abort();
	}

	result
}

struct Session {
	conn_id: u64,
	ctx: Arc<ServerContext>,
	out_tx: mpsc::Sender<Frame>,
	pongs: Arc<AtomicU64>,
	phase: Phase,
	pending_login: Option<PendingLogin>,
	user: Option<Arc<SessionUser>>,
	room: Option<RoomHandle>,
}

impl Session {
	async fn run<R>(
		&mut self,
		frames: &mut FrameReader<R>,
		room_rx: &mut Option<mpsc::Receiver<Frame>>,
		shutdown: &Notify,
	) -> anyhow::Result<()>
	where
		R: AsyncRead + Unpin,
	{
		loop {
			tokio::select! {
				event = frames.next_event() => match event? {
					ReadEvent::Frame(frame) => {
						metrics::counter!("parley_server_frames_in_total").increment(1);
						match self.handle_frame(frame).await? {
							Outcome::Continue => {}
							Outcome::Joined(rx) => *room_rx = Some(rx),
							Outcome::Left => *room_rx = None,
						}
					}
					ReadEvent::Closed => {
						debug!(conn_id = self.conn_id, "peer closed the connection");
						return Ok(());
					}
					ReadEvent::Malformed(err) => {
						debug!(conn_id = self.conn_id, error = %err, "malformed frame");
						self.send(Frame::error("Invalid message format")).await?;
						if self.phase == Phase::Unauth {
							// an unauthenticated peer sending garbage is dropped
							return Ok(());
						}
					}
				},
				event = recv_room(room_rx) => match event {
					Some(frame) => {
						if let Outcome::Left = self.relay_room_frame(frame).await? {
							*room_rx = None;
						}
					}
					None => {
						warn!(conn_id = self.conn_id, "subscriber sink closed, dropping connection");
						return Err(anyhow!("subscriber sink closed (slow consumer)"));
					}
				},
				_ = shutdown.notified() => {
					debug!(conn_id = self.conn_id, "shutdown signalled");
					return Ok(());
				}
			}
		}
	}

	async fn handle_frame(&mut self, frame: Frame) -> anyhow::Result<Outcome> {
		if matches!(frame, Frame::Pong) {
			self.pongs.fetch_add(1, Ordering::Relaxed);
			return Ok(Outcome::Continue);
		}

		match self.phase {
			Phase::Unauth => self.handle_unauth_frame(frame).await,
			Phase::Auth => self.handle_lobby_frame(frame).await,
			Phase::InRoom => self.handle_in_room_frame(frame).await,
		}
	}

	async fn handle_unauth_frame(&mut self, frame: Frame) -> anyhow::Result<Outcome> {
		match frame {
			Frame::Register(body) => match auth::register(self.ctx.store.as_ref(), body).await {
				Ok(username) => {
					info!(conn_id = self.conn_id, user = %username, "registered user");
					self.send(Frame::ok("User registered")).await?;
				}
				Err(err) => self.send_request_error(err).await?,
			},
			Frame::Login(body) => match auth::begin_login(self.ctx.store.as_ref(), body.username.trim()).await {
				Ok((pending, ciphertext)) => {
					self.pending_login = Some(pending);
					self.send(Frame::Challenge(ciphertext)).await?;
				}
				Err(err) => {
					self.pending_login = None;
					self.send_request_error(err).await?;
				}
			},
			Frame::ChallengeResponse(response) => match self.pending_login.take() {
				Some(pending) if pending.verify(&response) => {
					let user = Arc::new(SessionUser::new(pending.username, pending.public_key));
					match self.ctx.registry.attach(self.conn_id, Arc::clone(&user)) {
						Ok(()) => {
							info!(conn_id = self.conn_id, user = %user.username, "login succeeded");
							self.user = Some(user);
							self.phase = Phase::Auth;
							self.send(Frame::ok("Logged in")).await?;
						}
						Err(err) => {
							debug!(conn_id = self.conn_id, error = %err, "attach failed");
							self.send_request_error(RequestError::Conflict("User is already logged in")).await?;
						}
					}
				}
				_ => self.send_request_error(RequestError::AuthFailed).await?,
			},
			other => {
				debug!(conn_id = self.conn_id, kind = ?other.kind(), "ignoring frame while unauthenticated");
			}
		}
		Ok(Outcome::Continue)
	}

	async fn handle_lobby_frame(&mut self, frame: Frame) -> anyhow::Result<Outcome> {
		match frame {
			Frame::CreateRoom(body) => {
				match self.create_room(body).await {
					Ok(name) => {
						info!(conn_id = self.conn_id, room = %name, "room created");
						self.send(Frame::ok("Chat room created")).await?;
					}
					Err(err) => self.send_request_error(err).await?,
				}
				Ok(Outcome::Continue)
			}
			Frame::GetRooms => {
				let response = self.room_listing().await;
				self.send(Frame::GetRoomsResponse(response)).await?;
				Ok(Outcome::Continue)
			}
			Frame::Join(body) => match self.join_room(body).await {
				Ok(rx) => {
					self.phase = Phase::InRoom;
					self.send(Frame::ok("Joined chat room")).await?;
					Ok(Outcome::Joined(rx))
				}
				Err(err) => {
					self.send_request_error(err).await?;
					Ok(Outcome::Continue)
				}
			},
			other => {
				debug!(conn_id = self.conn_id, kind = ?other.kind(), "inadmissible frame in lobby");
				self.send(Frame::error("Invalid message type for this state")).await?;
				Ok(Outcome::Continue)
			}
		}
	}

	async fn handle_in_room_frame(&mut self, frame: Frame) -> anyhow::Result<Outcome> {
		match frame {
			Frame::Send(body) => {
				match self.persist_message(&body).await {
					Ok(timestamp_ms) => {
						self.send(Frame::ok("Message sent")).await?;
						self.publish_message(body, timestamp_ms).await;
					}
					Err(err) => self.send_request_error(err).await?,
				}
				Ok(Outcome::Continue)
			}
			Frame::Leave => {
				self.leave_room().await;
				self.send(Frame::ok("Left chat room")).await?;
				Ok(Outcome::Left)
			}
			other => {
				debug!(conn_id = self.conn_id, kind = ?other.kind(), "inadmissible frame in room");
				self.send(Frame::error("Invalid message type for this state")).await?;
				Ok(Outcome::Continue)
			}
		}
	}

	async fn create_room(&mut self, body: CreateRoomBody) -> Result<RoomName, RequestError> {
		if self.user.is_none() {
			return Err(RequestError::Unauthenticated);
		}
		let name = RoomName::parse(&body.name)?;
		let password = RoomPassword::parse(&body.password)?;
		self.ctx.rooms.create(&name, &password, body.hidden).await?;
		Ok(name)
	}

	async fn room_listing(&self) -> GetRoomsResponseBody {
		let mut rooms = Vec::new();
		for handle in self.ctx.rooms.list() {
			if handle.hidden() {
				continue;
			}
			let online_users = match handle.info().await {
				Some(info) => info.online_users as u32,
				None => 0,
			};
			rooms.push(RoomListing {
				name: handle.name().to_string(),
				has_password: handle.has_password(),
				online_users,
			});
		}
		rooms.sort_by(|a, b| a.name.cmp(&b.name));

		GetRoomsResponseBody {
			total_connected: self.ctx.registry.count() as u32,
			rooms,
		}
	}

	async fn join_room(&mut self, body: JoinBody) -> Result<mpsc::Receiver<Frame>, RequestError> {
		let user = self.user.clone().ok_or(RequestError::Unauthenticated)?;
		let name = RoomName::parse(&body.name)?;
		let room = self
			.ctx
			.rooms
			.get(name.as_str())
			.ok_or(RequestError::NotFound("Chat room does not exist"))?;

		if !room.check_password(&body.password) {
			return Err(RequestError::InvalidInput("Invalid room password".to_string()));
		}

		let rx = room
			.subscribe(user.username.clone(), user.public_key.clone())
			.await
			.map_err(|_| RequestError::Internal)?;

		user.set_current_room(Some(name.as_str().to_string()));
		info!(conn_id = self.conn_id, user = %user.username, room = %name, "joined room");
		self.room = Some(room);
		Ok(rx)
	}

	async fn persist_message(&self, body: &SendBody) -> Result<i64, RequestError> {
		let user = self.user.as_ref().ok_or(RequestError::Unauthenticated)?;
		let room = self.room.as_ref().ok_or(RequestError::Internal)?;

		let timestamp_ms = unix_ms_now();
		let per_recipient = body
			.encrypted_content
			.iter()
			.map(|(recipient, ciphertext)| RecipientCiphertext {
				recipient: recipient.clone(),
				ciphertext: ciphertext.clone(),
			})
			.collect();

		self.ctx
			.store
			.insert_message(NewMessage {
				room_name: room.name().to_string(),
				timestamp_ms,
				sender: user.username.clone(),
				per_recipient,
			})
			.await
			.map_err(|err| {
				tracing::error!(conn_id = self.conn_id, error = %err, "failed to persist message");
				RequestError::Storage
			})?;

		Ok(timestamp_ms)
	}

	async fn publish_message(&self, body: SendBody, timestamp_ms: i64) {
		let (Some(user), Some(room)) = (self.user.as_ref(), self.room.as_ref()) else {
			return;
		};
		for (recipient, ciphertext) in body.encrypted_content {
			room.publish(
				&recipient,
				Frame::ChatMessageReceived(ChatMessage {
					sender: user.username.clone(),
					timestamp_ms,
					ciphertext,
				}),
			)
			.await;
		}
	}

	async fn leave_room(&mut self) {
		if let Some(room) = self.room.take()
			&& let Some(user) = self.user.as_ref()
		{
			room.unsubscribe(&user.username).await;
			user.set_current_room(None);
			info!(conn_id = self.conn_id, user = %user.username, room = room.name(), "left room");
		}
		self.phase = Phase::Auth;
	}

	/// Forward a frame produced by the room event loop. A USER_LEFT naming
	/// this session's own user drops it back to the lobby.
	async fn relay_room_frame(&mut self, frame: Frame) -> anyhow::Result<Outcome> {
		let my_departure = matches!(
			(&frame, self.user.as_ref()),
			(Frame::UserLeft(name), Some(user)) if *name == user.username
		);

		self.send(frame).await?;

		if my_departure {
			if let Some(user) = self.user.as_ref() {
				user.set_current_room(None);
			}
			self.room = None;
			self.phase = Phase::Auth;
			Ok(Outcome::Left)
		} else {
			Ok(Outcome::Continue)
		}
	}

	async fn send(&self, frame: Frame) -> anyhow::Result<()> {
		metrics::counter!("parley_server_frames_out_total").increment(1);
		match tokio::time::timeout(SEND_STALL_TIMEOUT, self.out_tx.send(frame)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(_)) => Err(anyhow!("outbound channel closed")),
			Err(_) => Err(anyhow!("outbound queue stalled; peer is not reading")),
		}
	}

	async fn send_request_error(&self, err: RequestError) -> anyhow::Result<()> {
		debug!(conn_id = self.conn_id, error = %err, "request failed");
		self.send(Frame::error(err.to_string())).await
	}
}

/// Await the next room frame, or never when no room is joined.
async fn recv_room(room_rx: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
	match room_rx {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}

enum ReadEvent {
	Frame(Frame),
	Closed,
	Malformed(FramingError),
}

/// Incremental frame decoder over the read half. The buffer persists
/// across cancelled polls, so `next_event` is safe inside `select!`.
struct FrameReader<R> {
	reader: R,
	buf: BytesMut,
	max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
	fn new(reader: R, max_frame_size: usize) -> Self {
		Self {
			reader,
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_size,
		}
	}

	async fn next_event(&mut self) -> anyhow::Result<ReadEvent> {
		loop {
			match try_decode_frame_from_buffer(&mut self.buf, self.max_frame_size) {
				Ok(Some(frame)) => return Ok(ReadEvent::Frame(frame)),
				Ok(None) => {}
				Err(err) if err.is_recoverable() => return Ok(ReadEvent::Malformed(err)),
				Err(err) => return Err(err).context("framing"),
			}

			let n = self.reader.read_buf(&mut self.buf).await.context("socket read")?;
			if n == 0 {
				return Ok(ReadEvent::Closed);
			}
		}
	}
}

fn spawn_writer<W>(
	conn_id: u64,
	mut write_half: W,
	mut out_rx: mpsc::Receiver<Frame>,
	shutdown: Arc<Notify>,
	max_frame_size: usize,
) -> JoinHandle<()>
where
	W: AsyncWrite + Send + Unpin + 'static,
{
	tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			let encoded = match encode_frame(&frame, max_frame_size) {
				Ok(bytes) => bytes,
				Err(err) => {
					warn!(conn_id, error = %err, "dropping unencodable frame");
					continue;
				}
			};

			if let Err(err) = write_half.write_all(&encoded).await {
				debug!(conn_id, error = %err, "socket write failed");
				shutdown.notify_one();
				return;
			}
		}
		let _ = write_half.shutdown().await;
	})
}
