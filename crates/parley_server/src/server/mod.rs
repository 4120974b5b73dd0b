#![forbid(unsafe_code)]

pub mod auth;
pub mod error;
pub mod health;
pub mod keepalive;
pub mod registry;
pub mod room;
pub mod rooms;
pub mod session;
pub mod tls;


use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parley_store::Store;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::server::registry::Registry;
use crate::server::room::RoomConfig;
use crate::server::rooms::RoomDirectory;
use crate::server::session::{SessionSettings, handle_connection};

/// Shared services handed to every connection.
pub struct ServerContext {
	pub registry: Arc<Registry>,
	pub rooms: Arc<RoomDirectory>,
	pub store: Arc<dyn Store>,
	pub settings: SessionSettings,
}

impl ServerContext {
	pub fn new(store: Arc<dyn Store>, settings: SessionSettings, room_cfg: RoomConfig) -> Arc<Self> {
		let registry = Arc::new(Registry::default());
		let rooms = Arc::new(RoomDirectory::new(Arc::clone(&store), room_cfg));
		Arc::new(Self {
			registry,
			rooms,
			store,
			settings,
		})
	}
}

/// The accept loop: one session per inbound TCP (or TLS) connection.
pub struct ChatServer {
	listener: TcpListener,
	ctx: Arc<ServerContext>,
	tls: Option<TlsAcceptor>,
}

impl ChatServer {
	pub async fn bind(addr: SocketAddr, ctx: Arc<ServerContext>, tls: Option<TlsAcceptor>) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
		Ok(Self { listener, ctx, tls })
	}

	pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
		self.listener.local_addr().context("listener local_addr")
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let mut next_conn_id: u64 = 1;
		loop {
			let (stream, peer) = self.listener.accept().await.context("accept")?;
			let conn_id = next_conn_id;
			next_conn_id += 1;
			metrics::counter!("parley_server_connections_total").increment(1);

			let ctx = Arc::clone(&self.ctx);
			let tls = self.tls.clone();
			tokio::spawn(async move {
				info!(conn_id, remote = %peer, "accepted connection");

				let result = match tls {
					Some(acceptor) => match acceptor.accept(stream).await {
						Ok(stream) => handle_connection(conn_id, stream, ctx).await,
						Err(err) => {
							warn!(conn_id, error = %err, "TLS handshake failed");
							return;
						}
					},
					None => handle_connection(conn_id, stream, ctx).await,
				};

				if let Err(err) = result {
					warn!(conn_id, error = %err, "connection handler exited with error");
				}
			});
		}
	}
}
