#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parley_protocol::messages::Frame;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

/// Per-connection keepalive supervisor.
///
/// Every `interval` the supervisor sends a PING and resets the pong
/// counter. A tick that finds the counter still at zero from the previous
/// PING signals shutdown; the session loop performs the actual teardown.
///
/// Pings are enqueued with `try_send`: the supervisor must never block on
/// the write path it is supervising. A full queue leaves the pending
/// verdict in place, so a jammed connection closes one tick later.
pub fn spawn(
	conn_id: u64,
	interval: Duration,
	out_tx: mpsc::Sender<Frame>,
	pongs: Arc<AtomicU64>,
	shutdown: Arc<Notify>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut awaiting_pong = false;
		loop {
			tokio::time::sleep(interval).await;

			if awaiting_pong && pongs.load(Ordering::Relaxed) == 0 {
				debug!(conn_id, "no PONG within keepalive window, closing connection");
				metrics::counter!("parley_server_keepalive_timeouts_total").increment(1);
				shutdown.notify_one();
				return;
			}

			pongs.store(0, Ordering::Relaxed);
			match out_tx.try_send(Frame::Ping) {
				Ok(()) => awaiting_pong = true,
				Err(TrySendError::Full(_)) => {
					debug!(conn_id, "outbound queue full at keepalive tick");
					awaiting_pong = true;
				}
				Err(TrySendError::Closed(_)) => return,
			}
		}
	})
}
