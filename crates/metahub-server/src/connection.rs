//! Per-socket transport handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why a send to a connection did not go through.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    #[error("connection closed")]
    Closed,
    #[error("send queue stayed full for {0:?}")]
    TimedOut(Duration),
}

/// One live WebSocket, as seen by the hub.
///
/// The socket's writer task owns the receiving end of `tx` and stops when
/// `closed` is cancelled, so cancelling the token tears the socket down and
/// aborts any send waiting on a full queue.
pub struct ClientConnection {
    /// Unique per transport; distinguishes a replaced connection from its successor.
    pub id: String,
    tx: mpsc::Sender<Arc<String>>,
    pub connected_at: DateTime<Utc>,
    closed: CancellationToken,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl ClientConnection {
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self::with_id(format!("conn_{}", uuid::Uuid::now_v7()), tx)
    }

    pub fn with_id(id: impl Into<String>, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: id.into(),
            tx,
            connected_at: Utc::now(),
            closed: CancellationToken::new(),
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Queue a frame, waiting at most `send_timeout` for room.
    pub async fn deliver(&self, text: Arc<String>, send_timeout: Duration) -> Result<(), SendFailure> {
        if self.closed.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        tokio::select! {
            () = self.closed.cancelled() => Err(SendFailure::Closed),
            sent = tokio::time::timeout(send_timeout, self.tx.send(text)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(SendFailure::Closed),
                Err(_) => Err(SendFailure::TimedOut(send_timeout)),
            },
        }
    }

    /// Ask the writer task to close the socket. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Token cancelled once this connection is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Record inbound activity (any frame, including transport pongs).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag for the heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEND_TIMEOUT: Duration = Duration::from_millis(50);

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ClientConnection::with_id("conn_1", tx), rx)
    }

    #[test]
    fn ids_are_unique() {
        let (tx, _rx) = mpsc::channel(1);
        let a = ClientConnection::new(tx.clone());
        let b = ClientConnection::new(tx);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("conn_"));
    }

    #[tokio::test]
    async fn deliver_success() {
        let (conn, mut rx) = make_connection(4);
        conn.deliver(Arc::new("hello".into()), SEND_TIMEOUT).await.unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn deliver_to_dropped_receiver_is_closed() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(
            conn.deliver(Arc::new("x".into()), SEND_TIMEOUT).await,
            Err(SendFailure::Closed)
        );
    }

    #[tokio::test]
    async fn deliver_to_full_queue_times_out() {
        let (conn, _rx) = make_connection(1);
        conn.deliver(Arc::new("1".into()), SEND_TIMEOUT).await.unwrap();
        assert_eq!(
            conn.deliver(Arc::new("2".into()), SEND_TIMEOUT).await,
            Err(SendFailure::TimedOut(SEND_TIMEOUT))
        );
    }

    #[tokio::test]
    async fn close_cancels_pending_send() {
        let (conn, _rx) = make_connection(1);
        let conn = Arc::new(conn);
        conn.deliver(Arc::new("1".into()), SEND_TIMEOUT).await.unwrap();

        let pending = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.deliver(Arc::new("2".into()), Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        conn.close();
        assert_eq!(pending.await.unwrap(), Err(SendFailure::Closed));
    }

    #[test]
    fn alive_flag_resets_on_check() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _rx) = make_connection(1);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.closed_token().is_cancelled());
    }
}
