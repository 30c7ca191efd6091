//! One WebSocket client from upgrade through disconnect.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use metahub_core::{HubError, ValidationError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::dispatch::{ConnectionHandler, Flow};
use crate::heartbeat::{run_heartbeat, HeartbeatResult, MIN_INTERVAL};
use crate::hub::Hub;

/// How long the writer gets to flush queued frames after the connection closes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a session for an upgraded socket.
///
/// A writer task owns the sink and forwards the connection's queue plus
/// transport pings; the heartbeat task closes the connection when the
/// client goes silent; this task reads and dispatches frames. Whatever ends
/// the session, the identity is unregistered through the hub (unless the
/// connection was replaced in the meantime).
#[instrument(skip_all, fields(conn_id = tracing::field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    hub: Arc<Hub>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(config.send_queue_capacity);
    let conn = Arc::new(ClientConnection::new(send_tx));
    tracing::Span::current().record("conn_id", conn.id.as_str());

    let started = Instant::now();
    let metrics = Arc::clone(hub.metrics());
    metrics.counter_inc("ws_connections_total", &[], 1);
    metrics.gauge_add("ws_connections_active", &[], 1);
    info!("client connected");

    let writer = tokio::spawn(write_loop(ws_tx, send_rx, conn.closed_token(), config.heartbeat_interval));

    let heartbeat_conn = Arc::clone(&conn);
    let (interval, timeout) = (config.heartbeat_interval, config.heartbeat_timeout);
    let heartbeat = tokio::spawn(async move {
        let result = run_heartbeat(
            Arc::clone(&heartbeat_conn),
            interval,
            timeout,
            heartbeat_conn.closed_token(),
        )
        .await;
        if result == HeartbeatResult::TimedOut {
            warn!(conn_id = %heartbeat_conn.id, idle = ?heartbeat_conn.idle_for(), "client unresponsive, closing");
            heartbeat_conn.close();
        }
    });

    let closed = conn.closed_token();
    let mut handler = ConnectionHandler::new(Arc::clone(&hub), Arc::clone(&conn));
    let reason = loop {
        let next = tokio::select! {
            next = ws_rx.next() => next,
            () = closed.cancelled() => break "connection closed",
            () = shutdown.cancelled() => break "server shutting down",
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read error");
                break "transport error";
            }
            None => break "transport closed",
        };
        conn.mark_alive();

        let flow = match msg {
            Message::Text(text) => process_frame(&mut handler, text.as_str()).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => process_frame(&mut handler, text).await,
                Err(_) => {
                    let err = ValidationError::InvalidJson {
                        reason: "binary frame is not valid UTF-8".into(),
                    };
                    handler.report(None, &err.into()).await;
                    Flow::Continue
                }
            },
            Message::Close(_) => break "client sent close frame",
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if flow == Flow::Close {
            break "client left";
        }
    };

    let identity = handler.identity().cloned();
    handler.on_close(reason).await;
    conn.close();

    let mut writer = writer;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    heartbeat.abort();

    metrics.counter_inc("ws_disconnections_total", &[], 1);
    metrics.gauge_add("ws_connections_active", &[], -1);
    metrics.histogram_observe("ws_connection_duration_seconds", &[], started.elapsed().as_secs_f64());
    info!(reason, identity = ?identity, "client disconnected");
}

/// Dispatch one frame, turning a panic into an `INTERNAL_ERROR` reply.
async fn process_frame(handler: &mut ConnectionHandler, text: &str) -> Flow {
    match AssertUnwindSafe(handler.handle_frame(text)).catch_unwind().await {
        Ok(flow) => flow,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "panic while handling frame");
            handler.report(None, &HubError::internal(message)).await;
            Flow::Continue
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forward queued frames to the socket until the connection closes, then
/// flush what is left and send a close frame.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    closed: CancellationToken,
    ping_every: Duration,
) {
    let mut ping = tokio::time::interval(ping_every.max(MIN_INTERVAL));
    ping.tick().await;

    loop {
        tokio::select! {
            biased;
            msg = send_rx.recv() => match msg {
                Some(text) => {
                    if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            () = closed.cancelled() => {
                while let Ok(text) = send_rx.try_recv() {
                    if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    // a dead socket makes every later send fail fast
    closed.cancel();
    let _ = ws_tx.close().await;
}
