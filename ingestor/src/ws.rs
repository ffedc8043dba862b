//! WebSocket observers of a farm's live readings and alerts.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::fanout::FanOut;
use crate::metrics::{OBSERVERS_CONNECTED, OBSERVER_LAGGED_TOTAL};
use crate::rest::AppState;

/// Interval between heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(farm_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observe_farm(socket, farm_id, state.fanout, state.shutdown))
}

/// Forwards the farm's broadcast to one socket until either side closes.
///
/// The socket is driven from a single task: a slow client only delays its
/// own stream, and if it falls further behind than the broadcast buffer the
/// skipped events are counted and dropped.
async fn observe_farm(
    socket: WebSocket,
    farm_id: String,
    fanout: Arc<FanOut>,
    shutdown: CancellationToken,
) {
    let mut events = fanout.subscribe(&farm_id).await;
    OBSERVERS_CONNECTED.inc();
    info!("Observer connected to farm {}", farm_id);

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize farm event: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        debug!("Observer sink for farm {} closed", farm_id);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    OBSERVER_LAGGED_TOTAL.inc_by(skipped as f64);
                    warn!("Observer of farm {} lagged, skipped {} events", farm_id, skipped);
                }
                Err(RecvError::Closed) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => trace!("Pong from observer of farm {}", farm_id),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Observer receive error on farm {}: {}", farm_id, e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    OBSERVERS_CONNECTED.dec();
    info!("Observer disconnected from farm {}", farm_id);
}
