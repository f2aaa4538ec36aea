// =============================================================================
// WebSocket Handler — one StreamSession per connection
// =============================================================================
//
// Clients connect to `/ws?symbol=<symbol>` and receive:
//   1. The initial multi-interval snapshot with indicators (and a market
//      signal when advisory is enabled).
//   2. Incremental `realTimeUpdate` messages from the refresh loop.
//   3. `{error, kind}` messages for recoverable cycle failures.
//
// A missing or malformed symbol gets a single `invalid_subscription` error
// and the socket is closed; no session is started.
//
// On disconnect the session is closed and awaited before the handler returns.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::FeedError;
use crate::session::{StreamMessage, StreamSession};
use crate::types::Symbol;

/// Outbound messages buffered per connection before the session blocks.
const OUTBOUND_BUFFER: usize = 32;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    symbol: Option<String>,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let symbol = match query.symbol.as_deref() {
        Some(raw) => Symbol::parse(raw),
        None => Err(FeedError::InvalidSubscription("Symbol not provided.".into())),
    };

    ws.on_upgrade(move |socket| async move {
        match symbol {
            Ok(symbol) => handle_ws_connection(socket, state, symbol).await,
            Err(e) => reject(socket, e).await,
        }
    })
}

// =============================================================================
// Connection handler
// =============================================================================

/// Runs the session and the socket side by side via `tokio::select!`:
///   1. **Forward** — session messages are serialised onto the socket.
///   2. **Recv** — client frames are read to notice Close / errors and to
///      answer Pings.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, symbol: Symbol) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<StreamMessage>(OUTBOUND_BUFFER);

    let handle = StreamSession::spawn(
        symbol.clone(),
        state.session_config(),
        state.aggregator.clone(),
        state.advisor.clone(),
        tx,
    );
    let active = state.session_opened();
    info!(session = %handle.id(), symbol = %symbol, active, "WebSocket client subscribed");

    loop {
        tokio::select! {
            // ── Forward: session → client ───────────────────────────────
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(session = %handle.id(), "session ended");
                    break;
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to serialise stream message");
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Recv: client → server ───────────────────────────────────
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(session = %handle.id(), "WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(_)) => {
                        debug!("client message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!(session = %handle.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let id = handle.id();
    debug!(session = %id, state = %handle.state(), "closing session");
    // Drop the receiver first so a session blocked on a full buffer wakes up.
    drop(rx);
    handle.close().await;
    let active = state.session_closed();
    info!(session = %id, symbol = %symbol, active, "WebSocket client disconnected");
}

/// Send one error message and close the socket.
async fn reject(mut socket: WebSocket, err: FeedError) {
    warn!(kind = err.kind(), error = %err, "WebSocket subscription rejected");
    match serde_json::to_string(&StreamMessage::error(&err)) {
        Ok(json) => {
            if let Err(e) = socket.send(Message::Text(json)).await {
                debug!(error = %e, "failed to deliver rejection");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialise rejection"),
    }
    let _ = socket.send(Message::Close(None)).await;
}
