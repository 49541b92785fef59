use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::chat::ChannelId;
use crate::connection_manager::{Outbound, Session};
use crate::metrics::WsMetrics;
use crate::server::{extract_bearer_token, AppState};

use super::endpoint::{ActiveSession, DeliveryEndpoint, DeliveryError, SessionState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub channel_id: Option<ChannelId>,
}

/// WebSocket upgrade handler for `/ws/chat`.
///
/// Credentials and channel membership are checked after the upgrade so a
/// rejected client receives a close frame with code 1008.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some(), channel_id = ?query.channel_id)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = extract_token(&query, &headers);
    let endpoint = Arc::clone(&state.endpoint);
    let channel_id = query.channel_id;

    ws.on_upgrade(move |socket| handle_socket(socket, endpoint, token, channel_id))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    query
        .token
        .clone()
        .or_else(|| extract_bearer_token(headers).map(str::to_string))
}

#[tracing::instrument(
    name = "ws.connection",
    skip(socket, endpoint, token),
    fields(otel.kind = "server")
)]
async fn handle_socket(
    mut socket: WebSocket,
    endpoint: Arc<DeliveryEndpoint>,
    token: Option<String>,
    channel_id: Option<ChannelId>,
) {
    let mut state = SessionState::Connecting;

    let user = match endpoint.authenticate(token.as_deref()).await {
        Ok(user) => user,
        Err(e) => {
            reject(&mut socket, state, e).await;
            return;
        }
    };
    state = state.advance(SessionState::Authenticated);

    let activated = match endpoint.authorize(&user, channel_id).await {
        Ok(channel) => endpoint.activate(user, channel).await,
        Err(e) => Err(e),
    };
    let (active, outbound) = match activated {
        Ok(activated) => activated,
        Err(e) => {
            reject(&mut socket, state, e).await;
            return;
        }
    };
    state = state.advance(SessionState::Active);

    WsMetrics::record_opened();
    let connection_start = Instant::now();
    tracing::info!(
        session_id = %active.session.id,
        user_id = active.user.id,
        channel_id = active.channel.id,
        "WebSocket connection established"
    );

    let (ws_sender, ws_receiver) = socket.split();

    let writer = tokio::spawn(write_loop(
        ws_sender,
        outbound,
        Arc::clone(&active.session),
        endpoint.config().write_timeout,
    ));

    read_loop(ws_receiver, &endpoint, &active).await;
    state = state.advance(SessionState::Closing);

    let state = state.advance(endpoint.close(&active).await);
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "Writer task ended abnormally");
    }

    let duration = connection_start.elapsed().as_secs_f64();
    WsMetrics::record_closed(duration);
    tracing::info!(
        session_id = %active.session.id,
        user_id = active.user.id,
        channel_id = active.channel.id,
        duration_secs = duration,
        state = ?state,
        "WebSocket connection closed"
    );
}

async fn reject(socket: &mut WebSocket, state: SessionState, error: DeliveryError) {
    let _ = state.advance(SessionState::Rejected);
    WsMetrics::record_rejected(error.reason());
    tracing::warn!(error = %error, "WebSocket connection rejected");

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: error.close_code(),
            reason: error.to_string().into(),
        })))
        .await;
}

/// Drive inbound frames until the peer leaves or the session is closed.
async fn read_loop(
    mut receiver: futures::stream::SplitStream<WebSocket>,
    endpoint: &DeliveryEndpoint,
    active: &ActiveSession,
) {
    loop {
        let frame = tokio::select! {
            _ = active.session.closed() => break,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                WsMetrics::record_frame("text");
                // Failures were already reported to the client
                let _ = endpoint.handle_text(active, text.as_str()).await;
            }
            Some(Ok(Message::Binary(_))) => {
                WsMetrics::record_frame("binary");
                endpoint.handle_binary(active);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                active.session.touch();
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(session_id = %active.session.id, "Peer closed the connection");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %active.session.id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Drain the session's outbound queue into the socket. Every write is bounded
/// by `write_timeout`; a slow or failed write closes the session.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    session: Arc<Session>,
    write_timeout: Duration,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = session.closed() => break,
            item = outbound.recv() => item,
        };

        let message = match item {
            Some(Outbound::Event(event)) => match event.to_json() {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize event");
                    continue;
                }
            },
            Some(Outbound::Ping) => Message::Ping(Vec::new().into()),
            None => break,
        };

        match tokio::time::timeout(write_timeout, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(session_id = %session.id, error = %e, "Socket write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(session_id = %session.id, "Socket write timed out");
                break;
            }
        }
    }

    session.close();
    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }));
    let _ = tokio::time::timeout(write_timeout, sender.send(close)).await;
}
