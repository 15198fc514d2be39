//! WebSocket endpoint
//!
//! The client is authenticated from the upgrade request (cookie or `token`
//! query parameter) before the protocol switch. After the upgrade the socket
//! is split: the write half becomes the connection's [`FrameSink`], the read
//! half feeds the [`MessageDispatcher`](crate::MessageDispatcher) loop.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::COOKIE, HeaderMap},
    response::{IntoResponse, Response},
};
use duggu_core::auth::{token_from_cookie, Identity};
use duggu_core::{Connection, FrameSink};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::dispatch::FrameStream;
use crate::http::{AppError, AppState};

/// Query parameters of the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Access token for clients that cannot set the cookie
    pub token: Option<String>,
}

/// Write half of an upgraded socket
struct WebSocketSink(SplitSink<WebSocket, Message>);

#[async_trait::async_trait]
impl FrameSink for WebSocketSink {
    async fn send_frame(&mut self, frame: String) -> duggu_core::Result<()> {
        self.0
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| duggu_core::Error::Transport(format!("WebSocket write failed: {e}")))
    }

    async fn close(&mut self) -> duggu_core::Result<()> {
        SinkExt::close(&mut self.0)
            .await
            .map_err(|e| duggu_core::Error::Transport(format!("WebSocket close failed: {e}")))
    }
}

/// Read half of an upgraded socket
struct WebSocketFrames(SplitStream<WebSocket>);

#[async_trait::async_trait]
impl FrameStream for WebSocketFrames {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Ignoring non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                None => return None,
                // ping/pong are answered by axum
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Resolve the caller's identity from the upgrade request.
///
/// The cookie wins over the `token` query parameter.
pub fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
    query: WsQuery,
) -> Result<Identity, AppError> {
    let token = headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookie| token_from_cookie(cookie, &state.cookie_name))
        .or(query.token.filter(|token| !token.is_empty()));

    state.authenticator.authenticate(token.as_deref()).map_err(|e| {
        debug!(error = %e, "Rejected WebSocket client");
        AppError::from(e)
    })
}

/// Upgrade handler for the signaling socket
pub async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // authentication is checked before the upgrade headers so a bad token is
    // always a 401
    let identity = match authenticate_request(&state, &headers, query) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let max_message_size = state.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let (sink, stream) = socket.split();
    let connection = Connection::new(WebSocketSink(sink));
    let mut frames = WebSocketFrames(stream);

    info!(
        connection = %connection.id(),
        user = %identity.display_name,
        "WebSocket connection established"
    );

    state.dispatcher.run(connection, identity, &mut frames).await;
}
