//! WebSocket transport: axum upgrade endpoint plus frame adapters over the
//! split socket halves.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use super::{FrameReader, FrameWriter, TransportError};
use crate::session;
use crate::state::AppState;

/// GET /ws — upgrade and run a relay session for the connection.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let reader = WsFrameReader { stream };
    let writer = WsFrameWriter { sink };

    if let Err(err) =
        session::run_session(state.registry.clone(), reader, writer, state.idle_timeout).await
    {
        tracing::debug!(error = %err, "websocket session ended with transport error");
    }
}

pub struct WsFrameReader {
    stream: SplitStream<WebSocket>,
}

pub struct WsFrameWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(data))) => {
                    // Clients speak JSON text; tolerate binary frames that
                    // hold valid UTF-8, skip anything else.
                    match String::from_utf8(data.to_vec()) {
                        Ok(text) => return Ok(Some(text)),
                        Err(_) => {
                            tracing::warn!("non-utf8 binary frame, skipping");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(TransportError::WebSocket(err)),
            }
        }
    }
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(TransportError::WebSocket)
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}
