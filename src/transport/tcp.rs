//! Raw TCP transport: one JSON document per newline-delimited line.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use super::{FrameReader, FrameWriter, TransportError};
use crate::session;
use crate::state::AppState;

/// Accept loop: one session task per accepted connection. Runs until the
/// listener fails permanently; individual session errors never escape.
pub async fn serve(listener: TcpListener, state: AppState) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "tcp client connected");
                let state = state.clone();
                tokio::spawn(async move {
                    let (reader, writer) = split(stream);
                    let result = session::run_session(
                        Arc::clone(&state.registry),
                        reader,
                        writer,
                        state.idle_timeout,
                    )
                    .await;
                    if let Err(err) = result {
                        tracing::debug!(%peer, error = %err, "tcp session ended with transport error");
                    }
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "tcp accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

pub struct TcpFrameReader {
    reader: BufReader<OwnedReadHalf>,
}

pub struct TcpFrameWriter {
    writer: OwnedWriteHalf,
}

/// Split an accepted stream into the reader/writer pair the session runs.
pub fn split(stream: TcpStream) -> (TcpFrameReader, TcpFrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        TcpFrameReader {
            reader: BufReader::new(read_half),
        },
        TcpFrameWriter { writer: write_half },
    )
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
