//! Transport seam between the relay core and byte delivery.
//!
//! The core is agnostic to framing: a frame is one JSON document, whether it
//! arrived as a newline-delimited line over raw TCP or as a WebSocket text
//! message. Each transport supplies a reader and a writer half, which the
//! session runs concurrently.

pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame from the peer. `Ok(None)` is a clean end-of-stream.
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Best-effort close. Errors from an already-gone peer are ignored.
    async fn close(&mut self);
}
