//! Per-connection session: an inbound reader and an outbound drainer running
//! concurrently against one registry handle.
//!
//! Either half detecting failure retires the client. Retirement removes the
//! registry entry, which closes the mailbox (ending the drainer once it has
//! flushed) and cancels the shutdown token (unblocking a reader waiting on a
//! dead peer). Both halves tolerate the other having retired the client
//! first, and `run_session` returns only after both have terminated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{broadcast_message, broadcast_user_list};
use crate::protocol::InboundFrame;
use crate::registry::{ClientId, NewClient, Registry};
use crate::transport::{FrameReader, FrameWriter, TransportError};

/// Run one client session to completion. Invoked once per accepted
/// connection, from its own task. Returns the first transport error either
/// half hit, or `Ok(())` on a clean close.
pub async fn run_session<R, W>(
    registry: Arc<Registry>,
    mut reader: R,
    writer: W,
    idle_timeout: Option<Duration>,
) -> Result<(), TransportError>
where
    R: FrameReader,
    W: FrameWriter + 'static,
{
    let NewClient {
        id,
        mailbox,
        shutdown,
    } = registry.add_client();
    tracing::info!(client_id = %id, "session started");

    let outbound = tokio::spawn(outbound_half(Arc::clone(&registry), id, mailbox, writer));

    let inbound_result = inbound_half(&registry, id, &mut reader, shutdown, idle_timeout).await;
    retire(&registry, id);

    // Removal dropped the mailbox sender, so the drainer exits once it has
    // flushed whatever was already queued.
    let outbound_result = match outbound.await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(client_id = %id, error = %err, "outbound task panicked");
            Ok(())
        }
    };

    tracing::info!(client_id = %id, "session ended");
    inbound_result.and(outbound_result)
}

/// Remove the client and, if this call won the removal race, announce the
/// shrunken user list to everyone still connected.
fn retire(registry: &Registry, id: ClientId) {
    if registry.remove_client(id) {
        broadcast_user_list(registry);
    }
}

/// Inbound half: decode frames and drive the `Unnamed -> Named` state
/// machine. Exits on transport EOF/error or when the shutdown token fires
/// (the other half retired us).
async fn inbound_half<R: FrameReader>(
    registry: &Registry,
    id: ClientId,
    reader: &mut R,
    shutdown: CancellationToken,
    idle_timeout: Option<Duration>,
) -> Result<(), TransportError> {
    let mut named = false;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = next_frame(reader, id, idle_timeout) => frame,
        };

        let raw = match frame {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::info!(client_id = %id, "client disconnected");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(client_id = %id, error = %err, "read error");
                return Err(err);
            }
        };

        let frame = match InboundFrame::parse(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(client_id = %id, error = %err, "malformed frame, dropping");
                continue;
            }
        };

        match frame.kind.as_str() {
            "join" => {
                if named {
                    tracing::debug!(client_id = %id, "repeated join ignored");
                    continue;
                }
                if registry.set_name(id, &frame.data) {
                    named = true;
                    tracing::info!(client_id = %id, name = %frame.data, "client joined");
                    broadcast_user_list(registry);
                }
            }
            "message" => {
                if named {
                    broadcast_message(registry, id, &frame.data);
                } else {
                    tracing::warn!(client_id = %id, "message before join, dropping");
                }
            }
            other => {
                tracing::warn!(client_id = %id, kind = %other, "unknown frame type, dropping");
            }
        }
    }
}

async fn next_frame<R: FrameReader>(
    reader: &mut R,
    id: ClientId,
    idle_timeout: Option<Duration>,
) -> Result<Option<String>, TransportError> {
    match idle_timeout {
        Some(window) => match tokio::time::timeout(window, reader.read_frame()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(client_id = %id, "idle timeout elapsed, retiring connection");
                Ok(None)
            }
        },
        None => reader.read_frame().await,
    }
}

/// Outbound half: sole consumer of the mailbox, sole writer to the
/// transport. Terminates when the mailbox is closed and drained, or on the
/// first write failure.
async fn outbound_half<W: FrameWriter>(
    registry: Arc<Registry>,
    id: ClientId,
    mut mailbox: mpsc::Receiver<String>,
    mut writer: W,
) -> Result<(), TransportError> {
    while let Some(payload) = mailbox.recv().await {
        if let Err(err) = writer.write_frame(&payload).await {
            tracing::info!(client_id = %id, error = %err, "write failed, retiring client");
            retire(&registry, id);
            return Err(err);
        }
    }

    // Closed and empty: removal already happened, just release the transport.
    writer.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::time::{sleep, timeout};

    /// Reader fed from a channel. Dropping the sender models peer EOF.
    struct MockReader {
        rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl FrameReader for MockReader {
        async fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
            Ok(self.rx.recv().await)
        }
    }

    /// Writer that forwards frames to a channel. Dropping the receiver models
    /// a broken pipe on the next write.
    struct MockWriter {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl FrameWriter for MockWriter {
        async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
            self.tx
                .send(frame.to_string())
                .map_err(|_| TransportError::Io(std::io::Error::other("mock pipe closed")))
        }

        async fn close(&mut self) {}
    }

    fn mock_pair() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
        MockReader,
        MockWriter,
    ) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        (
            frames_tx,
            wire_rx,
            MockReader { rx: frames_rx },
            MockWriter { tx: wire_tx },
        )
    }

    async fn recv_json(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let raw = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("wire closed");
        serde_json::from_str(&raw).unwrap()
    }

    async fn wait_for_count(registry: &Registry, expected: usize) {
        for _ in 0..100 {
            if registry.client_count() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "registry never reached {} clients (now {})",
            expected,
            registry.client_count()
        );
    }

    #[tokio::test]
    async fn join_broadcasts_user_list() {
        let registry = Arc::new(Registry::new());
        let (frames, mut wire, reader, writer) = mock_pair();
        let session = tokio::spawn(run_session(Arc::clone(&registry), reader, writer, None));

        frames.send(r#"{"Type":"join","Data":"alice"}"#.to_string()).unwrap();

        let envelope = recv_json(&mut wire).await;
        assert_eq!(envelope["type"], "userList");
        assert_eq!(envelope["message"], serde_json::json!(["alice"]));

        drop(frames);
        assert!(session.await.unwrap().is_ok());
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn message_before_join_produces_no_broadcast() {
        let registry = Arc::new(Registry::new());
        let mut observer = registry.add_client();
        let (frames, _wire, reader, writer) = mock_pair();
        let session = tokio::spawn(run_session(Arc::clone(&registry), reader, writer, None));

        frames.send(r#"{"Type":"message","Data":"too early"}"#.to_string()).unwrap();
        sleep(Duration::from_millis(50)).await;

        assert!(observer.mailbox.try_recv().is_err());
        // The offending client is not disconnected for this.
        assert_eq!(registry.client_count(), 2);

        drop(frames);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn message_after_join_reaches_other_clients_with_sender_name() {
        let registry = Arc::new(Registry::new());
        let mut observer = registry.add_client();
        let (frames, _wire, reader, writer) = mock_pair();
        let session = tokio::spawn(run_session(Arc::clone(&registry), reader, writer, None));

        frames.send(r#"{"Type":"join","Data":"alice"}"#.to_string()).unwrap();
        frames.send(r#"{"Type":"message","Data":"hello"}"#.to_string()).unwrap();

        // Observer first sees the join's user list, then the message.
        let user_list = timeout(Duration::from_secs(1), observer.mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        let user_list: Value = serde_json::from_str(&user_list).unwrap();
        assert_eq!(user_list["type"], "userList");

        let message = timeout(Duration::from_secs(1), observer.mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        let message: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(message["type"], "message");
        assert_eq!(message["message"], "hello");
        assert_eq!(message["sender"], "alice");

        drop(frames);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_do_not_kill_the_session() {
        let registry = Arc::new(Registry::new());
        let (frames, mut wire, reader, writer) = mock_pair();
        let session = tokio::spawn(run_session(Arc::clone(&registry), reader, writer, None));

        frames.send("this is not json".to_string()).unwrap();
        frames.send(r#"{"Type":"dance","Data":"??"}"#.to_string()).unwrap();
        frames.send(r#"{"Type":"join","Data":"bob"}"#.to_string()).unwrap();

        // The join still lands after the garbage.
        let envelope = recv_json(&mut wire).await;
        assert_eq!(envelope["type"], "userList");

        drop(frames);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_broadcasts_fresh_user_list_to_survivors() {
        let registry = Arc::new(Registry::new());
        let mut observer = registry.add_client();
        registry.set_name(observer.id, "observer");

        let (frames, _wire, reader, writer) = mock_pair();
        let session = tokio::spawn(run_session(Arc::clone(&registry), reader, writer, None));

        frames.send(r#"{"Type":"join","Data":"bob"}"#.to_string()).unwrap();
        let joined = timeout(Duration::from_secs(1), observer.mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        let joined: Value = serde_json::from_str(&joined).unwrap();
        let mut names: Vec<&str> = joined["message"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["bob", "observer"]);

        // Peer disconnects.
        drop(frames);
        session.await.unwrap().unwrap();

        let departed = timeout(Duration::from_secs(1), observer.mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        let departed: Value = serde_json::from_str(&departed).unwrap();
        assert_eq!(departed["type"], "userList");
        assert_eq!(departed["message"], serde_json::json!(["observer"]));
        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn write_failure_retires_the_client() {
        let registry = Arc::new(Registry::new());
        let (frames, wire, reader, writer) = mock_pair();
        let session = tokio::spawn(run_session(Arc::clone(&registry), reader, writer, None));

        frames.send(r#"{"Type":"join","Data":"alice"}"#.to_string()).unwrap();
        wait_for_count(&registry, 1).await;

        // Break the write side; the next envelope triggers retirement.
        drop(wire);
        broadcast_user_list(&registry);

        wait_for_count(&registry, 0).await;
        drop(frames);
        assert!(session.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn idle_timeout_reaps_silent_connections() {
        let registry = Arc::new(Registry::new());
        let (frames, _wire, reader, writer) = mock_pair();
        let session = tokio::spawn(run_session(
            Arc::clone(&registry),
            reader,
            writer,
            Some(Duration::from_millis(50)),
        ));

        // Never send anything; keep the sender alive so the reader pends.
        let result = timeout(Duration::from_secs(2), session)
            .await
            .expect("session should end on idle timeout")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(registry.client_count(), 0);
        drop(frames);
    }

    #[tokio::test]
    async fn queued_envelopes_are_flushed_before_the_writer_exits() {
        let registry = Arc::new(Registry::new());
        let mut observer_wire;
        {
            let (frames, wire, reader, writer) = mock_pair();
            observer_wire = wire;
            let session = tokio::spawn(run_session(Arc::clone(&registry), reader, writer, None));

            frames.send(r#"{"Type":"join","Data":"alice"}"#.to_string()).unwrap();
            wait_for_count(&registry, 1).await;

            // Queue a few envelopes, then retire the client immediately.
            // Single-session test: the first assigned id is always 0.
            broadcast_user_list(&registry);
            broadcast_user_list(&registry);
            registry.remove_client(ClientId::from_raw(0));

            drop(frames);
            session.await.unwrap().unwrap();
        }

        // Everything enqueued before removal was still written: the join's
        // user list plus the two explicit broadcasts.
        let mut written = 0;
        while observer_wire.try_recv().is_ok() {
            written += 1;
        }
        assert_eq!(written, 3);
    }
}
