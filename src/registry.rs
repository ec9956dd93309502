//! Connection registry: the single shared table of connected clients.
//!
//! One mutex guards the id counter and the table together, so no caller can
//! ever observe a partially admitted or partially removed client. The lock is
//! held only for table mutation and mailbox enqueue; transport I/O always
//! happens outside it, in the session tasks.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bounded outbound mailbox depth per client.
pub const MAILBOX_CAPACITY: usize = 100;

/// Identity of one connected client. Assigned monotonically at admission and
/// never reused for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Build a ClientId from a raw value (mainly for testing).
    #[cfg(test)]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side record of one connected client.
struct Handle {
    /// Display name. Empty until the client's join frame is processed.
    name: String,
    /// Producer side of the client's outbound mailbox. Dropped on removal,
    /// which is what signals the outbound drainer to stop.
    mailbox: mpsc::Sender<String>,
    /// Cancelled on removal so the session halves close the transport they own.
    shutdown: CancellationToken,
    /// Envelopes dropped because the mailbox was full.
    dropped: u64,
}

/// What a session receives back from admission: its identity, the consumer
/// side of its mailbox, and the shutdown signal the registry fires on removal.
pub struct NewClient {
    pub id: ClientId,
    pub mailbox: mpsc::Receiver<String>,
    pub shutdown: CancellationToken,
}

#[derive(Default)]
struct Inner {
    table: HashMap<ClientId, Handle>,
    next_id: u64,
}

/// Registry of all live connections. Explicitly constructed and shared via
/// `Arc`; there is no global instance.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new client: allocate the next id and insert a handle with an
    /// empty name and a fresh bounded mailbox. Total; never fails.
    pub fn add_client(&self) -> NewClient {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let shutdown = CancellationToken::new();

        let id = {
            let mut inner = self.inner.lock();
            let id = ClientId(inner.next_id);
            inner.next_id += 1;
            inner.table.insert(
                id,
                Handle {
                    name: String::new(),
                    mailbox: tx,
                    shutdown: shutdown.clone(),
                    dropped: 0,
                },
            );
            id
        };

        tracing::debug!(client_id = %id, "client registered");
        NewClient {
            id,
            mailbox: rx,
            shutdown,
        }
    }

    /// Remove a client. Returns `true` if this call actually removed it.
    ///
    /// Removal can race between the inbound and outbound halves of the same
    /// session, so a missing id is a warning, not an error. Ordering contract:
    /// the table entry is deleted under the lock first (no broadcast can
    /// re-acquire the handle after that), then the mailbox sender is dropped
    /// (the drainer observes closed-and-empty), then the shutdown token is
    /// cancelled (the session closes the transport it owns).
    pub fn remove_client(&self, id: ClientId) -> bool {
        let handle = {
            let mut inner = self.inner.lock();
            inner.table.remove(&id)
        };

        match handle {
            Some(handle) => {
                if handle.dropped > 0 {
                    tracing::warn!(
                        client_id = %id,
                        dropped = handle.dropped,
                        "client removed with undelivered envelopes"
                    );
                }
                drop(handle.mailbox);
                handle.shutdown.cancel();
                tracing::debug!(client_id = %id, "client removed");
                true
            }
            None => {
                tracing::warn!(client_id = %id, "attempted to remove unknown client");
                false
            }
        }
    }

    /// Set the display name in place. Visible to any subsequent lookup or
    /// broadcast from any task. Returns `false` if the client is gone.
    pub fn set_name(&self, id: ClientId, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.table.get_mut(&id) {
            Some(handle) => {
                handle.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Current display name of a client, or `None` if it is gone.
    pub fn name_of(&self, id: ClientId) -> Option<String> {
        let inner = self.inner.lock();
        inner.table.get(&id).map(|handle| handle.name.clone())
    }

    /// All current display names, unnamed clients included as empty strings.
    /// No ordering guarantee.
    pub fn snapshot(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner.table.values().map(|h| h.name.clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.table.len()
    }

    /// Enqueue an already-serialized envelope into every mailbox except
    /// `skip`, under the table lock. Non-blocking: a full mailbox drops the
    /// envelope for that recipient and counts it, so a slow reader never
    /// stalls the broadcaster. Returns the number of successful enqueues.
    pub(crate) fn fan_out(&self, skip: Option<ClientId>, payload: &str) -> usize {
        let mut inner = self.inner.lock();
        let mut delivered = 0;

        for (id, handle) in inner.table.iter_mut() {
            if Some(*id) == skip {
                continue;
            }
            match handle.mailbox.try_send(payload.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    handle.dropped += 1;
                    tracing::warn!(
                        client_id = %id,
                        dropped = handle.dropped,
                        "mailbox full, dropping envelope"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Session already tore down its receiver; removal is in
                    // flight on another task.
                    tracing::debug!(client_id = %id, "mailbox closed, removal in flight");
                }
            }
        }

        delivered
    }
}
