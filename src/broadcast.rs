//! Broadcast engine: stateless fan-out logic over the registry.
//!
//! Self-delivery policy: a sender never receives its own chat message.
//! User-list updates go to every connected client, the sender included.

use crate::protocol::Envelope;
use crate::registry::{ClientId, Registry};

/// Fan a chat message out to every other connected client, labelled with the
/// sender's current display name. A missing sender is a benign race (it
/// disconnected mid-flight), not an error.
pub fn broadcast_message(registry: &Registry, sender_id: ClientId, text: &str) {
    let name = match registry.name_of(sender_id) {
        Some(name) => name,
        None => {
            tracing::info!(sender = %sender_id, "broadcast from unknown client, dropping");
            return;
        }
    };

    let envelope = Envelope::Message {
        message: text.to_string(),
        sender: name,
    };
    let Some(payload) = envelope.to_json() else {
        return;
    };

    let delivered = registry.fan_out(Some(sender_id), &payload);
    tracing::info!(sender = %sender_id, delivered, "message broadcast");
}

/// Push the current user list to every connected client. Triggered after
/// every successful join and after every removal.
pub fn broadcast_user_list(registry: &Registry) {
    let envelope = Envelope::UserList {
        message: registry.snapshot(),
    };
    let Some(payload) = envelope.to_json() else {
        return;
    };

    let delivered = registry.fan_out(None, &payload);
    tracing::debug!(delivered, "user list broadcast");
}
