use std::sync::Arc;
use std::time::Duration;

use crate::registry::Registry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// The one registry every session shares.
    pub registry: Arc<Registry>,
    /// Reap connections that stay silent this long. `None` disables reaping.
    pub idle_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, idle_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            idle_timeout,
        }
    }
}
