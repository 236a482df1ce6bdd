//! Tag-filtered WebSocket fan-out.
//!
//! The host accepts sockets and hands them to the instance with
//! optional tags; [`Broadcaster`] fans text messages out to every
//! accepted socket, or to the subset carrying a tag. Send failures are
//! logged and the socket is dropped from the roster - a dead peer must
//! not break the broadcast for the rest.

use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::error::Result;

/// A connected socket as the core sees it.
pub trait Socket: Send + Sync {
    /// Sends one text frame.
    fn send_text(&self, message: &str) -> Result<()>;
}

struct SocketEntry {
    tags: Vec<String>,
    socket: Arc<dyn Socket>,
}

/// Roster of accepted sockets with tag-filtered broadcast.
#[derive(Default)]
pub struct Broadcaster {
    sockets: RwLock<Vec<SocketEntry>>,
    auto_response: RwLock<Option<(String, String)>>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("sockets", &self.sockets.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Creates an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a socket with the given tags.
    pub fn accept(&self, socket: Arc<dyn Socket>, tags: Vec<String>) {
        self.sockets.write().unwrap().push(SocketEntry { tags, socket });
    }

    /// Number of sockets, optionally restricted to a tag.
    pub fn socket_count(&self, tag: Option<&str>) -> usize {
        self.sockets
            .read()
            .unwrap()
            .iter()
            .filter(|entry| tag.is_none_or(|t| entry.tags.iter().any(|have| have == t)))
            .count()
    }

    /// Sends `message` to every socket (or every socket with `tag`).
    ///
    /// Returns how many sockets received it. Failing sockets are
    /// dropped from the roster.
    pub fn broadcast(&self, message: &str, tag: Option<&str>) -> usize {
        let mut delivered = 0;
        let mut sockets = self.sockets.write().unwrap();
        sockets.retain(|entry| {
            if tag.is_some_and(|t| !entry.tags.iter().any(|have| have == t)) {
                return true;
            }
            match entry.socket.send_text(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(err) => {
                    warn!(error = %err, "Dropping failed socket");
                    false
                }
            }
        });
        delivered
    }

    /// Installs the request/response pair answered without waking the
    /// instance.
    pub fn set_auto_response(&self, request: impl Into<String>, response: impl Into<String>) {
        *self.auto_response.write().unwrap() = Some((request.into(), response.into()));
    }

    /// The configured auto-response pair, if any.
    pub fn auto_response(&self) -> Option<(String, String)> {
        self.auto_response.read().unwrap().clone()
    }
}
