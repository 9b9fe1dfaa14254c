//! Events demultiplexed by the backend's single event loop.

use tokio::sync::mpsc;

/// One event for the backend loop.
///
/// Everything the backend reacts to arrives through this queue, which is
/// what serializes RPCs across sessions: a commit is never interleaved with
/// an edit from another session.
#[derive(Debug)]
pub enum BackendEvent {
    /// A new client connected; `reply` carries framed messages back to it.
    Connect {
        /// Human-readable transport description.
        peer: String,
        /// Authenticated principal.
        username: String,
        /// Outgoing message channel for this client.
        reply: mpsc::UnboundedSender<String>,
    },
    /// A complete framed message from a client.
    Message {
        /// Session the frame arrived on.
        session_id: u32,
        /// The frame payload, without the end-of-message marker.
        payload: String,
    },
    /// A client connection closed.
    Disconnect {
        /// Session that went away.
        session_id: u32,
    },
    /// The confirmed-commit timer fired.
    ConfirmTimeout {
        /// Timer generation; stale timers are ignored.
        epoch: u64,
    },
}

/// Published on the internal event stream after each successful commit.
#[derive(Debug, Clone)]
pub struct CommitNotification {
    /// The datastore that changed (always "running" today).
    pub datastore: String,
    /// Paths touched by the commit.
    pub changed_paths: Vec<String>,
}
