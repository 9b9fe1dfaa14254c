//! Client sessions and the session table.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Per-session protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, hello not yet received.
    Hello,
    /// Hello exchanged; RPCs accepted.
    Ready,
    /// Closing; no further RPCs.
    Closed,
}

/// One connected client.
#[derive(Debug)]
pub struct Session {
    id: u32,
    peer: String,
    username: String,
    state: SessionState,
    reply_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Session {
    /// Session id; unique for the lifetime of the process.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Transport description for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Authenticated principal.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Overrides the principal (tests, trusted front-ends).
    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    /// Protocol state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves the session to READY after hello.
    pub fn mark_ready(&mut self) {
        if self.state == SessionState::Hello {
            self.state = SessionState::Ready;
        }
    }

    /// Marks the session closing.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Queues an outgoing message; returns false if the peer is gone.
    pub fn send(&self, message: String) -> bool {
        match &self.reply_tx {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// A clone of the outgoing channel, so replies can still be delivered
    /// when the session is torn down while handling its last RPC.
    pub fn reply_sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.reply_tx.clone()
    }
}

/// The session table.
///
/// Ids increase monotonically and are never reused within a process run.
#[derive(Debug, Default)]
pub struct SessionTable {
    next_id: u32,
    sessions: HashMap<u32, Session>,
}

impl SessionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session, assigning the next id.
    pub fn open(
        &mut self,
        peer: impl Into<String>,
        username: impl Into<String>,
        reply_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        let session = Session {
            id,
            peer: peer.into(),
            username: username.into(),
            state: SessionState::Hello,
            reply_tx,
        };
        info!(session = id, peer = session.peer.as_str(), "session opened");
        self.sessions.insert(id, session);
        id
    }

    /// Session by id.
    pub fn get(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Session by id, mutably.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Removes a session, returning it for final cleanup.
    pub fn close(&mut self, id: u32) -> Option<Session> {
        let session = self.sessions.remove(&id);
        if session.is_some() {
            debug!(session = id, "session closed");
        }
        session
    }

    /// Ids of all live sessions.
    pub fn ids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_monotonic_and_not_reused() {
        let mut table = SessionTable::new();
        let a = table.open("test", "admin", None);
        let b = table.open("test", "admin", None);
        assert!(b > a);
        table.close(a);
        let c = table.open("test", "admin", None);
        assert!(c > b, "closed ids are not handed out again");
    }

    #[test]
    fn test_state_transitions() {
        let mut table = SessionTable::new();
        let id = table.open("test", "admin", None);
        assert_eq!(table.get(id).unwrap().state(), SessionState::Hello);
        table.get_mut(id).unwrap().mark_ready();
        assert_eq!(table.get(id).unwrap().state(), SessionState::Ready);
        table.get_mut(id).unwrap().mark_closed();
        assert_eq!(table.get(id).unwrap().state(), SessionState::Closed);
    }

    #[test]
    fn test_send_without_channel() {
        let mut table = SessionTable::new();
        let id = table.open("test", "admin", None);
        assert!(!table.get(id).unwrap().send("hi".into()));
    }

    #[test]
    fn test_send_with_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = SessionTable::new();
        let id = table.open("test", "admin", Some(tx));
        assert!(table.get(id).unwrap().send("hi".into()));
        assert_eq!(rx.try_recv().unwrap(), "hi");
    }
}
