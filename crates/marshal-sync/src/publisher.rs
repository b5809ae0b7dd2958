//! Subscriber sessions and diff fan-out.
//!
//! Each session owns an unbounded queue, so a slow observer never stalls
//! the writer. A session whose receiver has been dropped is treated as
//! disconnected and pruned on the next delivery.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{Diff, Snapshot, StateStore, Topic};

/// Identifier of a subscriber session.
pub type SessionId = u64;

/// A registered observer: the snapshot it starts from and the stream of
/// diffs that follow it.
#[derive(Debug)]
pub struct Subscription {
    pub session: SessionId,
    pub topic: Topic,
    pub snapshot: Snapshot,
    pub updates: mpsc::UnboundedReceiver<Diff>,
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    /// Version of the last diff queued for this session.
    cursor: u64,
    tx: mpsc::UnboundedSender<Diff>,
}

/// Manages subscriber sessions for every topic.
#[derive(Debug, Default)]
pub struct Publisher {
    sessions: HashMap<Topic, Vec<Session>>,
    next_session: SessionId,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session on `topic`, starting from the store's current
    /// snapshot. The first diff the session receives is `version + 1`.
    pub fn subscribe(&mut self, store: &StateStore, topic: Topic) -> Subscription {
        let snapshot = store.snapshot(topic);
        let (tx, updates) = mpsc::unbounded_channel();

        self.next_session += 1;
        let session = self.next_session;
        self.sessions.entry(topic).or_default().push(Session {
            id: session,
            cursor: snapshot.version,
            tx,
        });
        debug!(topic = %topic, session, version = snapshot.version, "subscriber registered");

        Subscription {
            session,
            topic,
            snapshot,
            updates,
        }
    }

    /// Deregister a session. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, topic: Topic, session: SessionId) -> bool {
        let Some(sessions) = self.sessions.get_mut(&topic) else {
            return false;
        };
        let before = sessions.len();
        sessions.retain(|s| s.id != session);
        let removed = sessions.len() != before;
        if removed {
            debug!(topic = %topic, session, "subscriber removed");
        }
        removed
    }

    /// Queue `diffs` for every session on `topic`, dropping disconnected ones.
    pub fn publish(&mut self, topic: Topic, diffs: &[Diff]) {
        if diffs.is_empty() {
            return;
        }
        let Some(sessions) = self.sessions.get_mut(&topic) else {
            return;
        };

        sessions.retain_mut(|session| {
            for diff in diffs {
                assert_eq!(
                    diff.version,
                    session.cursor + 1,
                    "diff stream for topic {topic} out of order"
                );
                if session.tx.send(diff.clone()).is_err() {
                    debug!(topic = %topic, session = session.id, "subscriber disconnected");
                    return false;
                }
                session.cursor = diff.version;
            }
            trace!(topic = %topic, session = session.id, cursor = session.cursor, "diffs queued");
            true
        });
    }

    /// Number of live sessions on `topic`.
    pub fn session_count(&self, topic: Topic) -> usize {
        self.sessions.get(&topic).map_or(0, Vec::len)
    }
}
