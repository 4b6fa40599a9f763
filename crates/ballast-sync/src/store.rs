//! Session store
//!
//! Per-session bounded note queues with the desync-collapse rule: a new
//! session's queue starts with exactly one desync marker, and a queue
//! that overflows before the follower drains it is replaced by a single
//! desync tombstone, forcing a full refetch. Sequence numbers only ever
//! advance, so a poll's `since` acknowledges everything before it.

use ballast_core::SyncNote;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SequencedNote;

struct Session {
    queue: Vec<SequencedNote>,
    next_seq: u64,
    last_poll: Instant,
}

impl Session {
    fn new() -> Self {
        let mut session = Self {
            queue: Vec::new(),
            next_seq: 0,
            last_poll: Instant::now(),
        };
        // A fresh session must not trust anything it held before.
        session.push_unchecked(SyncNote::Desync);
        session
    }

    fn push_unchecked(&mut self, note: SyncNote) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(SequencedNote { seq, note });
    }

    fn push(&mut self, note: SyncNote, limit: usize) {
        if self.queue.len() >= limit {
            // Overflow: replace the unread tail with one tombstone.
            warn!("Session queue overflow, collapsing to desync");
            self.queue.clear();
            self.push_unchecked(SyncNote::Desync);
            return;
        }
        self.push_unchecked(note);
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub notes: Vec<SequencedNote>,
    pub next: u64,
}

pub struct SessionStore {
    sessions: HashMap<Uuid, Session>,
    queue_limit: usize,
}

impl SessionStore {
    pub fn new(queue_limit: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            queue_limit,
        }
    }

    /// Broadcast a note into every session queue.
    pub fn push(&mut self, note: SyncNote) {
        for session in self.sessions.values_mut() {
            session.push(note.clone(), self.queue_limit);
        }
    }

    /// Serve one poll. `since` acknowledges previously delivered notes;
    /// the rest of the queue (up to the queue limit) is returned.
    pub fn poll(&mut self, id: Uuid, since: u64) -> PollOutcome {
        let session = self.sessions.entry(id).or_insert_with(|| {
            info!(session = %id, "New sync session");
            Session::new()
        });
        session.last_poll = Instant::now();
        session.queue.retain(|entry| entry.seq >= since);
        let notes = std::mem::take(&mut session.queue);
        PollOutcome {
            notes,
            next: session.next_seq,
        }
    }

    /// True when any session has notes waiting.
    pub fn has_pending(&self, id: Uuid) -> bool {
        self.sessions
            .get(&id)
            .map(|s| !s.queue.is_empty())
            .unwrap_or(false)
    }

    /// Drop sessions that have not polled within `deadtime`.
    pub fn reap(&mut self, deadtime: Duration) {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_poll.elapsed() < deadtime);
        let reaped = before - self.sessions.len();
        if reaped > 0 {
            debug!(reaped, "Reaped dead sync sessions");
        }
    }

    /// Drop every session; used when this node stops leading.
    pub fn clear(&mut self) {
        if !self.sessions.is_empty() {
            info!(sessions = self.sessions.len(), "Dropping all sync sessions");
        }
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
