//! Per-agent pending state: the most recent unprocessed heartbeat per agent,
//! plus the bounded work queue the Reconciliation Worker drains.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use super::types::AgentId;

/// Per-agent record holding the most recent heartbeat payload, whether it
/// has been enqueued but not yet processed, and the keep-alive file path.
#[derive(Debug, Clone, Default)]
pub struct PendingEntry {
    pub message: String,
    pub changed: bool,
    pub keep_alive_path: Option<PathBuf>,
}

/// Result of [`PendingState::note_heartbeat`] — lets callers (and tests)
/// assert on the decision without re-deriving it from booleans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The entry already had this exact message pending; no enqueue.
    Duplicate,
    /// The entry's message was updated. `enqueued` is false when the queue
    /// was full — the message is retained but `changed` is not set.
    Updated { enqueued: bool },
}

/// Fixed-capacity ring buffer of agent identifiers.
///
/// Invariant: an agent identifier appears at most once in the queue at any
/// time, enforced by [`PendingState`] only ever pushing an identifier
/// while its `PendingEntry.changed` is false.
#[derive(Debug)]
struct RingBuffer {
    slots: Vec<Option<AgentId>>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, id: AgentId) -> bool {
        if self.is_full() {
            return false;
        }
        let tail = (self.head + self.len) % self.capacity();
        self.slots[tail] = Some(id);
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<AgentId> {
        if self.is_empty() {
            return None;
        }
        let id = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        id
    }
}

/// The pending map plus the work queue, guarded together by one mutex and
/// paired with one condition variable.
pub struct PendingState {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

struct Inner {
    map: HashMap<AgentId, PendingEntry>,
    queue: RingBuffer,
}

impl PendingState {
    /// `max_agents` bounds the queue's fixed capacity.
    pub fn new(max_agents: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                queue: RingBuffer::new(max_agents),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Record a heartbeat for `agent`, implementing the dedup/enqueue
    /// decision table:
    ///
    /// - existing entry, `changed == true`, byte-equal message → duplicate,
    ///   no enqueue (caller touches the keep-alive file's mtime instead).
    /// - otherwise, replace the message; if `changed` was false, attempt to
    ///   enqueue. A full queue leaves `changed` false.
    pub fn note_heartbeat(&self, agent: &AgentId, message: &str) -> HeartbeatOutcome {
        let mut inner = self.inner.lock().expect("pending state mutex poisoned");

        if let Some(entry) = inner.map.get(agent) {
            if entry.changed && entry.message == message {
                return HeartbeatOutcome::Duplicate;
            }
        }

        let entry = inner.map.entry(agent.clone()).or_default();
        entry.message = message.to_owned();

        let enqueued = if !entry.changed {
            let queued = inner.queue.push(agent.clone());
            if queued {
                inner.map.get_mut(agent).unwrap().changed = true;
            }
            queued
        } else {
            // Already enqueued from a prior distinct heartbeat; the new
            // message will be picked up when that entry is drained.
            true
        };

        if enqueued {
            self.condvar.notify_one();
        }

        HeartbeatOutcome::Updated { enqueued }
    }

    /// Record (or fetch) the keep-alive file path for `agent`, deriving and
    /// storing it via `derive` on first contact.
    pub fn keep_alive_path(
        &self,
        agent: &AgentId,
        derive: impl FnOnce() -> PathBuf,
    ) -> PathBuf {
        let mut inner = self.inner.lock().expect("pending state mutex poisoned");
        let entry = inner.map.entry(agent.clone()).or_default();
        if entry.keep_alive_path.is_none() {
            entry.keep_alive_path = Some(derive());
        }
        entry.keep_alive_path.clone().unwrap()
    }

    /// Block until the queue is non-empty, then pop one agent identifier
    /// and copy out its pending message, clearing `changed` before the
    /// caller processes it outside the lock.
    pub fn drain_one(&self) -> (AgentId, String) {
        let mut inner = self.inner.lock().expect("pending state mutex poisoned");
        loop {
            if let Some(id) = inner.queue.pop() {
                let message = inner
                    .map
                    .get_mut(&id)
                    .map(|entry| {
                        entry.changed = false;
                        entry.message.clone()
                    })
                    .unwrap_or_default();
                return (id, message);
            }
            inner = self
                .condvar
                .wait(inner)
                .expect("pending state condvar poisoned");
        }
    }

    /// Non-blocking variant of [`Self::drain_one`], used by tests and by
    /// shutdown paths that must not block forever.
    pub fn try_drain_one(&self) -> Option<(AgentId, String)> {
        let mut inner = self.inner.lock().expect("pending state mutex poisoned");
        let id = inner.queue.pop()?;
        let message = inner
            .map
            .get_mut(&id)
            .map(|entry| {
                entry.changed = false;
                entry.message.clone()
            })
            .unwrap_or_default();
        Some((id, message))
    }

    /// Number of identifiers currently queued (for `agentd status`).
    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("pending state mutex poisoned").queue.len
    }

    /// Number of distinct agents ever seen (for `agentd status`).
    pub fn agent_count(&self) -> usize {
        self.inner.lock().expect("pending state mutex poisoned").map.len()
    }

    /// Count of times `agent` currently appears in the queue. Used only by
    /// tests verifying queue uniqueness — real code never needs this.
    #[cfg(test)]
    fn queue_count(&self, agent: &AgentId) -> usize {
        let inner = self.inner.lock().unwrap();
        let cap = inner.queue.capacity();
        (0..inner.queue.len)
            .filter(|i| {
                let idx = (inner.queue.head + i) % cap;
                inner.queue.slots[idx].as_ref() == Some(agent)
            })
            .count()
    }

    #[cfg(test)]
    fn changed_flag(&self, agent: &AgentId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .map
            .get(agent)
            .map(|e| e.changed)
            .unwrap_or(false)
    }
}
