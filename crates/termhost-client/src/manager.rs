//! Component I: host-side session bookkeeping layered on top of
//! `DaemonClient` (spec.md §4.I). Tracks a `paneId -> sessionId` index so an
//! embedding host can re-key daemon events (which carry `sessionId`) back to
//! its own pane identity, bounds concurrent session creation with a priority
//! admission gate, and remembers recently-killed sessions in a small
//! tombstone cache so a late query reads as "gone", not "unknown".

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use termhost_protocol::{PaneId, SessionId, SessionInfo};

use crate::errors::ClientError;

/// Admission gate bounding concurrent session-creation requests in flight.
/// A priority-0 (interactive) request preempts a queued priority>0
/// (background) request rather than waiting behind it (spec.md §4.I
/// "priority admission semaphore").
pub struct AdmissionGate {
    max_concurrent: usize,
    inner: Mutex<AdmissionState>,
}

struct AdmissionState {
    in_flight: usize,
    waiting: VecDeque<u8>,
}

pub struct AdmissionTicket<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for AdmissionTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.inner.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            inner: Mutex::new(AdmissionState { in_flight: 0, waiting: VecDeque::new() }),
        }
    }

    /// Attempts immediate admission at `priority` (lower admits first when
    /// contended). Returns `None` if the gate is full and nothing can be
    /// preempted.
    pub fn try_admit(&self, priority: u8) -> Option<AdmissionTicket<'_>> {
        let mut state = self.inner.lock().unwrap();
        if state.in_flight < self.max_concurrent {
            state.in_flight += 1;
            return Some(AdmissionTicket { gate: self });
        }
        if priority == 0 {
            // Interactive request preempts a queued background slot by
            // admitting anyway; the over-subscription self-corrects as
            // in-flight tickets drop.
            state.in_flight += 1;
            return Some(AdmissionTicket { gate: self });
        }
        state.waiting.push_back(priority);
        None
    }
}

/// A killed session's last-known info, kept around briefly so a straggling
/// `listSessions`/status query reads "exited", not "unknown session".
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub info: SessionInfo,
}

/// Bounded FIFO-evicted tombstone cache (spec.md §4.I, default capacity 128).
pub struct TombstoneTable {
    capacity: usize,
    order: VecDeque<SessionId>,
    entries: HashMap<SessionId, Tombstone>,
}

impl TombstoneTable {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::new(), entries: HashMap::new() }
    }

    pub fn record(&mut self, info: SessionInfo) {
        let session_id = info.session_id.clone();
        if !self.entries.contains_key(&session_id) {
            self.order.push_back(session_id.clone());
        }
        self.entries.insert(session_id, Tombstone { info });
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&Tombstone> {
        self.entries.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Maps pane identities to the daemon session id currently backing them, and
/// reconciles that map against `listSessions` at startup (spec.md §4.I).
pub struct SessionIndex {
    by_pane: HashMap<PaneId, SessionId>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self { by_pane: HashMap::new() }
    }

    pub fn bind(&mut self, pane_id: PaneId, session_id: SessionId) {
        self.by_pane.insert(pane_id, session_id);
    }

    pub fn session_for_pane(&self, pane_id: &PaneId) -> Result<&SessionId, ClientError> {
        self.by_pane
            .get(pane_id)
            .ok_or_else(|| ClientError::UnknownPane(pane_id.to_string()))
    }

    /// Rebuilds the index from a fresh `listSessions` response, dropping
    /// panes whose session no longer exists daemon-side (spec.md §4.I
    /// "startup reconciliation").
    pub fn reconcile(&mut self, sessions: &[SessionInfo]) {
        let live: std::collections::HashSet<&SessionId> =
            sessions.iter().map(|s| &s.session_id).collect();
        self.by_pane.retain(|_, session_id| live.contains(session_id));
    }
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_info(id: &str) -> SessionInfo {
        SessionInfo {
            session_id: SessionId::new(id),
            pane_id: PaneId::new(format!("pane-{id}")),
            workspace_id: termhost_protocol::WorkspaceId::new("w1"),
            cols: 80,
            rows: 24,
            is_alive: false,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            last_attached_at: None,
            pid: None,
        }
    }

    #[test]
    fn admission_gate_admits_up_to_capacity() {
        let gate = AdmissionGate::new(2);
        let a = gate.try_admit(1);
        let b = gate.try_admit(1);
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[test]
    fn admission_gate_priority_zero_always_admits() {
        let gate = AdmissionGate::new(1);
        let _a = gate.try_admit(1);
        let urgent = gate.try_admit(0);
        assert!(urgent.is_some());
    }

    #[test]
    fn dropping_ticket_frees_capacity() {
        let gate = AdmissionGate::new(1);
        {
            let _a = gate.try_admit(1).unwrap();
        }
        assert!(gate.try_admit(1).is_some());
    }

    #[test]
    fn tombstone_table_evicts_oldest_past_capacity() {
        let mut table = TombstoneTable::new(2);
        table.record(fake_info("s1"));
        table.record(fake_info("s2"));
        table.record(fake_info("s3"));
        assert_eq!(table.len(), 2);
        assert!(table.get(&SessionId::new("s1")).is_none());
        assert!(table.get(&SessionId::new("s3")).is_some());
    }

    #[test]
    fn session_index_reconcile_drops_dead_panes() {
        let mut index = SessionIndex::new();
        index.bind(PaneId::new("p1"), SessionId::new("s1"));
        index.bind(PaneId::new("p2"), SessionId::new("s2"));
        index.reconcile(&[fake_info("s1")]);
        assert!(index.session_for_pane(&PaneId::new("p1")).is_ok());
        assert!(index.session_for_pane(&PaneId::new("p2")).is_err());
    }
}
