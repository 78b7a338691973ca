//! In-memory session table.
//!
//! The registry is a cache of runtime state: it is rebuilt by recovery after
//! an agent restart and never treated as authoritative across restarts.
//! Only invariant-preserving operations are exposed; in particular the
//! one-active-session-per-slot check happens under the write lock in
//! [`SessionRegistry::insert`].

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use hostmgr_session::{
    ServerId, SessionId, SessionSnapshot, SessionStats, SessionStatus, SlotId,
};
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub network_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
}

/// Background output reader owned by a running session.
pub struct ReaderHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

type Stdin = Box<dyn AsyncWrite + Send + Unpin>;

pub struct SessionEntry {
    pub id: SessionId,
    pub slot_id: SlotId,
    pub server_id: ServerId,
    pub container_name: String,
    pub network_name: String,
    state: Mutex<SessionState>,
    stdin: tokio::sync::Mutex<Option<Stdin>>,
    reader: Mutex<Option<ReaderHandle>>,
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("id", &self.id)
            .field("slot_id", &self.slot_id)
            .field("container_name", &self.container_name)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SessionEntry {
    pub fn new(
        id: SessionId,
        slot_id: SlotId,
        server_id: ServerId,
        container_name: String,
        network_name: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            slot_id,
            server_id,
            container_name,
            network_name,
            state: Mutex::new(SessionState::default()),
            stdin: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.state.lock().status = status;
    }

    /// Compare-and-set on the status. Returns false if `from` did not match.
    pub fn transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        let mut st = self.state.lock();
        if st.status != from {
            return false;
        }
        st.status = to;
        true
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.state.lock();
        SessionSnapshot {
            session_id: self.id,
            slot_id: self.slot_id,
            server_id: self.server_id,
            status: st.status,
            container_name: self.container_name.clone(),
            container_id: st.container_id.clone(),
            network_id: st.network_id.clone(),
            started_at: st.started_at,
            stopped_at: st.stopped_at,
            exit_code: st.exit_code,
        }
    }

    pub async fn set_stdin(&self, stdin: Stdin) {
        *self.stdin.lock().await = Some(stdin);
    }

    /// Dropping the writer closes the container's stdin half.
    pub async fn close_stdin(&self) {
        if let Some(mut w) = self.stdin.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }

    pub async fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let w = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "stdin is not attached")
        })?;
        w.write_all(data).await?;
        w.flush().await
    }

    pub fn set_reader(&self, handle: ReaderHandle) {
        *self.reader.lock() = Some(handle);
    }

    pub fn take_reader(&self) -> Option<ReaderHandle> {
        self.reader.lock().take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("session {0} is already registered")]
    Duplicate(SessionId),
    #[error("slot {slot} is occupied by session {session}")]
    SlotOccupied { slot: SlotId, session: SessionId },
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<SessionEntry>>,
    // Includes terminal sessions; filtered by status on read.
    by_slot: HashMap<SlotId, Vec<SessionId>>,
}

impl Inner {
    fn active_in_slot(&self, slot: SlotId) -> Option<&Arc<SessionEntry>> {
        self.by_slot
            .get(&slot)?
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .find(|e| e.status().is_active())
    }

    fn unlink(&mut self, entry: &SessionEntry) {
        if let Some(ids) = self.by_slot.get_mut(&entry.slot_id) {
            ids.retain(|id| *id != entry.id);
            if ids.is_empty() {
                self.by_slot.remove(&entry.slot_id);
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if the id is new and the slot has no active session.
    pub fn insert(&self, entry: Arc<SessionEntry>) -> Result<(), InsertError> {
        let mut inner = self.inner.write();
        if inner.sessions.contains_key(&entry.id) {
            return Err(InsertError::Duplicate(entry.id));
        }
        if let Some(active) = inner.active_in_slot(entry.slot_id) {
            return Err(InsertError::SlotOccupied {
                slot: entry.slot_id,
                session: active.id,
            });
        }
        inner
            .by_slot
            .entry(entry.slot_id)
            .or_default()
            .push(entry.id);
        inner.sessions.insert(entry.id, entry);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionEntry>> {
        self.inner.read().sessions.get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.read().sessions.contains_key(&id)
    }

    /// Remove only if the registered entry is this exact one.
    pub fn remove_entry(&self, entry: &Arc<SessionEntry>) -> bool {
        let mut inner = self.inner.write();
        match inner.sessions.get(&entry.id) {
            Some(current) if Arc::ptr_eq(current, entry) => {}
            _ => return false,
        }
        inner.sessions.remove(&entry.id);
        inner.unlink(entry);
        true
    }

    /// The active (non-terminal) session in a slot, if any.
    pub fn get_by_slot(&self, slot: SlotId) -> Option<Arc<SessionEntry>> {
        self.inner.read().active_in_slot(slot).cloned()
    }

    /// Crashed/stopped sessions still parked in a slot.
    pub fn terminal_in_slot(&self, slot: SlotId) -> Vec<Arc<SessionEntry>> {
        let inner = self.inner.read();
        inner
            .by_slot
            .get(&slot)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id))
                    .filter(|e| e.status().is_terminal())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_slot_ids(&self) -> HashSet<SlotId> {
        let inner = self.inner.read();
        inner
            .sessions
            .values()
            .filter(|e| e.status().is_active())
            .map(|e| e.slot_id)
            .collect()
    }

    pub fn active_session_ids(&self) -> Vec<SessionId> {
        let inner = self.inner.read();
        let mut ids: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|e| e.status().is_active())
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        let mut out: Vec<_> = self.inner.read().sessions.values().cloned().collect();
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.entries().iter().map(|e| e.snapshot()).collect()
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.read();
        let mut stats = SessionStats::default();
        for e in inner.sessions.values() {
            stats.record(e.status());
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, slot: i64) -> Arc<SessionEntry> {
        SessionEntry::new(
            SessionId(id),
            SlotId(slot),
            ServerId(1),
            format!("game-{slot}"),
            format!("net-{slot}-{id}"),
        )
    }

    #[test]
    fn second_active_session_in_slot_is_rejected() {
        let reg = SessionRegistry::new();
        reg.insert(entry(1, 100)).unwrap();
        let err = reg.insert(entry(2, 100)).unwrap_err();
        assert_eq!(
            err,
            InsertError::SlotOccupied {
                slot: SlotId(100),
                session: SessionId(1)
            }
        );
        assert!(reg.insert(entry(3, 101)).is_ok());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let reg = SessionRegistry::new();
        reg.insert(entry(1, 100)).unwrap();
        assert_eq!(
            reg.insert(entry(1, 200)).unwrap_err(),
            InsertError::Duplicate(SessionId(1))
        );
    }

    #[test]
    fn terminal_sessions_do_not_block_slot() {
        let reg = SessionRegistry::new();
        let crashed = entry(1, 100);
        reg.insert(crashed.clone()).unwrap();
        crashed.set_status(SessionStatus::Crashed);

        assert!(reg.get_by_slot(SlotId(100)).is_none());
        assert!(reg.active_slot_ids().is_empty());
        reg.insert(entry(2, 100)).unwrap();
        assert_eq!(reg.get_by_slot(SlotId(100)).unwrap().id, SessionId(2));
        assert_eq!(reg.terminal_in_slot(SlotId(100)).len(), 1);
    }

    #[test]
    fn remove_entry_is_compare_and_remove() {
        let reg = SessionRegistry::new();
        let first = entry(1, 100);
        reg.insert(first.clone()).unwrap();
        let impostor = entry(1, 100);
        assert!(!reg.remove_entry(&impostor));
        assert!(reg.remove_entry(&first));
        assert!(reg.get(SessionId(1)).is_none());
        assert!(reg.get_by_slot(SlotId(100)).is_none());
    }

    #[test]
    fn stats_and_listings() {
        let reg = SessionRegistry::new();
        let a = entry(1, 100);
        let b = entry(2, 101);
        let c = entry(3, 102);
        for e in [&a, &b, &c] {
            reg.insert(e.clone()).unwrap();
        }
        a.set_status(SessionStatus::Running);
        b.set_status(SessionStatus::Running);
        c.set_status(SessionStatus::Crashed);

        let stats = reg.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.crashed, 1);
        assert_eq!(reg.active_session_ids(), vec![SessionId(1), SessionId(2)]);
        assert_eq!(
            reg.active_slot_ids(),
            HashSet::from([SlotId(100), SlotId(101)])
        );
    }

    #[test]
    fn transition_is_compare_and_set() {
        let e = entry(1, 100);
        e.set_status(SessionStatus::Stopping);
        assert!(!e.transition(SessionStatus::Running, SessionStatus::Crashed));
        assert_eq!(e.status(), SessionStatus::Stopping);
        assert!(e.transition(SessionStatus::Stopping, SessionStatus::Stopped));
    }

    #[test]
    fn concurrent_inserts_admit_one_per_slot() {
        let reg = SessionRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.insert(entry(i, 100)).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn write_input_requires_attachment() {
        let e = entry(1, 100);
        let err = e.write_input(b"say hi\n").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);

        let (w, mut r) = tokio::io::duplex(64);
        e.set_stdin(Box::new(w)).await;
        e.write_input(b"say hi\n").await.unwrap();
        let mut buf = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut r, &mut buf).await.unwrap();
        assert_eq!(&buf, b"say hi\n");
    }
}
