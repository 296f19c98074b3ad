use uuid::Uuid;

use huck_core::error::{Error, Result};

use crate::raft::{LogIndex, Term};

/// A committed snapshot of the state machine at (`index`, `term`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub index: LogIndex,
    pub term: Term,
    pub data: Vec<u8>,
}

/// Store contract for snapshots. Writers are append-only: bytes arrive at
/// a declared offset and `commit` makes the snapshot visible atomically,
/// superseding any earlier one. At most one snapshot is under construction
/// at a time; starting a new one aborts the previous.
pub trait SnapshotStore: Send {
    /// Open a writer for a snapshot at (`index`, `term`).
    fn create(&mut self, id: Uuid, index: LogIndex, term: Term) -> Result<()>;
    /// Append `data` at `offset`. The offset must equal the bytes written
    /// so far.
    fn write(&mut self, id: Uuid, offset: u64, data: &[u8]) -> Result<()>;
    /// Commit the pending snapshot and return it.
    fn commit(&mut self, id: Uuid) -> Result<Snapshot>;
    /// Discard the pending snapshot, if any.
    fn abort(&mut self);
    /// The newest committed snapshot.
    fn current(&self) -> Option<&Snapshot>;
    /// Whether the pending writer matches (`id`, `index`).
    fn is_pending(&self, id: Uuid, index: LogIndex) -> bool;
}

struct PendingSnapshot {
    id: Uuid,
    index: LogIndex,
    term: Term,
    data: Vec<u8>,
}

/// In-memory snapshot store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    pending: Option<PendingSnapshot>,
    current: Option<Snapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn create(&mut self, id: Uuid, index: LogIndex, term: Term) -> Result<()> {
        self.pending = Some(PendingSnapshot {
            id,
            index,
            term,
            data: Vec::new(),
        });
        Ok(())
    }

    fn write(&mut self, id: Uuid, offset: u64, data: &[u8]) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .filter(|p| p.id == id)
            .ok_or_else(|| Error::ProtocolError(format!("no pending snapshot {}", id)))?;
        if pending.data.len() as u64 != offset {
            return Err(Error::ProtocolError(format!(
                "snapshot {} write at offset {}, expected {}",
                id,
                offset,
                pending.data.len()
            )));
        }
        pending.data.extend_from_slice(data);
        Ok(())
    }

    fn commit(&mut self, id: Uuid) -> Result<Snapshot> {
        let pending = self
            .pending
            .take()
            .filter(|p| p.id == id)
            .ok_or_else(|| Error::ProtocolError(format!("no pending snapshot {}", id)))?;
        let snapshot = Snapshot {
            id: pending.id,
            index: pending.index,
            term: pending.term,
            data: pending.data,
        };
        // a snapshot only supersedes older state
        if self
            .current
            .as_ref()
            .map(|c| c.index < snapshot.index)
            .unwrap_or(true)
        {
            self.current = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    fn abort(&mut self) {
        self.pending = None;
    }

    fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    fn is_pending(&self, id: Uuid, index: LogIndex) -> bool {
        self.pending
            .as_ref()
            .map(|p| p.id == id && p.index == index)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_write_then_commit() {
        let mut store = MemorySnapshotStore::new();
        let id = Uuid::new_v4();
        store.create(id, 100, 3).unwrap();
        store.write(id, 0, b"hello ").unwrap();
        store.write(id, 6, b"world").unwrap();
        let snapshot = store.commit(id).unwrap();
        assert_eq!(snapshot.index, 100);
        assert_eq!(snapshot.data, b"hello world");
        assert_eq!(store.current().unwrap().id, id);
    }

    #[test]
    fn out_of_order_offset_is_rejected() {
        let mut store = MemorySnapshotStore::new();
        let id = Uuid::new_v4();
        store.create(id, 100, 3).unwrap();
        store.write(id, 0, b"abc").unwrap();
        assert!(store.write(id, 9, b"def").is_err());
    }

    #[test]
    fn newer_snapshot_supersedes_older() {
        let mut store = MemorySnapshotStore::new();
        let a = Uuid::new_v4();
        store.create(a, 100, 3).unwrap();
        store.commit(a).unwrap();

        let b = Uuid::new_v4();
        store.create(b, 200, 4).unwrap();
        store.commit(b).unwrap();
        assert_eq!(store.current().unwrap().index, 200);

        // a stale install does not roll the store back
        let c = Uuid::new_v4();
        store.create(c, 50, 2).unwrap();
        store.commit(c).unwrap();
        assert_eq!(store.current().unwrap().index, 200);
    }

    #[test]
    fn fresh_create_replaces_pending() {
        let mut store = MemorySnapshotStore::new();
        let a = Uuid::new_v4();
        store.create(a, 100, 3).unwrap();
        store.write(a, 0, b"partial").unwrap();

        let b = Uuid::new_v4();
        store.create(b, 100, 3).unwrap();
        assert!(store.is_pending(b, 100));
        assert!(!store.is_pending(a, 100));
        assert!(store.write(a, 7, b"more").is_err());
    }
}
