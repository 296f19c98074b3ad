use std::collections::VecDeque;

use huck_core::error::{Error, Result};

use crate::raft::{Entry, LogIndex, Term};

/// Persistence contract for the replicated log. Entries are densely
/// numbered; the store never sees gaps.
pub trait LogStore: Send {
    fn append(&mut self, entry: Entry) -> Result<()>;
    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;
    /// Remove all entries with index >= `from`.
    fn truncate(&mut self, from: LogIndex) -> Result<()>;
    /// Remove all entries with index <= `through`.
    fn compact(&mut self, through: LogIndex) -> Result<()>;
    fn first_index(&self) -> LogIndex;
    fn last_index(&self) -> LogIndex;
}

/// In-memory log store, used for tests and for servers that rebuild state
/// from snapshots and peers on restart.
pub struct MemoryLog {
    entries: VecDeque<Entry>,
    first: LogIndex,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog {
            entries: VecDeque::new(),
            first: 1,
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, entry: Entry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(Error::ProtocolError(format!(
                "append out of order: expected {}, got {}",
                self.last_index() + 1,
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        if index < self.first || index > self.last_index() {
            return Ok(None);
        }
        Ok(self.entries.get((index - self.first) as usize).cloned())
    }

    fn truncate(&mut self, from: LogIndex) -> Result<()> {
        while self.last_index() >= from && !self.entries.is_empty() {
            self.entries.pop_back();
        }
        Ok(())
    }

    fn compact(&mut self, through: LogIndex) -> Result<()> {
        while self
            .entries
            .front()
            .map(|e| e.index <= through)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        if through >= self.first {
            self.first = through + 1;
        }
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        self.first
    }

    fn last_index(&self) -> LogIndex {
        self.first + self.entries.len() as LogIndex - 1
    }
}

/// Outcome of a follower-side append.
#[derive(Debug, PartialEq)]
pub enum AppendOutcome {
    Appended { last_index: LogIndex },
    /// The (prev_index, prev_term) check failed; `hint` is this log's last
    /// index, which the leader uses to rewind.
    Mismatch { hint: LogIndex },
}

/// The replicated log. Wraps a store with the consistency rules: the
/// match check, conflict truncation bounded by the commit index, and the
/// snapshot boundary left behind by compaction.
pub struct Log {
    store: Box<dyn LogStore>,
    /// Index and term of the entry immediately preceding `first_index`,
    /// i.e. the snapshot boundary. (0, 0) for a log compacted never.
    prefix: (LogIndex, Term),
    commit_index: LogIndex,
}

impl Log {
    pub fn new(store: Box<dyn LogStore>) -> Log {
        Log {
            store,
            prefix: (0, 0),
            commit_index: 0,
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.store.first_index()
    }

    pub fn last_index(&self) -> LogIndex {
        self.store.last_index()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_term(&self) -> Term {
        if self.store.last_index() <= self.prefix.0 {
            return self.prefix.1;
        }
        match self.store.get(self.store.last_index()) {
            Ok(Some(entry)) => entry.term,
            _ => self.prefix.1,
        }
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.store.get(index)
    }

    /// The term recorded at `index`, if this log still knows it. Index 0
    /// and the snapshot boundary resolve without an entry.
    pub fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.prefix.0 {
            return Ok(Some(self.prefix.1));
        }
        Ok(self.store.get(index)?.map(|e| e.term))
    }

    /// Leader-side append: assign the next index and write the entry.
    pub fn append(&mut self, mut entry: Entry) -> Result<Entry> {
        entry.index = self.last_index() + 1;
        self.store.append(entry.clone())?;
        Ok(entry)
    }

    /// Follower-side append with the log-matching check. Conflicting
    /// uncommitted suffixes are truncated; touching a committed entry is a
    /// protocol violation.
    pub fn try_append(
        &mut self,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<Entry>,
    ) -> Result<AppendOutcome> {
        match self.term_at(prev_index)? {
            Some(term) if term == prev_term => {}
            _ => {
                return Ok(AppendOutcome::Mismatch {
                    hint: self.last_index(),
                })
            }
        }

        for entry in entries {
            if entry.index <= self.prefix.0 {
                continue;
            }
            match self.term_at(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(Error::ProtocolError(format!(
                            "entry {} conflicts with a committed entry",
                            entry.index
                        )));
                    }
                    self.store.truncate(entry.index)?;
                    self.store.append(entry)?;
                }
                None => {
                    self.store.append(entry)?;
                }
            }
        }

        Ok(AppendOutcome::Appended {
            last_index: self.last_index(),
        })
    }

    /// Read a batch for replication starting at `from`, bounded by
    /// `max_bytes` of serialized entries; the first entry is always
    /// included so an oversized entry still makes progress. Returns
    /// `None` when `from` has been compacted away and the follower needs a
    /// snapshot instead.
    pub fn batch(
        &self,
        from: LogIndex,
        max_bytes: u64,
    ) -> Result<Option<(LogIndex, Term, Vec<Entry>)>> {
        if from <= self.prefix.0 || from < self.first_index() {
            return Ok(None);
        }
        let prev_index = from - 1;
        let prev_term = match self.term_at(prev_index)? {
            Some(term) => term,
            None => return Ok(None),
        };

        let mut entries = Vec::new();
        let mut bytes = 0u64;
        let mut index = from;
        while index <= self.last_index() {
            let entry = match self.store.get(index)? {
                Some(entry) => entry,
                None => break,
            };
            let size = bincode::serialized_size(&entry)?;
            if !entries.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            entries.push(entry);
            index += 1;
            if bytes >= max_bytes {
                break;
            }
        }
        Ok(Some((prev_index, prev_term, entries)))
    }

    /// Advance the durable commit marker. Monotone, clamped to the last
    /// index.
    pub fn commit(&mut self, index: LogIndex) {
        let index = index.min(self.last_index());
        if index > self.commit_index {
            self.commit_index = index;
        }
    }

    /// Drop the prefix covered by a snapshot at (`through`, `term`).
    pub fn compact(&mut self, through: LogIndex, term: Term) -> Result<()> {
        if through <= self.prefix.0 {
            return Ok(());
        }
        self.store.compact(through)?;
        self.prefix = (through, term);
        if self.commit_index < through {
            self.commit_index = through;
        }
        Ok(())
    }

    /// Whether a candidate whose log ends at (`last_index`, `last_term`)
    /// is at least as up-to-date as this log.
    pub fn up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryKind;

    fn entry(index: LogIndex, term: Term) -> Entry {
        Entry {
            index,
            term,
            time: 0,
            kind: EntryKind::Initialize,
        }
    }

    fn log_with(entries: Vec<Entry>) -> Log {
        let mut log = Log::new(Box::new(MemoryLog::new()));
        for e in entries {
            log.append(e).unwrap();
        }
        log
    }

    #[test]
    fn append_assigns_dense_indices() {
        let log = log_with(vec![entry(0, 1), entry(0, 1), entry(0, 2)]);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn try_append_rejects_mismatched_prev() {
        let mut log = log_with(vec![entry(0, 1), entry(0, 1)]);
        let outcome = log.try_append(5, 1, vec![entry(6, 1)]).unwrap();
        assert_eq!(outcome, AppendOutcome::Mismatch { hint: 2 });
    }

    #[test]
    fn try_append_truncates_conflicting_suffix() {
        let mut log = log_with(vec![entry(0, 1), entry(0, 1), entry(0, 1)]);
        // a new leader in term 2 replaces entries 2..3
        let outcome = log
            .try_append(1, 1, vec![entry(2, 2), entry(3, 2)])
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { last_index: 3 });
        assert_eq!(log.get(2).unwrap().unwrap().term, 2);
        assert_eq!(log.get(3).unwrap().unwrap().term, 2);
    }

    #[test]
    fn try_append_is_idempotent_for_duplicates() {
        let mut log = log_with(vec![entry(0, 1), entry(0, 1)]);
        let outcome = log.try_append(1, 1, vec![entry(2, 1)]).unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { last_index: 2 });
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn committed_entries_are_never_replaced() {
        let mut log = log_with(vec![entry(0, 1), entry(0, 1)]);
        log.commit(2);
        let result = log.try_append(1, 1, vec![entry(2, 3)]);
        assert!(result.is_err());
    }

    #[test]
    fn compaction_leaves_a_boundary() {
        let mut log = log_with(vec![entry(0, 1), entry(0, 1), entry(0, 2)]);
        log.commit(3);
        log.compact(2, 1).unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2).unwrap(), Some(1));
        assert_eq!(log.term_at(1).unwrap(), None);

        // the boundary still satisfies the match check
        let outcome = log.try_append(3, 2, vec![entry(4, 2)]).unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { last_index: 4 });
    }

    #[test]
    fn batch_is_bounded_by_bytes_but_never_empty() {
        let mut log = Log::new(Box::new(MemoryLog::new()));
        for _ in 0..10 {
            log.append(Entry {
                index: 0,
                term: 1,
                time: 0,
                kind: EntryKind::Command {
                    session: 1,
                    sequence: 1,
                    ack_sequence: 0,
                    payload: vec![0u8; 128],
                },
            })
            .unwrap();
        }
        let (prev_index, prev_term, entries) = log.batch(1, 1).unwrap().unwrap();
        assert_eq!((prev_index, prev_term), (0, 0));
        assert_eq!(entries.len(), 1);

        let (_, _, entries) = log.batch(1, u64::MAX).unwrap().unwrap();
        assert_eq!(entries.len(), 10);
    }

    #[test]
    fn batch_reports_compacted_range() {
        let mut log = log_with(vec![entry(0, 1), entry(0, 1), entry(0, 1)]);
        log.commit(3);
        log.compact(2, 1).unwrap();
        assert!(log.batch(1, u64::MAX).unwrap().is_none());
        assert!(log.batch(3, u64::MAX).unwrap().is_some());
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log_with(vec![entry(0, 1), entry(0, 2)]);
        assert!(log.up_to_date(2, 2));
        assert!(log.up_to_date(5, 2));
        assert!(log.up_to_date(1, 3));
        assert!(!log.up_to_date(1, 2));
        assert!(!log.up_to_date(9, 1));
    }
}
