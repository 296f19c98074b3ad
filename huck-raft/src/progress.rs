use std::collections::HashMap;

use uuid::Uuid;

use crate::raft::{LogIndex, MemberId};

/// How many consecutive failures are logged individually before the
/// appender throttles down to every hundredth.
const LOGGED_FAILURES: u64 = 3;

/// Leader-side replication bookkeeping for every other member.
#[derive(Debug, Clone)]
pub struct ReplicationProgress {
    progress: HashMap<MemberId, NodeProgress>,
}

impl ReplicationProgress {
    pub fn new(members: impl IntoIterator<Item = MemberId>, last_index: LogIndex) -> Self {
        let progress = members
            .into_iter()
            .map(|id| (id, NodeProgress::new(id, last_index)))
            .collect();
        ReplicationProgress { progress }
    }

    pub fn get(&self, id: MemberId) -> Option<&NodeProgress> {
        self.progress.get(&id)
    }

    pub fn get_mut(&mut self, id: MemberId) -> Option<&mut NodeProgress> {
        self.progress.get_mut(&id)
    }

    /// Track a member that joined after this leader took over.
    pub fn insert(&mut self, id: MemberId, last_index: LogIndex) {
        self.progress
            .entry(id)
            .or_insert_with(|| NodeProgress::new(id, last_index));
    }

    pub fn remove(&mut self, id: MemberId) {
        self.progress.remove(&id);
    }

    /// Drop members that are no longer part of the configuration.
    pub fn retain(&mut self, keep: impl Fn(MemberId) -> bool) {
        self.progress.retain(|id, _| keep(*id));
    }

    /// The highest index replicated on a majority of `voters`, counting the
    /// leader's own log at `leader_index`. Returns 0 when no quorum exists.
    pub fn committed_index(&self, voters: &[MemberId], leader: MemberId, leader_index: LogIndex) -> LogIndex {
        let mut matched: Vec<LogIndex> = voters
            .iter()
            .map(|id| {
                if *id == leader {
                    leader_index
                } else {
                    self.get(*id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return 0;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = voters.len() / 2 + 1;
        matched[quorum - 1]
    }
}

/// Replication state for a single member.
#[derive(Debug, Clone)]
pub struct NodeProgress {
    pub id: MemberId,
    /// Highest index known to be replicated on the member.
    pub match_index: LogIndex,
    /// Next index the leader will attempt to send.
    pub next_index: LogIndex,
    /// Requests outstanding to this member.
    pub inflight: usize,
    /// Consecutive request failures since the last success.
    pub failures: u64,
    /// Snapshot transfer cursor, set while an install is in progress.
    pub next_snapshot_id: Option<Uuid>,
    pub next_snapshot_index: LogIndex,
    pub next_snapshot_offset: u64,
}

impl NodeProgress {
    pub fn new(id: MemberId, last_index: LogIndex) -> NodeProgress {
        NodeProgress {
            id,
            match_index: 0,
            next_index: last_index + 1,
            inflight: 0,
            failures: 0,
            next_snapshot_id: None,
            next_snapshot_index: 0,
            next_snapshot_offset: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.failures == 0
    }

    /// Record a successful append acknowledged through `last_index`.
    pub fn succeed(&mut self, last_index: LogIndex) {
        self.failures = 0;
        if last_index > self.match_index {
            self.match_index = last_index;
        }
        if self.match_index + 1 > self.next_index {
            self.next_index = self.match_index + 1;
        }
    }

    /// Accept the follower-supplied match hint after a log mismatch.
    pub fn hint(&mut self, last_index: LogIndex) {
        self.match_index = last_index;
        self.next_index = last_index + 1;
    }

    /// Record a request failure. Returns true if this failure should be
    /// logged (the first few are, then every hundredth).
    pub fn fail(&mut self) -> bool {
        self.failures += 1;
        self.failures <= LOGGED_FAILURES || self.failures % 100 == 0
    }

    /// Begin (or continue) a snapshot transfer.
    pub fn snapshot_cursor(&mut self, id: Uuid, index: LogIndex) -> u64 {
        if self.next_snapshot_id != Some(id) || self.next_snapshot_index != index {
            self.next_snapshot_id = Some(id);
            self.next_snapshot_index = index;
            self.next_snapshot_offset = 0;
        }
        self.next_snapshot_offset
    }

    pub fn advance_snapshot(&mut self, bytes: u64) {
        self.next_snapshot_offset += bytes;
    }

    /// A failed install restarts from offset zero.
    pub fn reset_snapshot(&mut self) {
        self.next_snapshot_id = None;
        self.next_snapshot_index = 0;
        self.next_snapshot_offset = 0;
    }

    /// The transfer finished; resume appends after the snapshot.
    pub fn finish_snapshot(&mut self) {
        let index = self.next_snapshot_index;
        self.reset_snapshot();
        self.succeed(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_advances_match_and_next() {
        let mut progress = NodeProgress::new(2, 10);
        assert_eq!(progress.next_index, 11);
        progress.succeed(15);
        assert_eq!(progress.match_index, 15);
        assert_eq!(progress.next_index, 16);
    }

    #[test]
    fn hint_rewinds_next_index() {
        let mut progress = NodeProgress::new(2, 100);
        progress.hint(40);
        assert_eq!(progress.match_index, 40);
        assert_eq!(progress.next_index, 41);
    }

    #[test]
    fn failure_logging_is_throttled() {
        let mut progress = NodeProgress::new(2, 0);
        assert!(progress.fail());
        assert!(progress.fail());
        assert!(progress.fail());
        for _ in 0..96 {
            assert!(!progress.fail());
        }
        // the 100th failure
        assert!(progress.fail());
        progress.succeed(1);
        assert!(progress.is_available());
        assert!(progress.fail());
    }

    #[test]
    fn snapshot_cursor_restarts_for_new_snapshot() {
        let mut progress = NodeProgress::new(2, 0);
        let a = Uuid::new_v4();
        assert_eq!(progress.snapshot_cursor(a, 100), 0);
        progress.advance_snapshot(4096);
        assert_eq!(progress.snapshot_cursor(a, 100), 4096);

        let b = Uuid::new_v4();
        assert_eq!(progress.snapshot_cursor(b, 200), 0);
    }

    #[test]
    fn finished_snapshot_resumes_appends() {
        let mut progress = NodeProgress::new(2, 0);
        progress.snapshot_cursor(Uuid::new_v4(), 100);
        progress.finish_snapshot();
        assert_eq!(progress.match_index, 100);
        assert_eq!(progress.next_index, 101);
        assert!(progress.next_snapshot_id.is_none());
    }

    #[test]
    fn committed_index_is_the_quorum_median() {
        let voters = vec![1, 2, 3];
        let mut progress = ReplicationProgress::new(vec![2, 3], 10);
        progress.get_mut(2).unwrap().succeed(8);
        progress.get_mut(3).unwrap().succeed(4);
        // leader at 10, members at 8 and 4: quorum of 2 has replicated 8
        assert_eq!(progress.committed_index(&voters, 1, 10), 8);
    }

    #[test]
    fn committed_index_with_lagging_majority() {
        let voters = vec![1, 2, 3, 4, 5];
        let progress = ReplicationProgress::new(vec![2, 3, 4, 5], 10);
        // nobody has acked anything yet
        assert_eq!(progress.committed_index(&voters, 1, 10), 0);
    }
}
