use huck_core::error::Result;

use crate::cluster::{Member, MemberKind};
use crate::log::Log;
use crate::progress::NodeProgress;
use crate::raft::{LogIndex, MemberId, Term};
use crate::rpc::Command;
use crate::snapshot::SnapshotStore;

/// Build the next replication request for one member: a batch of entries
/// read from its next index, a snapshot chunk when the log prefix it
/// needs has been compacted away, or an empty heartbeat.
///
/// Reserve members and members with outstanding failures only ever get
/// heartbeats.
#[allow(clippy::too_many_arguments)]
pub fn next_request(
    log: &Log,
    snapshots: &dyn SnapshotStore,
    member: &Member,
    progress: &mut NodeProgress,
    term: Term,
    leader: MemberId,
    commit_index: LogIndex,
    max_batch_bytes: u64,
    snapshot_chunk_bytes: usize,
) -> Result<Option<Command>> {
    if member.kind == MemberKind::Reserve {
        return Ok(Some(Command::Append {
            term,
            leader,
            prev_index: 0,
            prev_term: 0,
            entries: vec![],
            commit_index: 0,
        }));
    }

    if !progress.is_available() {
        return Ok(Some(probe(log, progress, term, leader, commit_index)?));
    }

    match log.batch(progress.next_index, max_batch_bytes)? {
        Some((prev_index, prev_term, entries)) => Ok(Some(Command::Append {
            term,
            leader,
            prev_index,
            prev_term,
            entries,
            commit_index,
        })),
        None => install_chunk(
            snapshots,
            progress,
            term,
            leader,
            snapshot_chunk_bytes,
        ),
    }
}

/// An empty append that carries the leader's identity and term but no
/// entries. Still answered, still resets the member's timer.
fn probe(
    log: &Log,
    progress: &NodeProgress,
    term: Term,
    leader: MemberId,
    commit_index: LogIndex,
) -> Result<Command> {
    let prev_index = progress.match_index;
    let prev_term = log.term_at(prev_index)?.unwrap_or(0);
    Ok(Command::Append {
        term,
        leader,
        prev_index,
        prev_term,
        entries: vec![],
        commit_index: commit_index.min(prev_index),
    })
}

/// The member's next index precedes our first retained entry: switch the
/// pipeline over to transferring the current snapshot.
fn install_chunk(
    snapshots: &dyn SnapshotStore,
    progress: &mut NodeProgress,
    term: Term,
    leader: MemberId,
    snapshot_chunk_bytes: usize,
) -> Result<Option<Command>> {
    let snapshot = match snapshots.current() {
        Some(snapshot) if snapshot.index >= progress.next_index => snapshot,
        // nothing to send until a snapshot covering the gap exists
        _ => return Ok(None),
    };

    let offset = progress.snapshot_cursor(snapshot.id, snapshot.index);
    let end = (offset as usize + snapshot_chunk_bytes).min(snapshot.data.len());
    let data = snapshot.data[offset as usize..end].to_vec();
    let complete = end == snapshot.data.len();
    Ok(Some(Command::Install {
        term,
        leader,
        id: snapshot.id,
        index: snapshot.index,
        snapshot_term: snapshot.term,
        offset,
        data,
        complete,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Log, MemoryLog};
    use crate::raft::{Entry, EntryKind};
    use crate::snapshot::{MemorySnapshotStore, SnapshotStore};
    use uuid::Uuid;

    fn member(id: MemberId, kind: MemberKind) -> Member {
        Member::new(id, format!("127.0.0.1:{}", 9000 + id).parse().unwrap(), kind)
    }

    fn log_with_commands(n: usize, payload: usize) -> Log {
        let mut log = Log::new(Box::new(MemoryLog::new()));
        for i in 0..n {
            log.append(Entry {
                index: 0,
                term: 1,
                time: 0,
                kind: EntryKind::Command {
                    session: 1,
                    sequence: i as u64 + 1,
                    ack_sequence: 0,
                    payload: vec![0u8; payload],
                },
            })
            .unwrap();
        }
        log
    }

    #[test]
    fn batches_are_bounded() {
        let log = log_with_commands(10, 100);
        let snapshots = MemorySnapshotStore::new();
        let mut progress = NodeProgress::new(2, 0);
        let request = next_request(
            &log,
            &snapshots,
            &member(2, MemberKind::Active),
            &mut progress,
            1,
            1,
            0,
            300,
            1024,
        )
        .unwrap()
        .unwrap();
        match request {
            Command::Append {
                prev_index,
                entries,
                ..
            } => {
                assert_eq!(prev_index, 0);
                assert!(!entries.is_empty());
                assert!(entries.len() < 10);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn reserve_members_get_empty_heartbeats() {
        let log = log_with_commands(10, 100);
        let snapshots = MemorySnapshotStore::new();
        let mut progress = NodeProgress::new(4, 0);
        let request = next_request(
            &log,
            &snapshots,
            &member(4, MemberKind::Reserve),
            &mut progress,
            1,
            1,
            5,
            300,
            1024,
        )
        .unwrap()
        .unwrap();
        match request {
            Command::Append { entries, .. } => assert!(entries.is_empty()),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn failing_members_get_probes_only() {
        let log = log_with_commands(10, 100);
        let snapshots = MemorySnapshotStore::new();
        let mut progress = NodeProgress::new(2, 0);
        progress.fail();
        let request = next_request(
            &log,
            &snapshots,
            &member(2, MemberKind::Active),
            &mut progress,
            1,
            1,
            5,
            300,
            1024,
        )
        .unwrap()
        .unwrap();
        match request {
            Command::Append { entries, .. } => assert!(entries.is_empty()),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn compacted_prefix_cuts_over_to_install() {
        let mut log = log_with_commands(10, 10);
        log.commit(10);
        log.compact(5, 1).unwrap();

        let mut snapshots = MemorySnapshotStore::new();
        let id = Uuid::new_v4();
        snapshots.create(id, 5, 1).unwrap();
        snapshots.write(id, 0, &[1u8; 100]).unwrap();
        snapshots.commit(id).unwrap();

        let mut progress = NodeProgress::new(2, 0);
        assert_eq!(progress.next_index, 1);
        let request = next_request(
            &log,
            &snapshots,
            &member(2, MemberKind::Active),
            &mut progress,
            1,
            1,
            10,
            300,
            64,
        )
        .unwrap()
        .unwrap();
        match request {
            Command::Install {
                index,
                offset,
                data,
                complete,
                ..
            } => {
                assert_eq!(index, 5);
                assert_eq!(offset, 0);
                assert_eq!(data.len(), 64);
                assert!(!complete);
            }
            other => panic!("unexpected request {:?}", other),
        }

        // the cursor advances between chunks
        progress.advance_snapshot(64);
        let request = next_request(
            &log,
            &snapshots,
            &member(2, MemberKind::Active),
            &mut progress,
            1,
            1,
            10,
            300,
            64,
        )
        .unwrap()
        .unwrap();
        match request {
            Command::Install {
                offset,
                data,
                complete,
                ..
            } => {
                assert_eq!(offset, 64);
                assert_eq!(data.len(), 36);
                assert!(complete);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn caught_up_member_gets_a_heartbeat_batch() {
        let log = log_with_commands(3, 10);
        let snapshots = MemorySnapshotStore::new();
        let mut progress = NodeProgress::new(2, 3);
        let request = next_request(
            &log,
            &snapshots,
            &member(2, MemberKind::Active),
            &mut progress,
            1,
            1,
            3,
            300,
            1024,
        )
        .unwrap()
        .unwrap();
        match request {
            Command::Append {
                prev_index,
                entries,
                commit_index,
                ..
            } => {
                assert_eq!(prev_index, 3);
                assert!(entries.is_empty());
                assert_eq!(commit_index, 3);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
