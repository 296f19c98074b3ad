use slog::Logger;

use huck_core::error::Result;

use crate::fsm::Instruction;
use crate::raft::{Apply, Raft, RaftHandle, RaftRole, Role, Term};
use crate::rpc::{Address, Caller, Command, Consistency};

/// A learner: receives every committed entry from the leader but never
/// votes and never campaigns. The membership coordinator promotes a
/// passive member to active once it has caught up.
pub struct Passive {
    pub logger: Logger,
}

impl Passive {
    pub fn new(logger: Logger) -> Passive {
        Passive { logger }
    }
}

impl Role for Passive {
    fn term(&mut self, _term: Term) {}

    fn role(&self) -> RaftRole {
        RaftRole::Passive
    }

    fn log(&self) -> &Logger {
        &self.logger
    }
}

impl Apply for Raft<Passive> {
    fn apply(mut self, command: Command) -> Result<RaftHandle> {
        self.log_command(&command);

        if let Some(term) = command.term() {
            let is_poll = matches!(
                command,
                Command::Poll { .. } | Command::PollResponse { .. }
            );
            if term > self.state.current_term && !is_poll {
                self.set_term(term)?;
            }
        }

        match command {
            Command::Append {
                term,
                leader,
                prev_index,
                prev_term,
                entries,
                commit_index,
            } => {
                let before = self.cluster.kind(self.id);
                let after =
                    self.handle_append(term, leader, prev_index, prev_term, entries, commit_index)?;
                if after != before {
                    return Ok(self.into_role_for(after));
                }
                Ok(RaftHandle::Passive(self))
            }
            Command::Install {
                term,
                leader,
                id,
                index,
                snapshot_term,
                offset,
                data,
                complete,
            } => {
                self.handle_install(term, leader, id, index, snapshot_term, offset, data, complete)?;
                Ok(RaftHandle::Passive(self))
            }
            Command::Configure {
                term,
                leader,
                index,
                time,
                members,
            } => {
                let before = self.cluster.kind(self.id);
                let after = self.handle_configure(term, leader, index, time, members)?;
                if after != before {
                    return Ok(self.into_role_for(after));
                }
                Ok(RaftHandle::Passive(self))
            }
            Command::Vote { candidate, .. } => {
                // learners do not vote
                self.send(
                    Address::Peer(candidate),
                    Command::VoteResponse {
                        term: self.state.current_term,
                        from: self.id,
                        voted: false,
                    },
                )?;
                Ok(RaftHandle::Passive(self))
            }
            Command::Poll { candidate, .. } => {
                self.send(
                    Address::Peer(candidate),
                    Command::PollResponse {
                        term: self.state.current_term,
                        from: self.id,
                        accepted: false,
                    },
                )?;
                Ok(RaftHandle::Passive(self))
            }
            Command::Query {
                client,
                session,
                min_sequence,
                min_index,
                consistency: Consistency::Eventual,
                payload,
            } => {
                self.fsm_tx.send(Instruction::Query {
                    caller: Caller::Local(client),
                    session,
                    min_sequence,
                    min_index,
                    payload,
                })?;
                Ok(RaftHandle::Passive(self))
            }
            Command::Snapshot { index, term, data } => {
                self.handle_snapshot_taken(index, term, data)?;
                Ok(RaftHandle::Passive(self))
            }
            Command::Forward { member, command } => {
                self.relay(member, *command)?;
                Ok(RaftHandle::Passive(self))
            }
            cmd @ Command::Join { .. }
            | cmd @ Command::Leave { .. }
            | cmd @ Command::Reconfigure { .. }
            | cmd @ Command::OpenSession { .. }
            | cmd @ Command::KeepAlive { .. }
            | cmd @ Command::CloseSession { .. }
            | cmd @ Command::Propose { .. }
            | cmd @ Command::Query { .. }
            | cmd @ Command::Metadata { .. }
            | cmd @ Command::Reset { .. } => {
                self.forward_to_leader(cmd)?;
                Ok(RaftHandle::Passive(self))
            }
            _ => Ok(RaftHandle::Passive(self)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Member, MemberKind};
    use crate::raft::tests::{test_addr, test_config, Harness};
    use crate::raft::{Entry, EntryKind, RaftRole};

    fn passive_harness() -> Harness {
        let mut config = test_config(4, &[1, 2, 3]);
        config
            .members
            .push(Member::new(4, test_addr(9004), MemberKind::Passive));
        Harness::with_config(config)
    }

    fn entry(index: u64, term: Term) -> Entry {
        Entry {
            index,
            term,
            time: 0,
            kind: EntryKind::Initialize,
        }
    }

    #[test]
    fn replicates_but_does_not_vote() {
        let mut harness = passive_harness();
        assert_eq!(harness.role(), RaftRole::Passive);

        harness.apply(Command::Append {
            term: 1,
            leader: 1,
            prev_index: 0,
            prev_term: 0,
            entries: vec![entry(1, 1)],
            commit_index: 1,
        });
        let sent = harness.sent();
        match &sent[0].command {
            Command::AppendResponse {
                succeeded,
                last_index,
                ..
            } => {
                assert!(*succeeded);
                assert_eq!(*last_index, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(harness.driven().len(), 1);

        harness.apply(Command::Vote {
            term: 2,
            candidate: 2,
            last_index: 1,
            last_term: 1,
        });
        match &harness.sent()[0].command {
            Command::VoteResponse { voted, .. } => assert!(!*voted),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn ticks_never_start_an_election() {
        let mut harness = passive_harness();
        for _ in 0..100 {
            harness.apply(Command::Tick);
        }
        assert_eq!(harness.role(), RaftRole::Passive);
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn promotion_to_active_changes_role() {
        let mut harness = passive_harness();
        let members: Vec<Member> = harness
            .raft
            .as_ref()
            .unwrap()
            .cluster()
            .members()
            .iter()
            .map(|m| {
                if m.id == 4 {
                    Member::new(4, m.addr, MemberKind::Active)
                } else {
                    m.clone()
                }
            })
            .collect();
        harness.apply(Command::Configure {
            term: 1,
            leader: 1,
            index: 5,
            time: 1,
            members,
        });
        assert_eq!(harness.role(), RaftRole::Follower);
    }
}
