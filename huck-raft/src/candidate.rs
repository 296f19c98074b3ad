use std::collections::HashMap;
use std::time::Instant;

use slog::Logger;

use huck_core::error::Result;

use crate::election::{Election, ElectionStatus};
use crate::follower::Follower;
use crate::leader::Leader;
use crate::progress::ReplicationProgress;
use crate::raft::{Apply, Raft, RaftHandle, RaftRole, Role, Term};
use crate::rpc::{Address, Command};

/// An active member campaigning for leadership of the next term.
pub struct Candidate {
    pub election: Election,
    pub logger: Logger,
}

impl Role for Candidate {
    fn term(&mut self, _term: Term) {
        self.election.reset();
    }

    fn role(&self) -> RaftRole {
        RaftRole::Candidate
    }

    fn log(&self) -> &Logger {
        &self.logger
    }
}

impl Raft<Candidate> {
    /// Start an election: advance the term, vote for ourselves (persisted
    /// before anything is sent), and solicit votes from every voter.
    pub(crate) fn seek_election(mut self) -> Result<RaftHandle> {
        info!(self.role.logger, "seeking election");
        let term = self.state.current_term + 1;
        self.meta.store_term(term)?;
        self.state.current_term = term;
        self.state.leader = None;
        self.role.election.reset();
        self.record_vote(self.id)?;

        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for voter in self.cluster.voters() {
            if voter == self.id {
                continue;
            }
            self.send(
                Address::Peer(voter),
                Command::Vote {
                    term,
                    candidate: self.id,
                    last_index,
                    last_term,
                },
            )?;
        }
        self.reset_election_timer();

        // vote for self
        let from = self.id;
        self.apply(Command::VoteResponse {
            term,
            from,
            voted: true,
        })
    }
}

impl Apply for Raft<Candidate> {
    fn apply(mut self, command: Command) -> Result<RaftHandle> {
        self.log_command(&command);

        if let Some(term) = command.term() {
            let is_poll = matches!(
                command,
                Command::Poll { .. } | Command::PollResponse { .. }
            );
            if term > self.state.current_term && !is_poll {
                // a higher term always demotes the candidate
                self.set_term(term)?;
                let raft: Raft<Follower> = Raft::from(self);
                return raft.apply(command);
            }
        }

        match command {
            Command::Tick => {
                if self.needs_election() {
                    info!(self.role.logger, "election timed out, restarting");
                    return self.seek_election();
                }
                Ok(RaftHandle::Candidate(self))
            }
            Command::VoteResponse { term, from, voted } => {
                if term < self.state.current_term {
                    return Ok(RaftHandle::Candidate(self));
                }
                self.role.election.vote(from, voted);
                match self.role.election.election_status() {
                    ElectionStatus::Elected => {
                        info!(self.role.logger, "elected leader"; "term" => self.state.current_term);
                        let raft: Raft<Leader> = Raft::from(self);
                        raft.initialize()
                    }
                    ElectionStatus::Voting => Ok(RaftHandle::Candidate(self)),
                    ElectionStatus::Defeated => {
                        info!(self.role.logger, "defeated in election");
                        let mut raft: Raft<Follower> = Raft::from(self);
                        raft.reset_election_timer();
                        Ok(RaftHandle::Follower(raft))
                    }
                }
            }
            Command::Vote { candidate, .. } => {
                // we already voted for ourselves this term
                self.send(
                    Address::Peer(candidate),
                    Command::VoteResponse {
                        term: self.state.current_term,
                        from: self.id,
                        voted: false,
                    },
                )?;
                Ok(RaftHandle::Candidate(self))
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
                Ok(RaftHandle::Candidate(self))
            }
            Command::Append { term, .. } | Command::Configure { term, .. }
                if term >= self.state.current_term =>
            {
                // a legitimate leader exists for this term
                info!(self.role.logger, "discovered leader, standing down");
                let mut raft: Raft<Follower> = Raft::from(self);
                raft.reset_election_timer();
                raft.apply(command)
            }
            Command::Append { leader, .. } => {
                // stale leader; tell it about our term
                self.send(
                    Address::Peer(leader),
                    Command::AppendResponse {
                        term: self.state.current_term,
                        from: self.id,
                        succeeded: false,
                        last_index: self.log.last_index(),
                    },
                )?;
                Ok(RaftHandle::Candidate(self))
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
                // no leader to forward to while the election runs
                self.forward_to_leader(cmd)?;
                Ok(RaftHandle::Candidate(self))
            }
            _ => Ok(RaftHandle::Candidate(self)),
        }
    }
}

impl From<Raft<Candidate>> for Raft<Follower> {
    fn from(val: Raft<Candidate>) -> Raft<Follower> {
        let logger = val.logger.new(o!("role" => "follower"));
        val.with_role(Follower::new(logger))
    }
}

impl From<Raft<Candidate>> for Raft<Leader> {
    fn from(val: Raft<Candidate>) -> Raft<Leader> {
        info!(val.role.logger, "becoming the leader");
        let remotes = val.cluster.remotes(val.id).iter().map(|m| m.id).collect::<Vec<_>>();
        let progress = ReplicationProgress::new(remotes.iter().copied(), val.log.last_index());
        // contact starts fresh; the quorum check measures from election time
        let contact = remotes.iter().map(|id| (*id, Instant::now())).collect();
        let logger = val.logger.new(o!("role" => "leader"));
        let heartbeat_timeout = val.config.heartbeat_interval();
        val.with_role(Leader {
            progress,
            heartbeat_time: Instant::now(),
            heartbeat_timeout,
            requests: HashMap::new(),
            contact,
            logger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::tests::Harness;
    use crate::raft::{RaftHandle, RaftRole};

    fn candidate_harness() -> Harness {
        let mut harness = Harness::new(1, &[1, 2, 3]);
        let raft = match harness.raft.take().unwrap() {
            RaftHandle::Follower(raft) => raft,
            _ => panic!("expected follower"),
        };
        let candidate: Raft<Candidate> = Raft::from(raft);
        harness.raft = Some(candidate.seek_election().unwrap());
        harness
    }

    #[test]
    fn election_bumps_and_persists_the_term() {
        let mut harness = candidate_harness();
        assert_eq!(harness.role(), RaftRole::Candidate);
        let state = *harness.raft.as_ref().unwrap().state();
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));

        let votes: Vec<_> = harness
            .sent()
            .into_iter()
            .filter(|m| matches!(m.command, Command::Vote { .. }))
            .collect();
        assert_eq!(votes.len(), 2);

        if let Some(RaftHandle::Candidate(raft)) = harness.raft.as_ref() {
            assert_eq!(raft.meta.load_term().unwrap(), Some(1));
            assert_eq!(raft.meta.load_vote().unwrap(), Some(1));
        }
    }

    #[test]
    fn majority_votes_elect_a_leader() {
        let mut harness = candidate_harness();
        harness.apply(Command::VoteResponse {
            term: 1,
            from: 2,
            voted: true,
        });
        assert_eq!(harness.role(), RaftRole::Leader);
    }

    #[test]
    fn defeat_returns_to_follower() {
        let mut harness = candidate_harness();
        harness.apply(Command::VoteResponse {
            term: 1,
            from: 2,
            voted: false,
        });
        assert_eq!(harness.role(), RaftRole::Candidate);
        harness.apply(Command::VoteResponse {
            term: 1,
            from: 3,
            voted: false,
        });
        assert_eq!(harness.role(), RaftRole::Follower);
    }

    #[test]
    fn higher_term_demotes() {
        let mut harness = candidate_harness();
        harness.apply(Command::VoteResponse {
            term: 5,
            from: 2,
            voted: false,
        });
        assert_eq!(harness.role(), RaftRole::Follower);
        assert_eq!(harness.raft.as_ref().unwrap().state().current_term, 5);
    }

    #[test]
    fn current_term_append_is_recognized_as_leader() {
        let mut harness = candidate_harness();
        harness.apply(Command::Append {
            term: 1,
            leader: 2,
            prev_index: 0,
            prev_term: 0,
            entries: vec![],
            commit_index: 0,
        });
        assert_eq!(harness.role(), RaftRole::Follower);
        assert_eq!(harness.raft.as_ref().unwrap().state().leader, Some(2));
    }

    #[test]
    fn competing_votes_are_refused() {
        let mut harness = candidate_harness();
        harness.apply(Command::Vote {
            term: 1,
            candidate: 3,
            last_index: 0,
            last_term: 0,
        });
        let sent = harness.sent();
        let response = sent
            .iter()
            .find(|m| matches!(m.command, Command::VoteResponse { .. }))
            .unwrap();
        match &response.command {
            Command::VoteResponse { voted, .. } => assert!(!voted),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
