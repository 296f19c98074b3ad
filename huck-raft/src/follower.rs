use slog::Logger;

use huck_core::error::Result;

use crate::candidate::Candidate;
use crate::election::{Election, ElectionStatus};
use crate::fsm::Instruction;
use crate::raft::{Apply, Raft, RaftHandle, RaftRole, Role, Term};
use crate::rpc::{Address, Caller, Command, Consistency};

/// An active member that is replicating from a known or to-be-discovered
/// leader. Runs the randomized heartbeat timer and the pre-vote poll
/// round that precedes a candidacy.
pub struct Follower {
    /// Tally of the current pre-vote round, if one is running.
    pub poll: Option<Election>,
    pub logger: Logger,
}

impl Follower {
    pub fn new(logger: Logger) -> Follower {
        Follower { poll: None, logger }
    }
}

impl Role for Follower {
    fn term(&mut self, _term: Term) {
        self.poll = None;
    }

    fn role(&self) -> RaftRole {
        RaftRole::Follower
    }

    fn log(&self) -> &Logger {
        &self.logger
    }
}

impl Raft<Follower> {
    /// The heartbeat timer expired: give up on the current leader and ask
    /// the other voters whether a candidacy at our log position could
    /// succeed.
    fn poll_members(mut self) -> Result<RaftHandle> {
        info!(self.role.logger, "heartbeat timed out, polling members");
        self.state.leader = None;

        let voters = self.cluster.voters();
        let mut poll = Election::new(voters.iter().copied());
        poll.vote(self.id, true);
        self.role.poll = Some(poll);

        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for voter in voters {
            if voter == self.id {
                continue;
            }
            self.send(
                Address::Peer(voter),
                Command::Poll {
                    term: self.state.current_term,
                    candidate: self.id,
                    last_index,
                    last_term,
                },
            )?;
        }
        self.reset_election_timer();
        self.check_poll()
    }

    fn check_poll(mut self) -> Result<RaftHandle> {
        match self.role.poll.as_ref().map(|p| p.election_status()) {
            Some(ElectionStatus::Elected) => {
                info!(self.role.logger, "poll accepted, seeking election");
                self.role.poll = None;
                let raft: Raft<Candidate> = Raft::from(self);
                raft.seek_election()
            }
            Some(ElectionStatus::Defeated) => {
                info!(self.role.logger, "poll rejected");
                self.role.poll = None;
                self.reset_election_timer();
                Ok(RaftHandle::Follower(self))
            }
            _ => Ok(RaftHandle::Follower(self)),
        }
    }

    /// Whether a pre-vote for `candidate` would be accepted: the
    /// candidate's log must be at least as up-to-date as ours and we must
    /// not have heard from a leader within the timeout.
    fn accepts_poll(&self, last_index: u64, last_term: Term) -> bool {
        self.log.up_to_date(last_index, last_term)
            && (self.state.leader.is_none() || self.needs_election())
    }
}

impl Apply for Raft<Follower> {
    fn apply(mut self, command: Command) -> Result<RaftHandle> {
        self.log_command(&command);

        if let Some(term) = command.term() {
            // polls are non-binding and never disturb the term
            let is_poll = matches!(
                command,
                Command::Poll { .. } | Command::PollResponse { .. }
            );
            if term > self.state.current_term && !is_poll {
                self.set_term(term)?;
            }
        }

        match command {
            Command::Tick => {
                if self.needs_election() {
                    // restarts any poll round that never resolved
                    return self.poll_members();
                }
                Ok(RaftHandle::Follower(self))
            }
            Command::Poll {
                candidate,
                last_index,
                last_term,
                ..
            } => {
                let accepted = self.accepts_poll(last_index, last_term);
                self.send(
                    Address::Peer(candidate),
                    Command::PollResponse {
                        term: self.state.current_term,
                        from: self.id,
                        accepted,
                    },
                )?;
                Ok(RaftHandle::Follower(self))
            }
            Command::PollResponse { from, accepted, .. } => {
                if let Some(poll) = self.role.poll.as_mut() {
                    poll.vote(from, accepted);
                }
                self.check_poll()
            }
            Command::Vote {
                term,
                candidate,
                last_index,
                last_term,
            } => {
                let grant = term == self.state.current_term
                    && self
                        .state
                        .voted_for
                        .map(|id| id == candidate)
                        .unwrap_or(true)
                    && self.log.up_to_date(last_index, last_term);
                if grant {
                    self.record_vote(candidate)?;
                    self.reset_election_timer();
                }
                self.send(
                    Address::Peer(candidate),
                    Command::VoteResponse {
                        term: self.state.current_term,
                        from: self.id,
                        voted: grant,
                    },
                )?;
                Ok(RaftHandle::Follower(self))
            }
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
                Ok(RaftHandle::Follower(self))
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
                Ok(RaftHandle::Follower(self))
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
                Ok(RaftHandle::Follower(self))
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
                Ok(RaftHandle::Follower(self))
            }
            Command::Snapshot { index, term, data } => {
                self.handle_snapshot_taken(index, term, data)?;
                Ok(RaftHandle::Follower(self))
            }
            Command::Forward { member, command } => {
                self.relay(member, *command)?;
                Ok(RaftHandle::Follower(self))
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
                Ok(RaftHandle::Follower(self))
            }
            _ => Ok(RaftHandle::Follower(self)),
        }
    }
}

impl From<Raft<Follower>> for Raft<Candidate> {
    fn from(val: Raft<Follower>) -> Raft<Candidate> {
        let election = Election::new(val.cluster.voters());
        let logger = val.logger.new(o!("role" => "candidate"));
        val.with_role(Candidate { election, logger })
    }
}
