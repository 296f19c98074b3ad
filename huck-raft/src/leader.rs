use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use slog::Logger;

use huck_core::error::{ErrorKind, Result};

use crate::appender;
use crate::cluster::MemberKind;
use crate::follower::Follower;
use crate::fsm::Instruction;
use crate::membership;
use crate::progress::ReplicationProgress;
use crate::raft::{
    Apply, Entry, EntryKind, LogIndex, MemberId, Raft, RaftHandle, RaftRole, Role, Term,
};
use crate::rpc::{Address, Caller, Command, Consistency};

/// The elected leader for the current term. Owns the per-member append
/// pipeline and is the only role that accepts client writes.
pub struct Leader {
    pub progress: ReplicationProgress,
    pub heartbeat_time: Instant,
    pub heartbeat_timeout: Duration,
    /// Entries proposed for a client, awaiting commit.
    pub requests: HashMap<LogIndex, Caller>,
    /// When each member last answered, for lease reads and the quorum
    /// step-down check.
    pub contact: HashMap<MemberId, Instant>,
    pub logger: Logger,
}

impl Role for Leader {
    fn term(&mut self, _term: Term) {}

    fn role(&self) -> RaftRole {
        RaftRole::Leader
    }

    fn log(&self) -> &Logger {
        &self.logger
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Raft<Leader> {
    /// Entry point for a fresh leader: anchor commitment in the new term
    /// with an initialize entry, then start replicating.
    pub(crate) fn initialize(mut self) -> Result<RaftHandle> {
        self.set_leader(Some(self.id));
        self.fsm_tx.send(Instruction::Leader { local: true })?;
        self.append_entry(EntryKind::Initialize, None)?;
        self.replicate_all(true)?;
        self.try_commit()?;
        Ok(self.check_membership())
    }

    /// Append an entry at the current term, tracking the caller (if any)
    /// so it can be answered once the entry commits.
    fn append_entry(&mut self, kind: EntryKind, caller: Option<Caller>) -> Result<Entry> {
        let entry = self.log.append(Entry {
            index: 0,
            term: self.state.current_term,
            time: now_ms(),
            kind,
        })?;
        if let Some(caller) = caller {
            self.role.requests.insert(entry.index, caller);
        }
        Ok(entry)
    }

    /// Send the next append, install chunk, or heartbeat to one member.
    fn replicate(&mut self, member_id: MemberId) -> Result<()> {
        let member = match self.cluster.member(member_id) {
            Some(member) => member.clone(),
            None => return Ok(()),
        };
        let progress = match self.role.progress.get_mut(member_id) {
            Some(progress) => progress,
            None => return Ok(()),
        };
        let request = appender::next_request(
            &self.log,
            self.snapshots.as_ref(),
            &member,
            progress,
            self.state.current_term,
            self.id,
            self.state.commit_index,
            self.config.max_batch_bytes,
            self.config.snapshot_chunk_bytes,
        )?;
        if let Some(command) = request {
            // forced heartbeat rounds do not grow the window past the cap
            progress.inflight = (progress.inflight + 1).min(self.config.max_inflight_appends);
            self.send(Address::Peer(member_id), command)?;
        }
        Ok(())
    }

    /// Replicate to every remote member. When `force` is set this is a
    /// heartbeat round: members are contacted even if they have nothing
    /// pending or a saturated pipeline.
    fn replicate_all(&mut self, force: bool) -> Result<()> {
        for member in self.cluster.remotes(self.id) {
            let saturated = self
                .role
                .progress
                .get(member.id)
                .map(|p| p.inflight >= self.config.max_inflight_appends)
                .unwrap_or(false);
            if force || !saturated {
                self.role.progress.insert(member.id, self.log.last_index());
                self.replicate(member.id)?;
            }
        }
        Ok(())
    }

    /// Advance the commit index to the highest index replicated on a
    /// majority of voters, provided the entry there is from the current
    /// term, and answer any clients waiting on newly committed entries.
    fn try_commit(&mut self) -> Result<()> {
        let voters = self.cluster.voters();
        let candidate =
            self.role
                .progress
                .committed_index(&voters, self.id, self.log.last_index());
        if candidate <= self.state.commit_index {
            return Ok(());
        }
        match self.log.term_at(candidate)? {
            Some(term) if term == self.state.current_term => {}
            _ => return Ok(()),
        }
        let mut requests = std::mem::take(&mut self.role.requests);
        self.advance_commit(candidate, |entry| requests.remove(&entry.index))?;
        self.role.requests = requests;
        Ok(())
    }

    /// A committed configuration may have changed this member's own kind;
    /// the leader keeps leading until the change that affects it commits,
    /// then steps down.
    fn check_membership(mut self) -> RaftHandle {
        // forget members that left
        let keep: Vec<MemberId> = self.cluster.members().iter().map(|m| m.id).collect();
        self.role.progress.retain(|id| keep.contains(&id));
        self.role.contact.retain(|id, _| keep.contains(id));

        let kind = self.cluster.kind(self.id);
        if kind != MemberKind::Active && !self.cluster.has_uncommitted() {
            info!(self.role.logger, "stepping down"; "kind" => format!("{:?}", kind));
            let _ = self.fsm_tx.send(Instruction::Leader { local: false });
            return self.into_role_for(kind);
        }
        RaftHandle::Leader(self)
    }

    /// Abdicate to follower, e.g. after losing quorum contact.
    fn step_down(self) -> Result<RaftHandle> {
        info!(self.role.logger, "lost contact with quorum, stepping down");
        self.fsm_tx.send(Instruction::Leader { local: false })?;
        let mut raft: Raft<Follower> = Raft::from(self);
        raft.state.leader = None;
        raft.reset_election_timer();
        Ok(RaftHandle::Follower(raft))
    }

    /// Whether a majority of voters (counting ourselves) has been heard
    /// from within the election timeout.
    fn quorum_in_contact(&self) -> bool {
        let timeout = self.config.election_timeout();
        let voters = self.cluster.voters();
        let fresh = voters
            .iter()
            .filter(|id| {
                **id == self.id
                    || self
                        .role
                        .contact
                        .get(id)
                        .map(|at| at.elapsed() < timeout)
                        .unwrap_or(false)
            })
            .count();
        fresh >= self.cluster.quorum()
    }

    fn tick(mut self) -> Result<RaftHandle> {
        if !self.quorum_in_contact() {
            return self.step_down();
        }

        if self.role.heartbeat_time.elapsed() >= self.role.heartbeat_timeout {
            self.role.heartbeat_time = Instant::now();
            self.replicate_all(true)?;
            self.maybe_snapshot()?;
        }
        Ok(RaftHandle::Leader(self))
    }

    /// Ask the state machine for a snapshot once enough entries have
    /// accumulated past the last one.
    fn maybe_snapshot(&mut self) -> Result<()> {
        if self.config.snapshot_threshold == 0 {
            return Ok(());
        }
        let last = self.snapshots.current().map(|s| s.index).unwrap_or(0);
        if self.state.commit_index.saturating_sub(last) >= self.config.snapshot_threshold {
            self.fsm_tx.send(Instruction::Snapshot)?;
        }
        Ok(())
    }

    fn handle_append_response(
        mut self,
        from: MemberId,
        succeeded: bool,
        last_index: LogIndex,
    ) -> Result<RaftHandle> {
        self.role.contact.insert(from, Instant::now());
        let last_log_index = self.log.last_index();
        let max_inflight = self.config.max_inflight_appends;

        let more = {
            let progress = match self.role.progress.get_mut(from) {
                Some(progress) => progress,
                None => return Ok(RaftHandle::Leader(self)),
            };
            progress.inflight = progress.inflight.saturating_sub(1);
            if succeeded {
                progress.succeed(last_index);
            } else {
                // the member handed us its own last index as a hint
                progress.hint(last_index);
            }
            progress.next_index <= last_log_index && progress.inflight < max_inflight
        };

        if succeeded {
            self.try_commit()?;
            self.maybe_promote(from)?;
        }
        if more || !succeeded {
            self.replicate(from)?;
        }
        Ok(self.check_membership())
    }

    fn handle_install_response(&mut self, from: MemberId, succeeded: bool) -> Result<()> {
        self.role.contact.insert(from, Instant::now());
        let chunk = self.config.snapshot_chunk_bytes as u64;
        let snapshot_len = self
            .snapshots
            .current()
            .map(|s| s.data.len() as u64)
            .unwrap_or(0);
        if let Some(progress) = self.role.progress.get_mut(from) {
            progress.inflight = progress.inflight.saturating_sub(1);
            if !succeeded {
                progress.reset_snapshot();
            } else if progress.next_snapshot_id.is_some() {
                let sent = snapshot_len
                    .saturating_sub(progress.next_snapshot_offset)
                    .min(chunk);
                progress.advance_snapshot(sent);
                if progress.next_snapshot_offset >= snapshot_len {
                    progress.finish_snapshot();
                }
            }
        }
        self.replicate(from)
    }

    /// Promote a learner that has caught up: reserve members become
    /// passive within the configured threshold of the commit index, and
    /// passive members become active voters once they have acked it.
    fn maybe_promote(&mut self, from: MemberId) -> Result<()> {
        if self.cluster.has_uncommitted() {
            return Ok(());
        }
        let promoted = membership::promotion(
            &self.cluster,
            &self.role.progress,
            self.state.commit_index,
            self.config.promotion_threshold,
        );
        if let Some(members) = promoted {
            info!(self.role.logger, "promoting member"; "member" => from);
            self.commit_configuration(members, None)?;
        }
        Ok(())
    }

    /// Append a configuration entry, adopt it immediately, and distribute
    /// it to every remote member.
    fn commit_configuration(
        &mut self,
        members: Vec<crate::cluster::Member>,
        caller: Option<Caller>,
    ) -> Result<()> {
        let time = self.cluster.next_time();
        let entry = self.append_entry(
            EntryKind::Configuration {
                time,
                members: members.clone(),
            },
            caller,
        )?;
        self.cluster.update(crate::cluster::Configuration {
            index: entry.index,
            time,
            members,
        });
        for member in self.cluster.remotes(self.id) {
            self.role.progress.insert(member.id, self.log.last_index());
            self.send(
                Address::Peer(member.id),
                Command::Configure {
                    term: self.state.current_term,
                    leader: self.id,
                    index: entry.index,
                    time,
                    members: self.cluster.members().to_vec(),
                },
            )?;
        }
        self.replicate_all(false)?;
        self.try_commit()
    }

    fn respond_membership_error(&self, caller: Caller, kind: ErrorKind) -> Result<()> {
        let configuration = self.cluster.configuration();
        self.send(
            caller.address(),
            Command::MembershipResponse {
                client: caller.client(),
                index: configuration.index,
                time: configuration.time,
                members: configuration.members.clone(),
                leader: Some(self.id),
                error: Some(kind),
            },
        )
    }

    /// Handle a client operation, either submitted locally or forwarded
    /// by another server.
    fn handle_client(mut self, caller: Caller, command: Command) -> Result<RaftHandle> {
        match command {
            Command::Propose {
                session,
                sequence,
                ack_sequence,
                payload,
                ..
            } => {
                self.append_entry(
                    EntryKind::Command {
                        session,
                        sequence,
                        ack_sequence,
                        payload,
                    },
                    Some(caller),
                )?;
                self.replicate_all(false)?;
                self.try_commit()?;
            }
            Command::OpenSession {
                name,
                kind,
                timeout_ms,
                ..
            } => {
                let member = match caller {
                    Caller::Local(_) => self.id,
                    Caller::Remote(member, _) => member,
                };
                let timeout_ms = if timeout_ms == 0 {
                    self.config.session_timeout_ms
                } else {
                    timeout_ms
                };
                self.append_entry(
                    EntryKind::OpenSession {
                        member,
                        name,
                        kind,
                        timeout_ms,
                    },
                    Some(caller),
                )?;
                self.replicate_all(false)?;
                self.try_commit()?;
            }
            Command::KeepAlive {
                session,
                ack_sequence,
                ack_event_index,
                ..
            } => {
                self.append_entry(
                    EntryKind::KeepAlive {
                        session,
                        ack_sequence,
                        ack_event_index,
                    },
                    Some(caller),
                )?;
                self.replicate_all(false)?;
                self.try_commit()?;
            }
            Command::CloseSession { session, .. } => {
                self.append_entry(
                    EntryKind::CloseSession {
                        session,
                        expired: false,
                    },
                    Some(caller),
                )?;
                self.replicate_all(false)?;
                self.try_commit()?;
            }
            Command::Query {
                session,
                min_sequence,
                min_index,
                consistency,
                payload,
                ..
            } => match consistency {
                Consistency::Eventual => {
                    self.fsm_tx.send(Instruction::Query {
                        caller,
                        session,
                        min_sequence,
                        min_index,
                        payload,
                    })?;
                }
                Consistency::Lease if self.quorum_in_contact() => {
                    self.fsm_tx.send(Instruction::Query {
                        caller,
                        session,
                        min_sequence,
                        min_index,
                        payload,
                    })?;
                }
                // no usable lease: fall through to the linearizable path
                Consistency::Lease | Consistency::Strict => {
                    self.append_entry(
                        EntryKind::Query {
                            session,
                            min_sequence,
                            min_index,
                            payload,
                        },
                        Some(caller),
                    )?;
                    self.replicate_all(false)?;
                    self.try_commit()?;
                }
            },
            Command::Metadata { .. } => {
                self.append_entry(EntryKind::Metadata, Some(caller))?;
                self.replicate_all(false)?;
                self.try_commit()?;
            }
            Command::Join { member, .. } => {
                match membership::join(&self.cluster, member) {
                    Ok(members) => self.commit_configuration(members, Some(caller))?,
                    Err(err) => self.respond_membership_error(
                        caller,
                        err.kind().unwrap_or(ErrorKind::ConfigurationError),
                    )?,
                }
            }
            Command::Leave { member, .. } => {
                match membership::leave(&self.cluster, &member) {
                    Ok(members) => self.commit_configuration(members, Some(caller))?,
                    Err(err) => self.respond_membership_error(
                        caller,
                        err.kind().unwrap_or(ErrorKind::ConfigurationError),
                    )?,
                }
            }
            Command::Reconfigure {
                index,
                time,
                members,
                ..
            } => match membership::reconfigure(&self.cluster, index, time, members) {
                Ok(members) => self.commit_configuration(members, Some(caller))?,
                Err(err) => self.respond_membership_error(
                    caller,
                    err.kind().unwrap_or(ErrorKind::ConfigurationError),
                )?,
            },
            Command::Reset { session, index } => {
                self.fsm_tx.send(Instruction::Reset { session, index })?;
            }
            other => {
                warn!(self.role.logger, "unexpected client operation"; "command" => format!("{:?}", other));
            }
        }
        Ok(self.check_membership())
    }
}

impl Apply for Raft<Leader> {
    fn apply(mut self, command: Command) -> Result<RaftHandle> {
        self.log_command(&command);

        if let Some(term) = command.term() {
            let is_poll = matches!(
                command,
                Command::Poll { .. } | Command::PollResponse { .. }
            );
            if term > self.state.current_term && !is_poll {
                info!(self.role.logger, "discovered higher term, stepping down"; "term" => term);
                self.set_term(term)?;
                self.fsm_tx.send(Instruction::Leader { local: false })?;
                let mut raft: Raft<Follower> = Raft::from(self);
                raft.reset_election_timer();
                return raft.apply(command);
            }
        }

        match command {
            Command::Tick => self.tick(),
            Command::AppendResponse {
                from,
                succeeded,
                last_index,
                ..
            } => self.handle_append_response(from, succeeded, last_index),
            Command::InstallResponse {
                from, succeeded, ..
            } => {
                self.handle_install_response(from, succeeded)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::ConfigureResponse { from, .. } => {
                self.role.contact.insert(from, Instant::now());
                Ok(RaftHandle::Leader(self))
            }
            Command::Vote { candidate, .. } => {
                self.send(
                    Address::Peer(candidate),
                    Command::VoteResponse {
                        term: self.state.current_term,
                        from: self.id,
                        voted: false,
                    },
                )?;
                Ok(RaftHandle::Leader(self))
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
                Ok(RaftHandle::Leader(self))
            }
            Command::Unreachable { member } => {
                if let Some(progress) = self.role.progress.get_mut(member) {
                    progress.inflight = 0;
                    if progress.fail() {
                        warn!(self.role.logger, "member unreachable"; "member" => member, "failures" => progress.failures);
                    }
                }
                Ok(RaftHandle::Leader(self))
            }
            Command::Expire { sessions } => {
                for session in sessions {
                    self.append_entry(
                        EntryKind::CloseSession {
                            session,
                            expired: true,
                        },
                        None,
                    )?;
                }
                self.replicate_all(false)?;
                self.try_commit()?;
                Ok(self.check_membership())
            }
            Command::Snapshot { index, term, data } => {
                self.handle_snapshot_taken(index, term, data)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::Forward { member, command } => {
                let caller = match command.request_client() {
                    Some(client) => Caller::Remote(member, client),
                    None => Caller::Remote(member, 0),
                };
                self.handle_client(caller, *command)
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
                let caller = Caller::Local(cmd.request_client().unwrap_or(0));
                self.handle_client(caller, cmd)
            }
            _ => Ok(RaftHandle::Leader(self)),
        }
    }
}

impl From<Raft<Leader>> for Raft<Follower> {
    fn from(val: Raft<Leader>) -> Raft<Follower> {
        let logger = val.logger.new(o!("role" => "follower"));
        val.with_role(Follower::new(logger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Candidate;
    use crate::cluster::{Member, MemberKind};
    use crate::raft::tests::{test_addr, Harness};
    use crate::raft::RaftRole;

    fn leader_harness(voters: &[MemberId]) -> Harness {
        let mut harness = Harness::new(1, voters);
        let raft = match harness.raft.take().unwrap() {
            RaftHandle::Follower(raft) => raft,
            _ => panic!("expected follower"),
        };
        let candidate: Raft<Candidate> = Raft::from(raft);
        let mut handle = candidate.seek_election().unwrap();
        // gather the second vote if the cluster needs one
        if voters.len() > 1 {
            handle = handle
                .apply(Command::VoteResponse {
                    term: 1,
                    from: voters[1],
                    voted: true,
                })
                .unwrap();
        }
        harness.raft = Some(handle);
        harness.sent();
        harness
    }

    #[test]
    fn initialize_entry_is_appended_on_election() {
        let harness = leader_harness(&[1, 2, 3]);
        assert_eq!(harness.role(), RaftRole::Leader);
        if let Some(RaftHandle::Leader(raft)) = harness.raft.as_ref() {
            let entry = raft.log.get(1).unwrap().unwrap();
            assert_eq!(entry.kind, EntryKind::Initialize);
            assert_eq!(entry.term, 1);
        }
    }

    #[test]
    fn single_node_commits_immediately() {
        let mut harness = leader_harness(&[1]);
        let driven = harness.driven();
        // leadership notice plus the committed initialize entry
        assert!(driven
            .iter()
            .any(|i| matches!(i, Instruction::Leader { local: true })));
        assert!(driven.iter().any(
            |i| matches!(i, Instruction::Drive { entry, .. } if entry.kind == EntryKind::Initialize)
        ));
    }

    #[test]
    fn propose_appends_and_replicates() {
        let mut harness = leader_harness(&[1, 2, 3]);
        harness.apply(Command::Propose {
            client: 5,
            session: 1,
            sequence: 1,
            ack_sequence: 0,
            payload: vec![9],
        });
        if let Some(RaftHandle::Leader(raft)) = harness.raft.as_ref() {
            assert_eq!(raft.log.last_index(), 2);
            assert!(raft.role.requests.contains_key(&2));
        }
        harness.sent();

        // the initialize append is still in flight; acking it frees the
        // pipeline and the proposed entry goes out
        harness.apply(Command::AppendResponse {
            term: 1,
            from: 2,
            succeeded: true,
            last_index: 1,
        });
        let appends: Vec<_> = harness
            .sent()
            .into_iter()
            .filter(|m| {
                matches!(
                    &m.command,
                    Command::Append { entries, .. } if entries.iter().any(|e| e.index == 2)
                )
            })
            .collect();
        assert!(!appends.is_empty());
    }

    #[test]
    fn commit_requires_current_term_quorum() {
        let mut harness = leader_harness(&[1, 2, 3]);
        // replicate the initialize entry to one follower: quorum of 2
        harness.apply(Command::AppendResponse {
            term: 1,
            from: 2,
            succeeded: true,
            last_index: 1,
        });
        assert_eq!(harness.raft.as_ref().unwrap().state().commit_index, 1);
    }

    #[test]
    fn mismatch_hint_rewinds_next_index() {
        let mut harness = leader_harness(&[1, 2, 3]);
        harness.apply(Command::AppendResponse {
            term: 1,
            from: 2,
            succeeded: false,
            last_index: 0,
        });
        if let Some(RaftHandle::Leader(raft)) = harness.raft.as_ref() {
            let progress = raft.role.progress.get(2).unwrap();
            assert_eq!(progress.next_index, 1);
        }
        // the retry goes out immediately
        let retries: Vec<_> = harness
            .sent()
            .into_iter()
            .filter(|m| matches!(m.command, Command::Append { .. }))
            .collect();
        assert_eq!(retries.len(), 1);
    }

    #[test]
    fn higher_term_response_steps_down() {
        let mut harness = leader_harness(&[1, 2, 3]);
        harness.apply(Command::AppendResponse {
            term: 9,
            from: 2,
            succeeded: false,
            last_index: 0,
        });
        assert_eq!(harness.role(), RaftRole::Follower);
        assert_eq!(harness.raft.as_ref().unwrap().state().current_term, 9);
    }

    #[test]
    fn join_adds_a_reserve_member() {
        let mut harness = leader_harness(&[1, 2, 3]);
        harness.apply(Command::Join {
            client: 8,
            member: Member::new(4, test_addr(9004), MemberKind::Active),
        });
        let cluster = harness.raft.as_ref().unwrap().cluster().clone();
        assert_eq!(cluster.kind(4), MemberKind::Reserve);
        assert!(cluster.has_uncommitted());

        // a second change while the first is uncommitted is refused
        harness.sent();
        harness.apply(Command::Join {
            client: 9,
            member: Member::new(5, test_addr(9005), MemberKind::Active),
        });
        let sent = harness.sent();
        let response = sent
            .iter()
            .find(|m| matches!(m.command, Command::MembershipResponse { .. }))
            .unwrap();
        match &response.command {
            Command::MembershipResponse { error, .. } => {
                assert_eq!(error, &Some(ErrorKind::ConfigurationError));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn leave_of_self_steps_down_after_commit() {
        let mut harness = leader_harness(&[1, 2, 3]);
        harness.apply(Command::Leave {
            client: 8,
            member: Member::new(1, test_addr(9001), MemberKind::Active),
        });
        // the leave entry (index 2) must commit before the leader yields;
        // the departing leader no longer counts toward the new quorum
        assert_eq!(harness.role(), RaftRole::Leader);
        harness.apply(Command::AppendResponse {
            term: 1,
            from: 2,
            succeeded: true,
            last_index: 2,
        });
        assert_eq!(harness.role(), RaftRole::Leader);
        harness.apply(Command::AppendResponse {
            term: 1,
            from: 3,
            succeeded: true,
            last_index: 2,
        });
        assert_eq!(harness.role(), RaftRole::Inactive);
    }

    #[test]
    fn expired_sessions_are_closed_through_the_log() {
        let mut harness = leader_harness(&[1]);
        harness.driven();
        harness.apply(Command::Expire {
            sessions: vec![7, 9],
        });
        let driven = harness.driven();
        let closes: Vec<_> = driven
            .iter()
            .filter(|i| {
                matches!(
                    i,
                    Instruction::Drive {
                        entry: Entry {
                            kind: EntryKind::CloseSession { expired: true, .. },
                            ..
                        },
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(closes.len(), 2);
    }

    #[test]
    fn quorum_timeout_steps_down() {
        let mut harness = leader_harness(&[1, 2, 3]);
        if let Some(RaftHandle::Leader(raft)) = harness.raft.as_mut() {
            // age out all follower contact
            raft.role.contact.clear();
        }
        harness.apply(Command::Tick);
        assert_eq!(harness.role(), RaftRole::Follower);
    }

    #[test]
    fn strict_query_goes_through_the_log() {
        let mut harness = leader_harness(&[1]);
        harness.driven();
        harness.apply(Command::Query {
            client: 3,
            session: 1,
            min_sequence: 0,
            min_index: 0,
            consistency: Consistency::Strict,
            payload: vec![1],
        });
        let driven = harness.driven();
        assert!(driven.iter().any(|i| matches!(
            i,
            Instruction::Drive {
                entry: Entry {
                    kind: EntryKind::Query { .. },
                    ..
                },
                ..
            }
        )));
    }
}
