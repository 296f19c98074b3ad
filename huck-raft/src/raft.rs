use std::time::{Duration, Instant};

use rand::Rng;
use slog::Logger;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use huck_core::error::{Error, Result};

use crate::candidate::Candidate;
use crate::cluster::{Cluster, Configuration, Member, MemberKind};
use crate::config::RaftConfig;
use crate::follower::Follower;
use crate::fsm::Instruction;
use crate::inactive::Inactive;
use crate::leader::Leader;
use crate::log::{AppendOutcome, Log, LogStore, MemoryLog};
use crate::meta::{MemoryMetaStore, MetaStore};
use crate::passive::Passive;
use crate::reserve::Reserve;
use crate::rpc::{Address, Command, Message};
use crate::snapshot::{MemorySnapshotStore, SnapshotStore};

/// An id that uniquely identifies a member of the cluster.
pub type MemberId = u64;
pub type Term = u64;
pub type LogIndex = u64;
/// A session id is the log index of the entry that opened it.
pub type SessionId = u64;

/// An entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The index of the entry within the log.
    pub index: LogIndex,
    /// The term of the entry.
    pub term: Term,
    /// Leader-stamped wall time, in milliseconds. Drives deterministic
    /// session expiration on every replica.
    pub time: u64,
    /// What the entry does when applied.
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Appended by a new leader to anchor commitment in its term.
    Initialize,
    /// A membership change.
    Configuration { time: u64, members: Vec<Member> },
    /// A client command against the state machine.
    Command {
        session: SessionId,
        sequence: u64,
        ack_sequence: u64,
        payload: Vec<u8>,
    },
    OpenSession {
        member: MemberId,
        name: String,
        kind: String,
        timeout_ms: u64,
    },
    CloseSession { session: SessionId, expired: bool },
    KeepAlive {
        session: SessionId,
        ack_sequence: u64,
        ack_event_index: LogIndex,
    },
    /// A linearizable read, recorded in the log so that its answer is
    /// anchored at a committed index.
    Query {
        session: SessionId,
        min_sequence: u64,
        min_index: LogIndex,
        payload: Vec<u8>,
    },
    /// A linearizable metadata read.
    Metadata,
}

/// Coarse role of a server, used for reporting transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Inactive,
    Reserve,
    Passive,
    Follower,
    Candidate,
    Leader,
}

/// A leader-change notification: fired once per distinct leader per term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaderChange {
    pub term: Term,
    pub leader: Option<MemberId>,
}

/// Notification channels observable by embedding code and tests. All
/// writes happen on the protocol context.
pub struct Watches {
    pub leader: watch::Sender<LeaderChange>,
    pub role: watch::Sender<RaftRole>,
}

impl Watches {
    pub fn new() -> (Watches, watch::Receiver<LeaderChange>, watch::Receiver<RaftRole>) {
        let (leader_tx, leader_rx) = watch::channel(LeaderChange::default());
        let (role_tx, role_rx) = watch::channel(RaftRole::Inactive);
        (
            Watches {
                leader: leader_tx,
                role: role_tx,
            },
            leader_rx,
            role_rx,
        )
    }
}

/// Volatile and persisted state that is common to all roles. Term and
/// vote are mirrored to the metadata store before they are externalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct State {
    pub current_term: Term,
    /// Who this server voted for in the current term.
    pub voted_for: Option<MemberId>,
    /// The highest index known committed.
    pub commit_index: LogIndex,
    /// The highest index handed to the state-machine context.
    pub last_applied: LogIndex,
    /// The current leader, as far as this server knows.
    pub leader: Option<MemberId>,
    /// The last (term, leader) announced to listeners.
    announced: Option<(Term, MemberId)>,
    /// When the election timer was last reset.
    pub election_time: Option<Instant>,
    /// The randomized timeout for the current election window.
    pub election_timeout: Option<Duration>,
}

impl Default for State {
    fn default() -> Self {
        State {
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            leader: None,
            announced: None,
            election_time: None,
            election_timeout: None,
        }
    }
}

/// The storage handles a server owns: the log, the metadata records, and
/// the snapshot store.
pub struct Stores {
    pub log: Box<dyn LogStore>,
    pub meta: Box<dyn MetaStore>,
    pub snapshots: Box<dyn SnapshotStore>,
}

impl Stores {
    pub fn in_memory() -> Stores {
        Stores {
            log: Box::new(MemoryLog::new()),
            meta: Box::new(MemoryMetaStore::new()),
            snapshots: Box::new(MemorySnapshotStore::new()),
        }
    }
}

/// Shared behavior that all roles of the state machine must implement.
pub trait Role {
    /// The term changed; reset any role-local election state.
    fn term(&mut self, term: Term);
    fn role(&self) -> RaftRole;
    fn log(&self) -> &Logger;
}

/// The primary struct representing the server. Contains fields common to
/// all roles; role-specific state lives in `role`.
pub struct Raft<T: Role> {
    /// The identifier for this server.
    pub id: MemberId,
    /// The logger for this server.
    pub logger: Logger,
    /// Static configuration for this server.
    pub config: RaftConfig,
    /// The latest known cluster membership.
    pub cluster: Cluster,
    /// Volatile and persisted state common to all roles.
    pub state: State,
    /// The replicated log.
    pub log: Log,
    pub meta: Box<dyn MetaStore>,
    pub snapshots: Box<dyn SnapshotStore>,
    /// Outgoing messages, routed by the server loop.
    pub rpc_tx: mpsc::UnboundedSender<Message>,
    /// Committed entries and queries bound for the state-machine context.
    pub fsm_tx: mpsc::UnboundedSender<Instruction>,
    pub watches: Watches,
    /// Role-specific state and behavior.
    pub role: T,
}

impl<T: Role> Raft<T> {
    pub(crate) fn log_command(&self, command: &Command) {
        debug!(self.role.log(), "applying"; "command" => format!("{:?}", command));
    }

    /// Queue a message for the server loop to route.
    pub fn send(&self, to: Address, command: Command) -> Result<()> {
        self.rpc_tx
            .send(Message::new(to, Address::Peer(self.id), command))?;
        Ok(())
    }

    /// Checks the status of the election timer.
    pub fn needs_election(&self) -> bool {
        match (self.state.election_time, self.state.election_timeout) {
            (Some(time), Some(timeout)) => time.elapsed() > timeout,
            _ => false,
        }
    }

    /// Restart the election timer with a fresh randomized timeout in
    /// [election_timeout, 2 * election_timeout).
    pub fn reset_election_timer(&mut self) {
        let base = self.config.election_timeout_ms;
        let timeout = rand::thread_rng().gen_range(base..base * 2);
        self.state.election_time = Some(Instant::now());
        self.state.election_timeout = Some(Duration::from_millis(timeout));
    }

    /// Observe a term. A higher term is persisted before anything else
    /// happens in it; the vote and leader hint are cleared.
    pub fn set_term(&mut self, term: Term) -> Result<()> {
        if term <= self.state.current_term {
            return Ok(());
        }
        self.meta.store_term(term)?;
        self.meta.store_vote(None)?;
        self.state.current_term = term;
        self.state.voted_for = None;
        self.state.leader = None;
        self.role.term(term);
        Ok(())
    }

    /// Update the leader hint. Ignored for ids outside the current
    /// configuration; listeners fire once per distinct leader per term.
    pub fn set_leader(&mut self, leader: Option<MemberId>) {
        if let Some(id) = leader {
            if self.cluster.member(id).is_none() {
                return;
            }
        }
        self.state.leader = leader;
        if let Some(id) = leader {
            let announcement = (self.state.current_term, id);
            if self.state.announced != Some(announcement) {
                self.state.announced = Some(announcement);
                info!(self.role.log(), "leader elected"; "leader" => id, "term" => self.state.current_term);
                let _ = self.watches.leader.send(LeaderChange {
                    term: self.state.current_term,
                    leader,
                });
            }
        }
    }

    /// Cast a vote and persist it before it is externalized.
    pub(crate) fn record_vote(&mut self, candidate: MemberId) -> Result<()> {
        self.meta.store_vote(Some(candidate))?;
        self.state.voted_for = Some(candidate);
        Ok(())
    }

    /// Advance the commit index to `to` (clamped to the log), committing
    /// configurations as they are crossed and handing each newly
    /// committed entry to the state-machine context. `caller_for` lets the
    /// leader attach the waiting client to an entry it proposed.
    pub(crate) fn advance_commit(
        &mut self,
        to: LogIndex,
        mut caller_for: impl FnMut(&Entry) -> Option<crate::rpc::Caller>,
    ) -> Result<()> {
        let to = to.min(self.log.last_index());
        while self.state.commit_index < to {
            let index = self.state.commit_index + 1;
            let entry = self.log.get(index)?.ok_or_else(|| {
                Error::ProtocolError(format!("committed entry {} missing from log", index))
            })?;
            if let EntryKind::Configuration { .. } = entry.kind {
                self.cluster.commit(index);
                self.meta.store_configuration(self.cluster.configuration())?;
            }
            self.log.commit(index);
            self.state.commit_index = index;
            self.state.last_applied = index;
            let caller = caller_for(&entry);
            self.fsm_tx.send(Instruction::Drive { entry, caller })?;
        }
        Ok(())
    }

    /// Shared append handling for the roles that replicate the log
    /// (follower and passive). The caller has already ruled out a higher
    /// remote term. Returns the local member kind afterwards so the role
    /// can react to a configuration that changed it.
    pub(crate) fn handle_append(
        &mut self,
        term: Term,
        leader: MemberId,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<Entry>,
        commit_index: LogIndex,
    ) -> Result<MemberKind> {
        if term < self.state.current_term {
            let response = Command::AppendResponse {
                term: self.state.current_term,
                from: self.id,
                succeeded: false,
                last_index: self.log.last_index(),
            };
            self.send(Address::Peer(leader), response)?;
            return Ok(self.cluster.kind(self.id));
        }

        self.reset_election_timer();
        self.set_leader(Some(leader));

        let configurations: Vec<(LogIndex, u64, Vec<Member>)> = entries
            .iter()
            .filter_map(|entry| match &entry.kind {
                EntryKind::Configuration { time, members } => {
                    Some((entry.index, *time, members.clone()))
                }
                _ => None,
            })
            .collect();

        let response = match self.log.try_append(prev_index, prev_term, entries)? {
            AppendOutcome::Appended { last_index } => {
                for (index, time, members) in configurations {
                    if index <= last_index {
                        self.cluster.update(Configuration {
                            index,
                            time,
                            members,
                        });
                    }
                }
                self.advance_commit(commit_index.min(last_index), |_| None)?;
                Command::AppendResponse {
                    term: self.state.current_term,
                    from: self.id,
                    succeeded: true,
                    last_index,
                }
            }
            AppendOutcome::Mismatch { hint } => Command::AppendResponse {
                term: self.state.current_term,
                from: self.id,
                succeeded: false,
                last_index: hint,
            },
        };
        self.send(Address::Peer(leader), response)?;
        Ok(self.cluster.kind(self.id))
    }

    /// Shared snapshot installation for follower and passive roles.
    pub(crate) fn handle_install(
        &mut self,
        term: Term,
        leader: MemberId,
        id: Uuid,
        index: LogIndex,
        snapshot_term: Term,
        offset: u64,
        data: Vec<u8>,
        complete: bool,
    ) -> Result<()> {
        if term < self.state.current_term {
            let response = Command::InstallResponse {
                term: self.state.current_term,
                from: self.id,
                succeeded: false,
            };
            return self.send(Address::Peer(leader), response);
        }

        self.reset_election_timer();
        self.set_leader(Some(leader));

        let succeeded = self.install_chunk(id, index, snapshot_term, offset, data, complete)?;
        let response = Command::InstallResponse {
            term: self.state.current_term,
            from: self.id,
            succeeded,
        };
        self.send(Address::Peer(leader), response)
    }

    fn install_chunk(
        &mut self,
        id: Uuid,
        index: LogIndex,
        snapshot_term: Term,
        offset: u64,
        data: Vec<u8>,
        complete: bool,
    ) -> Result<bool> {
        if offset == 0 && !self.snapshots.is_pending(id, index) {
            self.snapshots.create(id, index, snapshot_term)?;
        } else if !self.snapshots.is_pending(id, index) {
            return Ok(false);
        }

        if let Err(err) = self.snapshots.write(id, offset, &data) {
            warn!(self.role.log(), "snapshot chunk rejected"; "error" => err.to_string());
            self.snapshots.abort();
            return Ok(false);
        }

        if complete {
            let snapshot = self.snapshots.commit(id)?;
            self.log.compact(index, snapshot_term)?;
            if self.state.commit_index < index {
                self.state.commit_index = index;
                self.state.last_applied = index;
            }
            info!(self.role.log(), "snapshot installed"; "index" => index, "term" => snapshot_term);
            self.fsm_tx.send(Instruction::Install { snapshot })?;
        }
        Ok(true)
    }

    /// Shared configuration adoption; responds to the leader and returns
    /// the local member kind afterwards.
    pub(crate) fn handle_configure(
        &mut self,
        term: Term,
        leader: MemberId,
        index: LogIndex,
        time: u64,
        members: Vec<Member>,
    ) -> Result<MemberKind> {
        if term >= self.state.current_term {
            self.reset_election_timer();
            self.cluster.update(Configuration {
                index,
                time,
                members,
            });
            self.set_leader(Some(leader));
        }
        let response = Command::ConfigureResponse {
            term: self.state.current_term,
            from: self.id,
        };
        self.send(Address::Peer(leader), response)?;
        Ok(self.cluster.kind(self.id))
    }

    /// Relay a client operation to the leader, or fail it with a leader
    /// hint when there is none.
    pub(crate) fn forward_to_leader(&self, command: Command) -> Result<()> {
        match self.state.leader {
            Some(leader) if leader != self.id => self.send(
                Address::Peer(leader),
                Command::Forward {
                    member: self.id,
                    command: Box::new(command),
                },
            ),
            _ => {
                if let Some(response) = crate::rpc::error_response(
                    &command,
                    None,
                    huck_core::error::ErrorKind::NoLeader,
                ) {
                    if let Some(client) = response.client() {
                        self.send(Address::Client(client), response)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Pass along an operation another server already forwarded. The
    /// origin member is preserved so the leader answers the right server.
    pub(crate) fn relay(&self, member: MemberId, command: Command) -> Result<()> {
        match self.state.leader {
            Some(leader) if leader != self.id => self.send(
                Address::Peer(leader),
                Command::Forward {
                    member,
                    command: Box::new(command),
                },
            ),
            _ => {
                if let Some(response) = crate::rpc::error_response(
                    &command,
                    None,
                    huck_core::error::ErrorKind::NoLeader,
                ) {
                    self.send(Address::Peer(member), response)?;
                }
                Ok(())
            }
        }
    }

    /// The state machine produced a snapshot: make it durable and compact
    /// the log prefix it covers.
    pub(crate) fn handle_snapshot_taken(
        &mut self,
        index: LogIndex,
        term: Term,
        data: Vec<u8>,
    ) -> Result<()> {
        if let Some(current) = self.snapshots.current() {
            if current.index >= index {
                return Ok(());
            }
        }
        let id = Uuid::new_v4();
        self.snapshots.create(id, index, term)?;
        self.snapshots.write(id, 0, &data)?;
        self.snapshots.commit(id)?;
        self.log.compact(index, term)?;
        info!(self.role.log(), "snapshot taken"; "index" => index, "term" => term);
        Ok(())
    }

    /// Swap in a new role, keeping all shared state.
    pub(crate) fn with_role<U: Role>(self, role: U) -> Raft<U> {
        let raft = Raft {
            id: self.id,
            logger: self.logger,
            config: self.config,
            cluster: self.cluster,
            state: self.state,
            log: self.log,
            meta: self.meta,
            snapshots: self.snapshots,
            rpc_tx: self.rpc_tx,
            fsm_tx: self.fsm_tx,
            watches: self.watches,
            role,
        };
        let _ = raft.watches.role.send(raft.role.role());
        raft
    }

    /// Enter the base role for a member kind. Used at startup and when a
    /// configuration change reassigns this member.
    pub(crate) fn into_role_for(self, kind: MemberKind) -> RaftHandle {
        match kind {
            MemberKind::Active => {
                let logger = self.logger.new(o!("role" => "follower"));
                let mut raft = self.with_role(Follower::new(logger));
                raft.reset_election_timer();
                RaftHandle::Follower(raft)
            }
            MemberKind::Passive => {
                let logger = self.logger.new(o!("role" => "passive"));
                RaftHandle::Passive(self.with_role(Passive::new(logger)))
            }
            MemberKind::Reserve => {
                let logger = self.logger.new(o!("role" => "reserve"));
                RaftHandle::Reserve(self.with_role(Reserve::new(logger)))
            }
            MemberKind::Inactive => {
                let logger = self.logger.new(o!("role" => "inactive"));
                RaftHandle::Inactive(self.with_role(Inactive::new(logger)))
            }
        }
    }
}

/// Applying a command is the basic way the state machine is moved
/// forward. Each role implements this trait to handle how it responds (or
/// does not respond) to particular commands.
pub trait Apply {
    /// Apply a command, which may result in a new role. Errors are
    /// reserved for truly exceptional conditions (storage loss, closed
    /// channels) so the server wrapping this state machine can shut down
    /// gracefully.
    fn apply(self, command: Command) -> Result<RaftHandle>;
}

/// Since applying a command can result in any state transition, the
/// result is general over the possible roles.
pub enum RaftHandle {
    Inactive(Raft<Inactive>),
    Reserve(Raft<Reserve>),
    Passive(Raft<Passive>),
    Follower(Raft<Follower>),
    Candidate(Raft<Candidate>),
    Leader(Raft<Leader>),
}

impl RaftHandle {
    /// Build a server in the base role its configured member kind calls
    /// for, recovering persisted term, vote, and configuration.
    pub fn new(
        config: RaftConfig,
        stores: Stores,
        rpc_tx: mpsc::UnboundedSender<Message>,
        fsm_tx: mpsc::UnboundedSender<Instruction>,
        watches: Watches,
        logger: Logger,
    ) -> Result<RaftHandle> {
        config.validate()?;

        let mut state = State::default();
        if let Some(term) = stores.meta.load_term()? {
            state.current_term = term;
        }
        state.voted_for = stores.meta.load_vote()?;

        let configuration = match stores.meta.load_configuration()? {
            Some(configuration) => configuration,
            None => Configuration::bootstrap(config.members.clone()),
        };
        let cluster = Cluster::new(configuration);
        let kind = cluster.kind(config.id);

        let raft = Raft {
            id: config.id,
            logger: logger.new(o!("id" => config.id)),
            config,
            cluster,
            state,
            log: Log::new(stores.log),
            meta: stores.meta,
            snapshots: stores.snapshots,
            rpc_tx,
            fsm_tx,
            watches,
            role: Inactive::new(logger),
        };
        Ok(raft.into_role_for(kind))
    }

    pub fn id(&self) -> MemberId {
        match self {
            RaftHandle::Inactive(raft) => raft.id,
            RaftHandle::Reserve(raft) => raft.id,
            RaftHandle::Passive(raft) => raft.id,
            RaftHandle::Follower(raft) => raft.id,
            RaftHandle::Candidate(raft) => raft.id,
            RaftHandle::Leader(raft) => raft.id,
        }
    }

    pub fn state(&self) -> &State {
        match self {
            RaftHandle::Inactive(raft) => &raft.state,
            RaftHandle::Reserve(raft) => &raft.state,
            RaftHandle::Passive(raft) => &raft.state,
            RaftHandle::Follower(raft) => &raft.state,
            RaftHandle::Candidate(raft) => &raft.state,
            RaftHandle::Leader(raft) => &raft.state,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        match self {
            RaftHandle::Inactive(raft) => &raft.cluster,
            RaftHandle::Reserve(raft) => &raft.cluster,
            RaftHandle::Passive(raft) => &raft.cluster,
            RaftHandle::Follower(raft) => &raft.cluster,
            RaftHandle::Candidate(raft) => &raft.cluster,
            RaftHandle::Leader(raft) => &raft.cluster,
        }
    }

    pub fn role(&self) -> RaftRole {
        match self {
            RaftHandle::Inactive(raft) => raft.role.role(),
            RaftHandle::Reserve(raft) => raft.role.role(),
            RaftHandle::Passive(raft) => raft.role.role(),
            RaftHandle::Follower(raft) => raft.role.role(),
            RaftHandle::Candidate(raft) => raft.role.role(),
            RaftHandle::Leader(raft) => raft.role.role(),
        }
    }

    /// Shut the server down into the terminal role.
    pub fn into_inactive(self) -> RaftHandle {
        match self {
            RaftHandle::Inactive(raft) => RaftHandle::Inactive(raft),
            RaftHandle::Reserve(raft) => raft.into_role_for(MemberKind::Inactive),
            RaftHandle::Passive(raft) => raft.into_role_for(MemberKind::Inactive),
            RaftHandle::Follower(raft) => raft.into_role_for(MemberKind::Inactive),
            RaftHandle::Candidate(raft) => raft.into_role_for(MemberKind::Inactive),
            RaftHandle::Leader(raft) => raft.into_role_for(MemberKind::Inactive),
        }
    }
}

impl Apply for RaftHandle {
    fn apply(self, command: Command) -> Result<RaftHandle> {
        match self {
            RaftHandle::Inactive(raft) => raft.apply(command),
            RaftHandle::Reserve(raft) => raft.apply(command),
            RaftHandle::Passive(raft) => raft.apply(command),
            RaftHandle::Follower(raft) => raft.apply(command),
            RaftHandle::Candidate(raft) => raft.apply(command),
            RaftHandle::Leader(raft) => raft.apply(command),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::{Member, MemberKind};
    use crate::fsm::Instruction;
    use futures::FutureExt;
    use std::net::SocketAddr;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    pub(crate) fn test_config(id: MemberId, voters: &[MemberId]) -> RaftConfig {
        let members = voters
            .iter()
            .map(|id| Member::new(*id, test_addr(9000 + *id as u16), MemberKind::Active))
            .collect();
        let mut config = RaftConfig::default();
        config.id = id;
        config.port = 9000 + id as u16;
        config.members = members;
        config
    }

    pub(crate) struct Harness {
        pub raft: Option<RaftHandle>,
        pub rpc_rx: UnboundedReceiver<Message>,
        pub fsm_rx: UnboundedReceiver<Instruction>,
        pub leader_rx: watch::Receiver<LeaderChange>,
        pub role_rx: watch::Receiver<RaftRole>,
    }

    impl Harness {
        pub(crate) fn new(id: MemberId, voters: &[MemberId]) -> Harness {
            Self::with_config(test_config(id, voters))
        }

        pub(crate) fn with_config(config: RaftConfig) -> Harness {
            let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
            let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
            let (watches, leader_rx, role_rx) = Watches::new();
            let logger = huck_core::logger::get_root_logger().new(o!());
            let raft = RaftHandle::new(
                config,
                Stores::in_memory(),
                rpc_tx,
                fsm_tx,
                watches,
                logger,
            )
            .unwrap();
            Harness {
                raft: Some(raft),
                rpc_rx,
                fsm_rx,
                leader_rx,
                role_rx,
            }
        }

        pub(crate) fn apply(&mut self, command: Command) {
            let raft = self.raft.take().unwrap();
            self.raft = Some(raft.apply(command).unwrap());
        }

        pub(crate) fn sent(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Some(Some(msg)) = self.rpc_rx.recv().now_or_never() {
                messages.push(msg);
            }
            messages
        }

        pub(crate) fn driven(&mut self) -> Vec<Instruction> {
            let mut instructions = Vec::new();
            while let Some(Some(instruction)) = self.fsm_rx.recv().now_or_never() {
                instructions.push(instruction);
            }
            instructions
        }

        pub(crate) fn role(&self) -> RaftRole {
            self.raft.as_ref().unwrap().role()
        }
    }

    #[test]
    fn starts_in_the_role_for_its_member_kind() {
        let harness = Harness::new(1, &[1, 2, 3]);
        assert_eq!(harness.role(), RaftRole::Follower);

        let mut config = test_config(4, &[1, 2, 3]);
        config.members.push(Member::new(
            4,
            test_addr(9004),
            MemberKind::Reserve,
        ));
        let harness = Harness::with_config(config);
        assert_eq!(harness.role(), RaftRole::Reserve);
    }

    #[test]
    fn set_term_clears_vote_and_leader() {
        let mut harness = Harness::new(1, &[1, 2, 3]);
        if let Some(RaftHandle::Follower(raft)) = harness.raft.as_mut() {
            raft.state.voted_for = Some(2);
            raft.state.leader = Some(2);
            raft.set_term(5).unwrap();
            assert_eq!(raft.state.current_term, 5);
            assert_eq!(raft.state.voted_for, None);
            assert_eq!(raft.state.leader, None);
            assert_eq!(raft.meta.load_term().unwrap(), Some(5));
            // lower terms are a no-op
            raft.set_term(3).unwrap();
            assert_eq!(raft.state.current_term, 5);
        } else {
            panic!("expected follower");
        }
    }

    #[test]
    fn set_leader_ignores_unknown_members_and_fires_once() {
        let mut harness = Harness::new(1, &[1, 2, 3]);
        if let Some(RaftHandle::Follower(raft)) = harness.raft.as_mut() {
            raft.set_leader(Some(99));
            assert_eq!(raft.state.leader, None);

            raft.set_leader(Some(2));
            raft.set_leader(Some(2));
            assert_eq!(raft.state.leader, Some(2));
        } else {
            panic!("expected follower");
        }
        let change = *harness.leader_rx.borrow();
        assert_eq!(change.leader, Some(2));
    }
}
