use std::collections::{BTreeMap, HashSet};

use slog::Logger;
use tokio::sync::mpsc;

use huck_core::error::{ErrorKind, Result};

use crate::raft::{Entry, EntryKind, LogIndex, SessionId, Term};
use crate::rpc::{Address, Caller, Command, Message};
use crate::session::{CommandOutcome, SessionRegistry};
use crate::snapshot::Snapshot;

/// The replicated application state machine. Commands arrive exactly
/// once, in log order, on a single thread; queries are read-only.
pub trait Fsm: Send + Sync {
    /// Apply a committed command and return its result. Events published
    /// through the context are queued on sessions and pushed to clients.
    fn transition(&mut self, input: Vec<u8>, ctx: &mut ApplyContext) -> Result<Vec<u8>>;

    /// Answer a read-only query against current state.
    fn query(&self, input: Vec<u8>) -> Result<Vec<u8>>;

    /// Serialize the machine's state.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the machine's state with a snapshot.
    fn restore(&mut self, data: Vec<u8>) -> Result<()>;

    fn session_opened(&mut self, _session: SessionId) {}
    fn session_expired(&mut self, _session: SessionId) {}
    fn session_closed(&mut self, _session: SessionId) {}
}

/// Context handed to the state machine while it applies one command.
pub struct ApplyContext {
    /// Log index of the entry being applied.
    pub index: LogIndex,
    /// Logical state-machine time, in milliseconds.
    pub time: u64,
    /// The session the command arrived on.
    pub session: SessionId,
    events: Vec<(SessionId, Vec<u8>)>,
}

impl ApplyContext {
    /// Public so embedders can unit-test their state machines.
    pub fn new(index: LogIndex, time: u64, session: SessionId) -> ApplyContext {
        ApplyContext {
            index,
            time,
            session,
            events: Vec::new(),
        }
    }

    /// Queue an event for delivery to `session`.
    pub fn publish(&mut self, session: SessionId, event: Vec<u8>) {
        self.events.push((session, event));
    }
}

/// Work submitted to the state-machine context.
#[derive(Debug)]
pub enum Instruction {
    /// Apply a committed entry. `caller` is set when a client on this
    /// cluster awaits the result.
    Drive {
        entry: Entry,
        caller: Option<Caller>,
    },
    /// Answer a query once the session has seen (min_sequence, min_index).
    Query {
        caller: Caller,
        session: SessionId,
        min_sequence: u64,
        min_index: LogIndex,
        payload: Vec<u8>,
    },
    /// Replace state with an installed snapshot.
    Install { snapshot: Snapshot },
    /// Produce a snapshot of current state.
    Snapshot,
    /// The client acknowledged events through `index`; discard them and
    /// resend the rest.
    Reset { session: SessionId, index: LogIndex },
    /// This server gained or lost leadership.
    Leader { local: bool },
}

struct PendingQuery {
    caller: Caller,
    session: SessionId,
    min_sequence: u64,
    min_index: LogIndex,
    payload: Vec<u8>,
}

/// Everything a snapshot must carry: the application's bytes plus the
/// session registry, so a restored server answers retries and resends
/// events exactly like the one that took the snapshot.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    time: u64,
    sessions: SessionRegistry,
    data: Vec<u8>,
}

/// Drives the state machine on its own execution context: applies
/// committed entries in index order, owns every session, and pushes
/// events while this server leads.
pub struct Driver<T: Fsm> {
    logger: Logger,
    fsm_rx: mpsc::UnboundedReceiver<Instruction>,
    rpc_tx: mpsc::UnboundedSender<Message>,
    fsm: T,
    sessions: SessionRegistry,
    pending: Vec<PendingQuery>,
    applied_index: LogIndex,
    applied_term: Term,
    /// Logical time: the maximum entry timestamp seen.
    time: u64,
    is_leader: bool,
    /// Sessions already proposed for expiration, awaiting their close
    /// entries.
    expiring: HashSet<SessionId>,
}

impl<T: Fsm> Driver<T> {
    pub fn new(
        logger: Logger,
        fsm_rx: mpsc::UnboundedReceiver<Instruction>,
        rpc_tx: mpsc::UnboundedSender<Message>,
        fsm: T,
    ) -> Self {
        Self {
            logger,
            fsm_rx,
            rpc_tx,
            fsm,
            sessions: SessionRegistry::new(),
            pending: Vec::new(),
            applied_index: 0,
            applied_term: 0,
            time: 0,
            is_leader: false,
            expiring: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        debug!(self.logger, "starting driver");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                instruction = self.fsm_rx.recv() => {
                    match instruction {
                        Some(instruction) => self.exec(instruction)?,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    pub fn exec(&mut self, instruction: Instruction) -> Result<()> {
        debug!(self.logger, "exec"; "instruction" => format!("{:?}", &instruction));

        match instruction {
            Instruction::Drive { entry, caller } => {
                self.drive(entry, caller)?;
                self.flush_queries()?;
                if self.is_leader {
                    self.sweep()?;
                }
            }
            Instruction::Query {
                caller,
                session,
                min_sequence,
                min_index,
                payload,
            } => {
                let query = PendingQuery {
                    caller,
                    session,
                    min_sequence,
                    min_index,
                    payload,
                };
                if let Some(query) = self.try_query(query)? {
                    self.pending.push(query);
                }
            }
            Instruction::Install { snapshot } => self.install(snapshot)?,
            Instruction::Snapshot => self.take_snapshot()?,
            Instruction::Reset { session, index } => {
                if let Some(s) = self.sessions.get_mut(session) {
                    s.ack_events(index);
                }
                if self.is_leader {
                    self.resend_events(session)?;
                }
            }
            Instruction::Leader { local } => {
                self.is_leader = local;
                if local {
                    // retained batches go out again after a failover
                    for session in self.sessions.ids() {
                        self.resend_events(session)?;
                    }
                }
            }
        };

        Ok(())
    }

    fn respond(&self, to: Address, command: Command) -> Result<()> {
        self.rpc_tx
            .send(Message::new(to, Address::Local, command))?;
        Ok(())
    }

    fn drive(&mut self, entry: Entry, caller: Option<Caller>) -> Result<()> {
        self.time = self.time.max(entry.time);

        match entry.kind.clone() {
            EntryKind::Initialize => {}
            EntryKind::Configuration { time, members } => {
                if let Some(caller) = caller {
                    self.respond(
                        caller.address(),
                        Command::MembershipResponse {
                            client: caller.client(),
                            index: entry.index,
                            time,
                            members,
                            leader: None,
                            error: None,
                        },
                    )?;
                }
            }
            EntryKind::OpenSession {
                member,
                name,
                kind,
                timeout_ms,
            } => {
                self.sessions
                    .open(entry.index, member, name, kind, timeout_ms, entry.time);
                self.fsm.session_opened(entry.index);
                info!(self.logger, "session opened"; "session" => entry.index);
                if let Some(caller) = caller {
                    self.respond(
                        caller.address(),
                        Command::SessionResponse {
                            client: caller.client(),
                            session: entry.index,
                            leader: None,
                            error: None,
                        },
                    )?;
                }
            }
            EntryKind::CloseSession { session, expired } => {
                if expired {
                    if let Some(s) = self.sessions.get_mut(session) {
                        s.expire();
                    }
                }
                let known = self.sessions.close(session).is_some();
                if known {
                    if expired {
                        self.fsm.session_expired(session);
                    }
                    self.fsm.session_closed(session);
                    info!(self.logger, "session closed"; "session" => session, "expired" => expired);
                }
                self.expiring.remove(&session);
                if let Some(caller) = caller {
                    let error = if known {
                        None
                    } else {
                        Some(ErrorKind::UnknownSession)
                    };
                    self.respond(
                        caller.address(),
                        Command::SessionResponse {
                            client: caller.client(),
                            session,
                            leader: None,
                            error,
                        },
                    )?;
                }
            }
            EntryKind::KeepAlive {
                session,
                ack_sequence,
                ack_event_index,
            } => {
                let known = match self.sessions.get_mut(session) {
                    Some(s) => {
                        s.keep_alive(entry.time);
                        s.ack_results(ack_sequence);
                        s.ack_events(ack_event_index);
                        true
                    }
                    None => false,
                };
                if let Some(caller) = caller {
                    let error = if known {
                        None
                    } else {
                        Some(ErrorKind::UnknownSession)
                    };
                    self.respond(
                        caller.address(),
                        Command::SessionResponse {
                            client: caller.client(),
                            session,
                            leader: None,
                            error,
                        },
                    )?;
                }
            }
            EntryKind::Command {
                session,
                sequence,
                ack_sequence,
                payload,
            } => {
                self.apply_command(entry.index, session, sequence, ack_sequence, payload, caller)?;
            }
            EntryKind::Query {
                session,
                min_sequence,
                min_index,
                payload,
            } => {
                // the entry is committed; only the proposing server has a
                // caller to answer
                if let Some(caller) = caller {
                    let query = PendingQuery {
                        caller,
                        session,
                        min_sequence,
                        min_index,
                        payload,
                    };
                    if let Some(query) = self.try_query(query)? {
                        self.pending.push(query);
                    }
                }
            }
            EntryKind::Metadata => {
                if let Some(caller) = caller {
                    self.respond(
                        caller.address(),
                        Command::MetadataResponse {
                            client: caller.client(),
                            leader: None,
                            term: entry.term,
                            index: entry.index,
                            time: 0,
                            members: vec![],
                            sessions: self.sessions.ids(),
                            error: None,
                        },
                    )?;
                }
            }
        }

        self.applied_index = entry.index;
        self.applied_term = entry.term;
        Ok(())
    }

    fn apply_command(
        &mut self,
        index: LogIndex,
        session: SessionId,
        sequence: u64,
        ack_sequence: u64,
        payload: Vec<u8>,
        caller: Option<Caller>,
    ) -> Result<()> {
        let (command_sequence, cached) = match self.sessions.get(session) {
            Some(s) => (s.command_sequence, s.cached(sequence).cloned()),
            None => {
                if let Some(caller) = caller {
                    self.respond(
                        caller.address(),
                        Command::ProposeResponse {
                            client: caller.client(),
                            index: 0,
                            result: None,
                            leader: None,
                            error: Some(ErrorKind::UnknownSession),
                        },
                    )?;
                }
                return Ok(());
            }
        };

        // retries of an applied sequence return the recorded outcome and
        // never re-invoke the state machine
        if sequence <= command_sequence {
            if let Some(caller) = caller {
                let response = match cached {
                    Some(outcome) => propose_response(&caller, &outcome),
                    None => Command::ProposeResponse {
                        client: caller.client(),
                        index: 0,
                        result: None,
                        leader: None,
                        error: Some(ErrorKind::CommandFailure),
                    },
                };
                self.respond(caller.address(), response)?;
            }
            return Ok(());
        }

        if sequence != command_sequence + 1 {
            if let Some(caller) = caller {
                self.respond(
                    caller.address(),
                    Command::ProposeResponse {
                        client: caller.client(),
                        index: 0,
                        result: None,
                        leader: None,
                        error: Some(ErrorKind::CommandFailure),
                    },
                )?;
            }
            return Ok(());
        }

        let mut ctx = ApplyContext::new(index, self.time, session);
        let result = self
            .fsm
            .transition(payload, &mut ctx)
            .map_err(|e| e.to_string());
        let outcome = CommandOutcome { index, result };

        if let Some(s) = self.sessions.get_mut(session) {
            s.keep_alive(ctx.time);
            s.ack_results(ack_sequence);
            s.record(sequence, outcome.clone());
        }

        // batch events per session at this index
        let mut grouped: BTreeMap<SessionId, Vec<Vec<u8>>> = BTreeMap::new();
        for (sid, event) in ctx.events {
            grouped.entry(sid).or_default().push(event);
        }
        for (sid, events) in grouped {
            let batch = match self.sessions.get_mut(sid) {
                Some(s) => s.publish(index, events),
                None => continue,
            };
            if self.is_leader {
                self.respond(
                    Address::Session(sid),
                    Command::Publish {
                        session: sid,
                        event_index: batch.event_index,
                        previous_index: batch.previous_index,
                        events: batch.events,
                    },
                )?;
            }
        }

        if let Some(caller) = caller {
            self.respond(caller.address(), propose_response(&caller, &outcome))?;
        }
        Ok(())
    }

    /// Execute a query if its session gates are satisfied, otherwise hand
    /// it back to wait.
    fn try_query(&mut self, query: PendingQuery) -> Result<Option<PendingQuery>> {
        let ready = match self.sessions.get(query.session) {
            Some(s) => {
                s.command_sequence >= query.min_sequence && s.last_applied >= query.min_index
            }
            None => {
                self.respond(
                    query.caller.address(),
                    Command::QueryResponse {
                        client: query.caller.client(),
                        index: self.applied_index,
                        result: None,
                        leader: None,
                        error: Some(ErrorKind::UnknownSession),
                    },
                )?;
                return Ok(None);
            }
        };
        if !ready {
            return Ok(Some(query));
        }

        let response = match self.fsm.query(query.payload.clone()) {
            Ok(result) => Command::QueryResponse {
                client: query.caller.client(),
                index: self.applied_index,
                result: Some(result),
                leader: None,
                error: None,
            },
            Err(err) => {
                debug!(self.logger, "query failed"; "error" => err.to_string());
                Command::QueryResponse {
                    client: query.caller.client(),
                    index: self.applied_index,
                    result: None,
                    leader: None,
                    error: Some(ErrorKind::QueryFailure),
                }
            }
        };
        self.respond(query.caller.address(), response)?;
        Ok(None)
    }

    fn flush_queries(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for query in pending {
            if let Some(query) = self.try_query(query)? {
                self.pending.push(query);
            }
        }
        Ok(())
    }

    /// Propose close entries for sessions whose timeout has lapsed in
    /// logical time. Only the leader proposes; the closes themselves
    /// arrive back through the log.
    fn sweep(&mut self) -> Result<()> {
        let stale: Vec<SessionId> = self
            .sessions
            .stale(self.time)
            .into_iter()
            .filter(|id| !self.expiring.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        info!(self.logger, "sessions timed out"; "sessions" => format!("{:?}", stale));
        self.expiring.extend(stale.iter().copied());
        self.respond(Address::Local, Command::Expire { sessions: stale })
    }

    fn resend_events(&self, session: SessionId) -> Result<()> {
        if let Some(s) = self.sessions.get(session) {
            for batch in s.pending_events() {
                self.respond(
                    Address::Session(session),
                    Command::Publish {
                        session,
                        event_index: batch.event_index,
                        previous_index: batch.previous_index,
                        events: batch.events.clone(),
                    },
                )?;
            }
        }
        Ok(())
    }

    fn install(&mut self, snapshot: Snapshot) -> Result<()> {
        let payload: SnapshotPayload = bincode::deserialize(&snapshot.data)?;
        self.fsm.restore(payload.data)?;
        self.sessions = payload.sessions;
        self.time = self.time.max(payload.time);
        self.applied_index = snapshot.index;
        self.applied_term = snapshot.term;
        self.pending.clear();
        info!(self.logger, "state restored from snapshot"; "index" => snapshot.index);
        Ok(())
    }

    fn take_snapshot(&mut self) -> Result<()> {
        let payload = SnapshotPayload {
            time: self.time,
            sessions: self.sessions.clone(),
            data: self.fsm.snapshot()?,
        };
        self.respond(
            Address::Local,
            Command::Snapshot {
                index: self.applied_index,
                term: self.applied_term,
                data: bincode::serialize(&payload)?,
            },
        )
    }
}

fn propose_response(caller: &Caller, outcome: &CommandOutcome) -> Command {
    Command::ProposeResponse {
        client: caller.client(),
        index: outcome.index,
        result: outcome.result.as_ref().ok().cloned(),
        leader: None,
        error: outcome
            .result
            .as_ref()
            .err()
            .map(|_| ErrorKind::ApplicationError),
    }
}
