use std::collections::HashMap;
use std::time::Duration;

use futures::FutureExt;
use slog::Logger;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use huck_core::error::{Error, Result};
use huck_core::logger::get_root_logger;

use crate::config::RaftConfig;
use crate::fsm::{Driver, Fsm};
use crate::log::MemoryLog;
use crate::meta::FileMetaStore;
use crate::raft::{
    Apply, LeaderChange, MemberId, RaftHandle, RaftRole, SessionId, Stores, Watches,
};
use crate::rpc::{self, Address, ClientId, ClientRequest, Command, Message, SessionEvent};
use crate::snapshot::MemorySnapshotStore;
use crate::tcp;

/// How long the state-machine driver gets to finish in-flight work at
/// shutdown before it is abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A single server: owns the protocol loop, spawns the state-machine
/// driver and the transport tasks, and routes every message between
/// them.
pub struct HuckRaft {
    config: RaftConfig,
    watches: Option<Watches>,
    leader_rx: watch::Receiver<LeaderChange>,
    role_rx: watch::Receiver<RaftRole>,
}

impl HuckRaft {
    pub fn new(config: RaftConfig) -> HuckRaft {
        let (watches, leader_rx, role_rx) = Watches::new();
        HuckRaft {
            config,
            watches: Some(watches),
            leader_rx,
            role_rx,
        }
    }

    /// Observe leader changes; fires once per distinct leader per term.
    pub fn leader_changes(&self) -> watch::Receiver<LeaderChange> {
        self.leader_rx.clone()
    }

    /// Observe this server's role transitions.
    pub fn role_changes(&self) -> watch::Receiver<RaftRole> {
        self.role_rx.clone()
    }

    pub async fn run<T: Fsm + 'static>(
        mut self,
        fsm: T,
        mut client_rx: mpsc::UnboundedReceiver<ClientRequest>,
        shutdown: (broadcast::Sender<()>, broadcast::Receiver<()>),
    ) -> Result<()> {
        self.config.validate()?;
        let logger = get_root_logger().new(o!("id" => self.config.id));

        let (rpc_tx, mut rpc_rx) = mpsc::unbounded_channel();
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(
            logger.new(o!("context" => "state")),
            fsm_rx,
            rpc_tx.clone(),
            fsm,
        );
        let (task, driver_handle) = driver.run(shutdown.0.subscribe()).remote_handle();
        tokio::spawn(task);

        let listener = TcpListener::bind(self.config.addr()).await?;
        tokio::spawn(tcp::listen_task(
            logger.new(o!("context" => "listen")),
            listener,
            rpc_tx.clone(),
            shutdown.0.subscribe(),
        ));

        let stores = match &self.config.data_dir {
            Some(dir) => Stores {
                log: Box::new(MemoryLog::new()),
                meta: Box::new(FileMetaStore::open(dir.clone())?),
                snapshots: Box::new(MemorySnapshotStore::new()),
            },
            None => Stores::in_memory(),
        };
        let watches = match self.watches.take() {
            Some(watches) => watches,
            None => {
                return Err(Error::IllegalMemberState(
                    "server is already running".to_string(),
                ))
            }
        };
        let raft = RaftHandle::new(
            self.config.clone(),
            stores,
            rpc_tx.clone(),
            fsm_tx,
            watches,
            logger.clone(),
        )?;

        let mut router = Router {
            id: self.config.id,
            logger: logger.new(o!("context" => "server")),
            raft: Some(raft),
            rpc_tx,
            pending: HashMap::new(),
            opening: HashMap::new(),
            session_events: HashMap::new(),
            peers: HashMap::new(),
            next_client: 1,
            shutdown_tx: shutdown.0.clone(),
        };

        info!(logger, "server started"; "addr" => self.config.addr().to_string());

        let mut tick = tokio::time::interval(self.config.tick_interval());
        let mut shutdown_rx = shutdown.1;
        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break Ok(()),

                _ = tick.tick() => {
                    if let Err(err) = router.apply(Command::Tick) {
                        break Err(err);
                    }
                }

                Some(message) = rpc_rx.recv() => {
                    if let Err(err) = router.route(message) {
                        break Err(err);
                    }
                }

                Some(request) = client_rx.recv() => {
                    if let Err(err) = router.client(request) {
                        break Err(err);
                    }
                }
            }
        };

        // unwind: close the role, signal the tasks, and give the driver a
        // bounded grace period to drain
        if let Some(handle) = router.raft.take() {
            let _ = handle.into_inactive();
        }
        let _ = shutdown.0.send(());
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, driver_handle).await;
        info!(logger, "server stopped");
        result
    }
}

/// Message routing state for one server loop.
struct Router {
    id: MemberId,
    logger: Logger,
    raft: Option<RaftHandle>,
    rpc_tx: mpsc::UnboundedSender<Message>,
    /// Clients awaiting a response, by correlation id.
    pending: HashMap<ClientId, oneshot::Sender<Command>>,
    /// Event channels registered with open-session requests still in
    /// flight.
    opening: HashMap<ClientId, mpsc::UnboundedSender<SessionEvent>>,
    /// Event channels for established sessions held by local clients.
    session_events: HashMap<SessionId, mpsc::UnboundedSender<SessionEvent>>,
    /// Outbound channels to peer servers.
    peers: HashMap<MemberId, mpsc::UnboundedSender<Message>>,
    next_client: ClientId,
    shutdown_tx: broadcast::Sender<()>,
}

impl Router {
    fn apply(&mut self, command: Command) -> Result<()> {
        let raft = match self.raft.take() {
            Some(raft) => raft,
            None => return Err(Error::IllegalMemberState("server is stopped".to_string())),
        };
        match raft.apply(command) {
            Ok(raft) => {
                self.raft = Some(raft);
                Ok(())
            }
            Err(err) => {
                crit!(self.logger, "server failed"; "error" => err.to_string());
                Err(err)
            }
        }
    }

    fn route(&mut self, message: Message) -> Result<()> {
        match message.to {
            Address::Local => self.incoming(message.command),
            Address::Peer(id) if id == self.id => self.incoming(message.command),
            Address::Peer(id) => self.peer_send(id, message),
            Address::Peers => {
                for member in self.remotes() {
                    self.peer_send(member, message.clone())?;
                }
                Ok(())
            }
            Address::Client(client) => {
                self.deliver(client, message.command);
                Ok(())
            }
            Address::Session(session) => self.publish(session, message),
        }
    }

    /// A message for this server: client responses complete their waiting
    /// oneshot, everything else goes to the role.
    fn incoming(&mut self, command: Command) -> Result<()> {
        if let Some(client) = command.client() {
            self.deliver(client, command);
            return Ok(());
        }
        self.apply(command)
    }

    fn deliver(&mut self, client: ClientId, command: Command) {
        let command = self.enrich(command);
        if let Command::SessionResponse { session, error, .. } = &command {
            // wire the event channel registered at open time to the
            // session id the cluster assigned
            if let Some(events) = self.opening.remove(&client) {
                if error.is_none() {
                    self.session_events.insert(*session, events);
                }
            }
        }
        if let Some(reply) = self.pending.remove(&client) {
            let _ = reply.send(command);
        }
    }

    /// Fill in leader hints and cluster metadata that only the protocol
    /// context knows.
    fn enrich(&self, command: Command) -> Command {
        let hint = self.raft.as_ref().and_then(|raft| raft.state().leader);
        match command {
            Command::SessionResponse {
                client,
                session,
                leader,
                error,
            } => Command::SessionResponse {
                client,
                session,
                leader: leader.or(hint),
                error,
            },
            Command::ProposeResponse {
                client,
                index,
                result,
                leader,
                error,
            } => Command::ProposeResponse {
                client,
                index,
                result,
                leader: leader.or(hint),
                error,
            },
            Command::QueryResponse {
                client,
                index,
                result,
                leader,
                error,
            } => Command::QueryResponse {
                client,
                index,
                result,
                leader: leader.or(hint),
                error,
            },
            Command::MembershipResponse {
                client,
                index,
                time,
                members,
                leader,
                error,
            } => Command::MembershipResponse {
                client,
                index,
                time,
                members,
                leader: leader.or(hint),
                error,
            },
            Command::MetadataResponse {
                client,
                leader,
                term,
                index,
                time,
                members,
                sessions,
                error,
            } => {
                let configuration = self.raft.as_ref().map(|raft| raft.cluster().configuration());
                let (time, members) = match (members.is_empty(), configuration) {
                    (true, Some(configuration)) => {
                        (configuration.time, configuration.members.clone())
                    }
                    _ => (time, members),
                };
                Command::MetadataResponse {
                    client,
                    leader: leader.or(hint),
                    term,
                    index,
                    time,
                    members,
                    sessions,
                    error,
                }
            }
            other => other,
        }
    }

    /// Deliver a published event batch to the local holder of the
    /// session, or relay it to the other servers if the client is
    /// connected elsewhere.
    fn publish(&mut self, session: SessionId, message: Message) -> Result<()> {
        let event = match &message.command {
            Command::Publish {
                event_index,
                previous_index,
                events,
                ..
            } => SessionEvent {
                event_index: *event_index,
                previous_index: *previous_index,
                events: events.clone(),
            },
            _ => return Ok(()),
        };

        if let Some(tx) = self.session_events.get(&session) {
            if tx.send(event).is_err() {
                self.session_events.remove(&session);
            }
            return Ok(());
        }

        if message.from == Address::Local {
            // relayed once, with our own return address so peers do not
            // relay it again
            let mut relayed = message;
            relayed.from = Address::Peer(self.id);
            for member in self.remotes() {
                self.peer_send(member, relayed.clone())?;
            }
        }
        Ok(())
    }

    fn client(&mut self, request: ClientRequest) -> Result<()> {
        let ClientRequest {
            mut command,
            events,
            reply,
        } = request;

        // resets are fire-and-forget
        if matches!(command, Command::Reset { .. }) {
            drop(reply);
            return self.apply(command);
        }

        let client = self.next_client;
        self.next_client += 1;
        rpc::set_client(&mut command, client);
        self.pending.insert(client, reply);
        if let Some(events) = events {
            self.opening.insert(client, events);
        }
        self.apply(command)
    }

    fn remotes(&self) -> Vec<MemberId> {
        self.raft
            .as_ref()
            .map(|raft| {
                raft.cluster()
                    .remotes(self.id)
                    .iter()
                    .map(|m| m.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn peer_send(&mut self, member: MemberId, message: Message) -> Result<()> {
        if !self.peers.contains_key(&member) {
            let addr = self
                .raft
                .as_ref()
                .and_then(|raft| raft.cluster().member(member))
                .map(|m| m.addr);
            let addr = match addr {
                Some(addr) => addr,
                None => return Ok(()),
            };
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(tcp::peer_task(
                self.logger.new(o!("peer" => member)),
                member,
                addr,
                rx,
                self.rpc_tx.clone(),
                self.shutdown_tx.subscribe(),
            ));
            self.peers.insert(member, tx);
        }
        if let Some(tx) = self.peers.get(&member) {
            if tx.send(message).is_err() {
                self.peers.remove(&member);
            }
        }
        Ok(())
    }
}
