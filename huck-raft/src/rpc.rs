use huck_core::error::ErrorKind;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::cluster::Member;
use crate::raft::{Entry, LogIndex, MemberId, SessionId, Term};

/// Correlates a client request with its response on the server it was
/// submitted to.
pub type ClientId = u64;

/// Where a message is headed (or came from).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    /// A specific peer server.
    Peer(MemberId),
    /// Every remote peer.
    Peers,
    /// This server.
    Local,
    /// A client awaiting a response on this server.
    Client(ClientId),
    /// The client holding a session, wherever it is connected.
    Session(SessionId),
}

/// Envelope routed between servers and between the internal tasks of one
/// server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub to: Address,
    pub from: Address,
    pub command: Command,
}

impl Message {
    pub fn new(to: Address, from: Address, command: Command) -> Message {
        Message { to, from, command }
    }
}

/// Who asked for an operation: a client connected to this server, or a
/// client whose request another server forwarded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Caller {
    Local(ClientId),
    Remote(MemberId, ClientId),
}

impl Caller {
    /// The address a response to this caller should be sent to.
    pub fn address(&self) -> Address {
        match self {
            Caller::Local(client) => Address::Client(*client),
            Caller::Remote(member, _) => Address::Peer(*member),
        }
    }

    pub fn client(&self) -> ClientId {
        match self {
            Caller::Local(client) => *client,
            Caller::Remote(_, client) => *client,
        }
    }
}

/// Query consistency levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Linearizable: recorded in the log and answered once committed.
    Strict,
    /// Answered by the leader if it has heard from a majority within the
    /// election timeout.
    Lease,
    /// Answered by any server, gated on session consistency.
    Eventual,
}

/// Commands that can be applied to the role state machine. Peer-to-peer
/// requests, client operations, and local control signals all flow
/// through here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Move the state machine forward.
    Tick,
    /// The transport could not deliver to a member.
    Unreachable { member: MemberId },
    /// The state machine found sessions that outlived their timeout.
    Expire { sessions: Vec<SessionId> },
    /// The state machine produced a snapshot of its state.
    Snapshot {
        index: LogIndex,
        term: Term,
        data: Vec<u8>,
    },
    /// A non-leader relays a client operation to the leader.
    Forward {
        member: MemberId,
        command: Box<Command>,
    },

    /// Pre-vote: ask whether a vote request at this log position would
    /// succeed, without disturbing any term.
    Poll {
        term: Term,
        candidate: MemberId,
        last_index: LogIndex,
        last_term: Term,
    },
    PollResponse {
        term: Term,
        from: MemberId,
        accepted: bool,
    },
    /// Request that this server vote for the candidate.
    Vote {
        term: Term,
        candidate: MemberId,
        last_index: LogIndex,
        last_term: Term,
    },
    VoteResponse {
        term: Term,
        from: MemberId,
        voted: bool,
    },

    /// Replicate entries; empty entries is a heartbeat.
    Append {
        term: Term,
        leader: MemberId,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<Entry>,
        commit_index: LogIndex,
    },
    AppendResponse {
        term: Term,
        from: MemberId,
        succeeded: bool,
        last_index: LogIndex,
    },
    /// One chunk of a snapshot transfer.
    Install {
        term: Term,
        leader: MemberId,
        id: Uuid,
        index: LogIndex,
        snapshot_term: Term,
        offset: u64,
        data: Vec<u8>,
        complete: bool,
    },
    InstallResponse {
        term: Term,
        from: MemberId,
        succeeded: bool,
    },
    /// Push the latest configuration to a member.
    Configure {
        term: Term,
        leader: MemberId,
        index: LogIndex,
        time: u64,
        members: Vec<Member>,
    },
    ConfigureResponse {
        term: Term,
        from: MemberId,
    },

    /// Add a member to the cluster as a reserve learner.
    Join { client: ClientId, member: Member },
    /// Remove a member from the cluster.
    Leave { client: ClientId, member: Member },
    /// Replace the member set, conditioned on the configuration version
    /// the caller based its change on.
    Reconfigure {
        client: ClientId,
        index: LogIndex,
        time: u64,
        members: Vec<Member>,
    },
    MembershipResponse {
        client: ClientId,
        index: LogIndex,
        time: u64,
        members: Vec<Member>,
        leader: Option<MemberId>,
        error: Option<ErrorKind>,
    },

    OpenSession {
        client: ClientId,
        name: String,
        kind: String,
        timeout_ms: u64,
    },
    KeepAlive {
        client: ClientId,
        session: SessionId,
        ack_sequence: u64,
        ack_event_index: LogIndex,
    },
    CloseSession {
        client: ClientId,
        session: SessionId,
    },
    SessionResponse {
        client: ClientId,
        session: SessionId,
        leader: Option<MemberId>,
        error: Option<ErrorKind>,
    },

    /// A client command: a linearizable write against the state machine.
    Propose {
        client: ClientId,
        session: SessionId,
        sequence: u64,
        ack_sequence: u64,
        payload: Vec<u8>,
    },
    ProposeResponse {
        client: ClientId,
        index: LogIndex,
        result: Option<Vec<u8>>,
        leader: Option<MemberId>,
        error: Option<ErrorKind>,
    },
    /// A client read with a chosen consistency level, gated on the
    /// session having seen (min_sequence, min_index).
    Query {
        client: ClientId,
        session: SessionId,
        min_sequence: u64,
        min_index: LogIndex,
        consistency: Consistency,
        payload: Vec<u8>,
    },
    QueryResponse {
        client: ClientId,
        index: LogIndex,
        result: Option<Vec<u8>>,
        leader: Option<MemberId>,
        error: Option<ErrorKind>,
    },
    /// Cluster metadata for client bootstrap.
    Metadata { client: ClientId },
    MetadataResponse {
        client: ClientId,
        leader: Option<MemberId>,
        term: Term,
        index: LogIndex,
        time: u64,
        members: Vec<Member>,
        sessions: Vec<SessionId>,
        error: Option<ErrorKind>,
    },

    /// Server-pushed session events produced at `event_index`.
    Publish {
        session: SessionId,
        event_index: LogIndex,
        previous_index: LogIndex,
        events: Vec<Vec<u8>>,
    },
    /// Client acknowledgement: discard event batches at or below `index`
    /// and resend the rest.
    Reset { session: SessionId, index: LogIndex },
}

impl Command {
    /// The term carried by peer requests and responses, used for
    /// staleness detection.
    pub fn term(&self) -> Option<Term> {
        match self {
            Command::Poll { term, .. }
            | Command::PollResponse { term, .. }
            | Command::Vote { term, .. }
            | Command::VoteResponse { term, .. }
            | Command::Append { term, .. }
            | Command::AppendResponse { term, .. }
            | Command::Install { term, .. }
            | Command::InstallResponse { term, .. }
            | Command::Configure { term, .. }
            | Command::ConfigureResponse { term, .. } => Some(*term),
            _ => None,
        }
    }

    /// The client correlation id, for responses that must be routed back
    /// to a waiting client.
    pub fn client(&self) -> Option<ClientId> {
        match self {
            Command::MembershipResponse { client, .. }
            | Command::SessionResponse { client, .. }
            | Command::ProposeResponse { client, .. }
            | Command::QueryResponse { client, .. }
            | Command::MetadataResponse { client, .. } => Some(*client),
            _ => None,
        }
    }

    /// The client correlation id on a request, for operations that expect
    /// a response.
    pub fn request_client(&self) -> Option<ClientId> {
        match self {
            Command::Join { client, .. }
            | Command::Leave { client, .. }
            | Command::Reconfigure { client, .. }
            | Command::OpenSession { client, .. }
            | Command::KeepAlive { client, .. }
            | Command::CloseSession { client, .. }
            | Command::Propose { client, .. }
            | Command::Query { client, .. }
            | Command::Metadata { client } => Some(*client),
            Command::Forward { command, .. } => command.request_client(),
            _ => None,
        }
    }
}

/// Stamp the server-assigned correlation id onto a client request.
pub fn set_client(command: &mut Command, id: ClientId) {
    match command {
        Command::Join { client, .. }
        | Command::Leave { client, .. }
        | Command::Reconfigure { client, .. }
        | Command::OpenSession { client, .. }
        | Command::KeepAlive { client, .. }
        | Command::CloseSession { client, .. }
        | Command::Propose { client, .. }
        | Command::Query { client, .. }
        | Command::Metadata { client } => *client = id,
        _ => {}
    }
}

/// Build the error response matching a client request, if the request
/// expects one.
pub fn error_response(
    command: &Command,
    leader: Option<MemberId>,
    kind: ErrorKind,
) -> Option<Command> {
    match command {
        Command::Join { client, .. }
        | Command::Leave { client, .. }
        | Command::Reconfigure { client, .. } => Some(Command::MembershipResponse {
            client: *client,
            index: 0,
            time: 0,
            members: vec![],
            leader,
            error: Some(kind),
        }),
        Command::OpenSession { client, .. } => Some(Command::SessionResponse {
            client: *client,
            session: 0,
            leader,
            error: Some(kind),
        }),
        Command::KeepAlive {
            client, session, ..
        }
        | Command::CloseSession { client, session } => Some(Command::SessionResponse {
            client: *client,
            session: *session,
            leader,
            error: Some(kind),
        }),
        Command::Propose { client, .. } => Some(Command::ProposeResponse {
            client: *client,
            index: 0,
            result: None,
            leader,
            error: Some(kind),
        }),
        Command::Query { client, .. } => Some(Command::QueryResponse {
            client: *client,
            index: 0,
            result: None,
            leader,
            error: Some(kind),
        }),
        Command::Metadata { client } => Some(Command::MetadataResponse {
            client: *client,
            leader,
            term: 0,
            index: 0,
            time: 0,
            members: vec![],
            sessions: vec![],
            error: Some(kind),
        }),
        Command::Forward { command, .. } => error_response(command, leader, kind),
        _ => None,
    }
}

/// A client operation submitted through [`crate::client::RaftClient`],
/// paired with its reply channel. Session opens additionally register a
/// channel for server-pushed events.
#[derive(Debug)]
pub struct ClientRequest {
    pub command: Command,
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
    pub reply: oneshot::Sender<Command>,
}

/// A batch of events pushed to the client that holds a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub event_index: LogIndex,
    pub previous_index: LogIndex,
    pub events: Vec<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_extraction_covers_peer_messages() {
        let cmd = Command::Append {
            term: 3,
            leader: 1,
            prev_index: 0,
            prev_term: 0,
            entries: vec![],
            commit_index: 0,
        };
        assert_eq!(cmd.term(), Some(3));
        assert_eq!(Command::Tick.term(), None);
    }

    #[test]
    fn client_extraction_covers_responses() {
        let cmd = Command::ProposeResponse {
            client: 9,
            index: 4,
            result: None,
            leader: None,
            error: None,
        };
        assert_eq!(cmd.client(), Some(9));
        let cmd = Command::Propose {
            client: 9,
            session: 1,
            sequence: 1,
            ack_sequence: 0,
            payload: vec![],
        };
        assert_eq!(cmd.client(), None);
    }

    #[test]
    fn caller_addresses() {
        assert_eq!(Caller::Local(4).address(), Address::Client(4));
        assert_eq!(Caller::Remote(2, 4).address(), Address::Peer(2));
        assert_eq!(Caller::Remote(2, 4).client(), 4);
    }

    #[test]
    fn messages_serialize_for_the_wire() {
        let msg = Message::new(
            Address::Peer(2),
            Address::Peer(1),
            Command::Vote {
                term: 2,
                candidate: 1,
                last_index: 10,
                last_term: 1,
            },
        );
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.to, Address::Peer(2));
        match decoded.command {
            Command::Vote { term, candidate, .. } => {
                assert_eq!((term, candidate), (2, 1));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
