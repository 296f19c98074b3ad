use tokio::sync::{mpsc, oneshot};

use huck_core::error::{Error, Result};

use crate::cluster::Member;
use crate::raft::{LogIndex, MemberId, SessionId, Term};
use crate::rpc::{ClientRequest, Command, Consistency, SessionEvent};

/// Cluster metadata as reported to clients.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub leader: Option<MemberId>,
    pub term: Term,
    pub index: LogIndex,
    pub time: u64,
    pub members: Vec<Member>,
    pub sessions: Vec<SessionId>,
}

/// Handle for submitting operations to the local server. Clone freely;
/// every operation is matched to its response by the server loop.
#[derive(Clone)]
pub struct RaftClient {
    tx: mpsc::UnboundedSender<ClientRequest>,
}

impl RaftClient {
    pub fn new(tx: mpsc::UnboundedSender<ClientRequest>) -> RaftClient {
        RaftClient { tx }
    }

    async fn request(
        &self,
        command: Command,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<Command> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ClientRequest {
            command,
            events,
            reply,
        })?;
        Ok(rx.await?)
    }

    /// Register a session. Returns its id and the channel on which the
    /// server pushes events published to the session.
    pub async fn open_session(
        &self,
        name: &str,
        kind: &str,
        timeout_ms: u64,
    ) -> Result<(SessionId, mpsc::UnboundedReceiver<SessionEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let response = self
            .request(
                Command::OpenSession {
                    client: 0,
                    name: name.to_string(),
                    kind: kind.to_string(),
                    timeout_ms,
                },
                Some(event_tx),
            )
            .await?;
        match response {
            Command::SessionResponse {
                session,
                leader,
                error,
                ..
            } => match error {
                None => Ok((session, event_rx)),
                Some(kind) => Err(Error::from_kind(kind, leader)),
            },
            other => Err(unexpected(other)),
        }
    }

    /// Refresh the session and acknowledge results and events the client
    /// has seen. Returns the leader hint.
    pub async fn keep_alive(
        &self,
        session: SessionId,
        ack_sequence: u64,
        ack_event_index: LogIndex,
    ) -> Result<Option<MemberId>> {
        let response = self
            .request(
                Command::KeepAlive {
                    client: 0,
                    session,
                    ack_sequence,
                    ack_event_index,
                },
                None,
            )
            .await?;
        match response {
            Command::SessionResponse { leader, error, .. } => match error {
                None => Ok(leader),
                Some(kind) => Err(Error::from_kind(kind, leader)),
            },
            other => Err(unexpected(other)),
        }
    }

    pub async fn close_session(&self, session: SessionId) -> Result<()> {
        let response = self
            .request(Command::CloseSession { client: 0, session }, None)
            .await?;
        match response {
            Command::SessionResponse { leader, error, .. } => match error {
                None => Ok(()),
                Some(kind) => Err(Error::from_kind(kind, leader)),
            },
            other => Err(unexpected(other)),
        }
    }

    /// Submit a linearizable command. `sequence` must increase by one per
    /// command on the session; retries with the same sequence return the
    /// original result.
    pub async fn propose(
        &self,
        session: SessionId,
        sequence: u64,
        ack_sequence: u64,
        payload: Vec<u8>,
    ) -> Result<(LogIndex, Vec<u8>)> {
        let response = self
            .request(
                Command::Propose {
                    client: 0,
                    session,
                    sequence,
                    ack_sequence,
                    payload,
                },
                None,
            )
            .await?;
        match response {
            Command::ProposeResponse {
                index,
                result,
                leader,
                error,
                ..
            } => match error {
                None => Ok((index, result.unwrap_or_default())),
                Some(kind) => Err(Error::from_kind(kind, leader)),
            },
            other => Err(unexpected(other)),
        }
    }

    /// Read from the state machine at the chosen consistency level. The
    /// query waits until the session has seen (`min_sequence`,
    /// `min_index`).
    pub async fn query(
        &self,
        session: SessionId,
        min_sequence: u64,
        min_index: LogIndex,
        consistency: Consistency,
        payload: Vec<u8>,
    ) -> Result<(LogIndex, Vec<u8>)> {
        let response = self
            .request(
                Command::Query {
                    client: 0,
                    session,
                    min_sequence,
                    min_index,
                    consistency,
                    payload,
                },
                None,
            )
            .await?;
        match response {
            Command::QueryResponse {
                index,
                result,
                leader,
                error,
                ..
            } => match error {
                None => Ok((index, result.unwrap_or_default())),
                Some(kind) => Err(Error::from_kind(kind, leader)),
            },
            other => Err(unexpected(other)),
        }
    }

    pub async fn metadata(&self) -> Result<ClusterInfo> {
        let response = self.request(Command::Metadata { client: 0 }, None).await?;
        match response {
            Command::MetadataResponse {
                leader,
                term,
                index,
                time,
                members,
                sessions,
                error,
                ..
            } => match error {
                None => Ok(ClusterInfo {
                    leader,
                    term,
                    index,
                    time,
                    members,
                    sessions,
                }),
                Some(kind) => Err(Error::from_kind(kind, leader)),
            },
            other => Err(unexpected(other)),
        }
    }

    pub async fn join(&self, member: Member) -> Result<Vec<Member>> {
        self.membership(Command::Join { client: 0, member }).await
    }

    pub async fn leave(&self, member: Member) -> Result<Vec<Member>> {
        self.membership(Command::Leave { client: 0, member }).await
    }

    pub async fn reconfigure(
        &self,
        index: LogIndex,
        time: u64,
        members: Vec<Member>,
    ) -> Result<Vec<Member>> {
        self.membership(Command::Reconfigure {
            client: 0,
            index,
            time,
            members,
        })
        .await
    }

    async fn membership(&self, command: Command) -> Result<Vec<Member>> {
        let response = self.request(command, None).await?;
        match response {
            Command::MembershipResponse {
                members,
                leader,
                error,
                ..
            } => match error {
                None => Ok(members),
                Some(kind) => Err(Error::from_kind(kind, leader)),
            },
            other => Err(unexpected(other)),
        }
    }

    /// Acknowledge events through `index` and ask the server to resend
    /// anything newer. Fire-and-forget.
    pub fn reset(&self, session: SessionId, index: LogIndex) -> Result<()> {
        let (reply, _rx) = oneshot::channel();
        self.tx.send(ClientRequest {
            command: Command::Reset { session, index },
            events: None,
            reply,
        })?;
        Ok(())
    }
}

fn unexpected(command: Command) -> Error {
    Error::ProtocolError(format!("unexpected response: {:?}", command))
}
