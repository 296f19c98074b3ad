use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The protocol-visible error classification. Responses carry this over the
/// wire so that clients can decide whether to retry, follow a leader hint,
/// or re-open their session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NoLeader,
    IllegalMemberState,
    UnknownSession,
    UnknownStateMachine,
    CommandFailure,
    QueryFailure,
    ApplicationError,
    ProtocolError,
    ConfigurationError,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("no leader available (hint: {leader:?})")]
    NoLeader { leader: Option<u64> },
    #[error("illegal member state: {0}")]
    IllegalMemberState(String),
    #[error("unknown session {0}")]
    UnknownSession(u64),
    #[error("unknown state machine: {0}")]
    UnknownStateMachine(String),
    #[error("command failed: {0}")]
    CommandFailure(String),
    #[error("query failed: {0}")]
    QueryFailure(String),
    #[error("application error: {0}")]
    ApplicationError(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("channel closed: {0}")]
    Channel(String),
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// The wire classification for this error, if it has one. Infrastructure
    /// errors (io, channels) are not client-visible and map to `None`.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::NoLeader { .. } => Some(ErrorKind::NoLeader),
            Error::IllegalMemberState(_) => Some(ErrorKind::IllegalMemberState),
            Error::UnknownSession(_) => Some(ErrorKind::UnknownSession),
            Error::UnknownStateMachine(_) => Some(ErrorKind::UnknownStateMachine),
            Error::CommandFailure(_) => Some(ErrorKind::CommandFailure),
            Error::QueryFailure(_) => Some(ErrorKind::QueryFailure),
            Error::ApplicationError(_) => Some(ErrorKind::ApplicationError),
            Error::ProtocolError(_) => Some(ErrorKind::ProtocolError),
            Error::ConfigurationError(_) => Some(ErrorKind::ConfigurationError),
            _ => None,
        }
    }

    /// Rebuild a client-side error from a wire classification and an
    /// optional leader hint.
    pub fn from_kind(kind: ErrorKind, leader: Option<u64>) -> Error {
        match kind {
            ErrorKind::NoLeader => Error::NoLeader { leader },
            ErrorKind::IllegalMemberState => Error::IllegalMemberState(String::new()),
            ErrorKind::UnknownSession => Error::UnknownSession(0),
            ErrorKind::UnknownStateMachine => Error::UnknownStateMachine(String::new()),
            ErrorKind::CommandFailure => Error::CommandFailure(String::new()),
            ErrorKind::QueryFailure => Error::QueryFailure(String::new()),
            ErrorKind::ApplicationError => Error::ApplicationError(String::new()),
            ErrorKind::ProtocolError => Error::ProtocolError(String::new()),
            ErrorKind::ConfigurationError => Error::ConfigurationError(String::new()),
        }
    }

    /// Storage failures are fatal to the server: it cannot continue to
    /// participate without durable state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Serialization(_))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Error {
        Error::Channel(e.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Error {
        Error::Channel(e.to_string())
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for Error {
    fn from(e: tokio::sync::broadcast::error::RecvError) -> Error {
        Error::Channel(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Error {
        Error::Serialization(e.to_string())
    }
}
