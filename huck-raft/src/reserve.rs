use slog::Logger;

use huck_core::error::Result;

use crate::raft::{Apply, Raft, RaftHandle, RaftRole, Role, Term};
use crate::rpc::{Address, Command};

/// A member that holds a place in the configuration but replicates
/// nothing: it sees heartbeats and configuration updates only, and is the
/// entry rung of the promotion ladder.
pub struct Reserve {
    pub logger: Logger,
}

impl Reserve {
    pub fn new(logger: Logger) -> Reserve {
        Reserve { logger }
    }
}

impl Role for Reserve {
    fn term(&mut self, _term: Term) {}

    fn role(&self) -> RaftRole {
        RaftRole::Reserve
    }

    fn log(&self) -> &Logger {
        &self.logger
    }
}

impl Apply for Raft<Reserve> {
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
                entries,
                ..
            } => {
                if term >= self.state.current_term {
                    self.set_leader(Some(leader));
                }
                // only heartbeats are acceptable here
                self.send(
                    Address::Peer(leader),
                    Command::AppendResponse {
                        term: self.state.current_term,
                        from: self.id,
                        succeeded: entries.is_empty(),
                        last_index: self.log.last_index(),
                    },
                )?;
                Ok(RaftHandle::Reserve(self))
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
                    info!(self.role.logger, "promoted"; "kind" => format!("{:?}", after));
                    return Ok(self.into_role_for(after));
                }
                Ok(RaftHandle::Reserve(self))
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
                Ok(RaftHandle::Reserve(self))
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
                Ok(RaftHandle::Reserve(self))
            }
            Command::Install { leader, .. } => {
                // reserve members do not hold state
                self.send(
                    Address::Peer(leader),
                    Command::InstallResponse {
                        term: self.state.current_term,
                        from: self.id,
                        succeeded: false,
                    },
                )?;
                Ok(RaftHandle::Reserve(self))
            }
            Command::Forward { member, command } => {
                self.relay(member, *command)?;
                Ok(RaftHandle::Reserve(self))
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
                Ok(RaftHandle::Reserve(self))
            }
            _ => Ok(RaftHandle::Reserve(self)),
        }
    }
}
