use slog::Logger;

use huck_core::error::{ErrorKind, Result};

use crate::raft::{Apply, Raft, RaftHandle, RaftRole, Role, Term};
use crate::rpc::{self, Address, Command};

/// A placeholder or shut-down member. Accepts configuration updates, in
/// case the cluster reassigns it a live role, and refuses everything
/// else.
pub struct Inactive {
    pub logger: Logger,
}

impl Inactive {
    pub fn new(logger: Logger) -> Inactive {
        Inactive { logger }
    }
}

impl Role for Inactive {
    fn term(&mut self, _term: Term) {}

    fn role(&self) -> RaftRole {
        RaftRole::Inactive
    }

    fn log(&self) -> &Logger {
        &self.logger
    }
}

impl Apply for Raft<Inactive> {
    fn apply(mut self, command: Command) -> Result<RaftHandle> {
        self.log_command(&command);

        match command {
            Command::Configure {
                term,
                leader,
                index,
                time,
                members,
            } => {
                if term > self.state.current_term {
                    self.set_term(term)?;
                }
                let before = self.cluster.kind(self.id);
                let after = self.handle_configure(term, leader, index, time, members)?;
                if after != before {
                    info!(self.role.logger, "reactivated"; "kind" => format!("{:?}", after));
                    return Ok(self.into_role_for(after));
                }
                Ok(RaftHandle::Inactive(self))
            }
            cmd => {
                if let Some(response) =
                    rpc::error_response(&cmd, None, ErrorKind::IllegalMemberState)
                {
                    if let Some(client) = response.client() {
                        self.send(Address::Client(client), response)?;
                    }
                }
                Ok(RaftHandle::Inactive(self))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Member, MemberKind};
    use crate::raft::tests::{test_addr, test_config, Harness};
    use crate::raft::RaftRole;

    fn inactive_harness() -> Harness {
        let mut config = test_config(4, &[1, 2, 3]);
        config
            .members
            .push(Member::new(4, test_addr(9004), MemberKind::Inactive));
        Harness::with_config(config)
    }

    #[test]
    fn refuses_client_operations() {
        let mut harness = inactive_harness();
        assert_eq!(harness.role(), RaftRole::Inactive);
        harness.apply(Command::Propose {
            client: 3,
            session: 1,
            sequence: 1,
            ack_sequence: 0,
            payload: vec![],
        });
        match &harness.sent()[0].command {
            Command::ProposeResponse { error, .. } => {
                assert_eq!(error, &Some(ErrorKind::IllegalMemberState));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn configuration_can_reactivate() {
        let mut harness = inactive_harness();
        let members: Vec<Member> = harness
            .raft
            .as_ref()
            .unwrap()
            .cluster()
            .members()
            .iter()
            .map(|m| {
                if m.id == 4 {
                    Member::new(4, m.addr, MemberKind::Reserve)
                } else {
                    m.clone()
                }
            })
            .collect();
        harness.apply(Command::Configure {
            term: 1,
            leader: 1,
            index: 5,
            time: 1,
            members,
        });
        assert_eq!(harness.role(), RaftRole::Reserve);
    }
}
