use std::net::SocketAddr;

use crate::raft::{LogIndex, MemberId};

/// The role a member plays within the cluster. Active members vote and may
/// lead; passive members receive all committed entries but do not vote;
/// reserve members receive only heartbeats and configuration and are
/// candidates for promotion; inactive members are placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Active,
    Passive,
    Reserve,
    Inactive,
}

/// A single member of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub addr: SocketAddr,
    pub kind: MemberKind,
}

impl Member {
    pub fn new(id: MemberId, addr: SocketAddr, kind: MemberKind) -> Member {
        Member { id, addr, kind }
    }
}

/// A versioned member set. The index is the log index at which this
/// configuration was appended; time is a logical monotonic timestamp that
/// orders configurations independently of log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub index: LogIndex,
    pub time: u64,
    pub members: Vec<Member>,
}

impl Configuration {
    /// The configuration a fresh cluster boots with, before any
    /// configuration entry exists in the log.
    pub fn bootstrap(members: Vec<Member>) -> Configuration {
        Configuration {
            index: 0,
            time: 0,
            members,
        }
    }
}

/// The server's view of cluster membership. A server always operates under
/// its latest known configuration, committed or not; at most one
/// uncommitted configuration exists at a time.
#[derive(Debug, Clone)]
pub struct Cluster {
    configuration: Configuration,
    committed: LogIndex,
}

impl Cluster {
    pub fn new(configuration: Configuration) -> Cluster {
        let committed = configuration.index;
        Cluster {
            configuration,
            committed,
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn members(&self) -> &[Member] {
        &self.configuration.members
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.configuration.members.iter().find(|m| m.id == id)
    }

    pub fn kind(&self, id: MemberId) -> MemberKind {
        self.member(id).map(|m| m.kind).unwrap_or(MemberKind::Inactive)
    }

    pub fn is_voter(&self, id: MemberId) -> bool {
        self.kind(id) == MemberKind::Active
    }

    /// Ids of all voting members.
    pub fn voters(&self) -> Vec<MemberId> {
        self.configuration
            .members
            .iter()
            .filter(|m| m.kind == MemberKind::Active)
            .map(|m| m.id)
            .collect()
    }

    /// Members other than `id` that participate in the protocol at all.
    pub fn remotes(&self, id: MemberId) -> Vec<Member> {
        self.configuration
            .members
            .iter()
            .filter(|m| m.id != id && m.kind != MemberKind::Inactive)
            .cloned()
            .collect()
    }

    /// Number of voters required for a majority.
    pub fn quorum(&self) -> usize {
        self.voters().len() / 2 + 1
    }

    /// Adopt a newer configuration. Returns true if the configuration
    /// changed.
    pub fn update(&mut self, configuration: Configuration) -> bool {
        if configuration.index > self.configuration.index
            || configuration.time > self.configuration.time
        {
            self.configuration = configuration;
            return true;
        }
        false
    }

    /// Record that the commit index has reached `index`. If the current
    /// configuration's entry is at or below it, the configuration becomes
    /// committed and the next membership change may proceed.
    pub fn commit(&mut self, index: LogIndex) {
        if self.configuration.index <= index && self.configuration.index > self.committed {
            self.committed = self.configuration.index;
        }
    }

    pub fn has_uncommitted(&self) -> bool {
        self.configuration.index > self.committed
    }

    /// Logical timestamp for the next configuration change.
    pub fn next_time(&self) -> u64 {
        self.configuration.time + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn cluster_of_three() -> Cluster {
        Cluster::new(Configuration::bootstrap(vec![
            Member::new(1, addr(9001), MemberKind::Active),
            Member::new(2, addr(9002), MemberKind::Active),
            Member::new(3, addr(9003), MemberKind::Active),
        ]))
    }

    #[test]
    fn quorum_counts_only_voters() {
        let mut cluster = cluster_of_three();
        assert_eq!(cluster.quorum(), 2);

        let mut members = cluster.members().to_vec();
        members.push(Member::new(4, addr(9004), MemberKind::Passive));
        members.push(Member::new(5, addr(9005), MemberKind::Reserve));
        cluster.update(Configuration {
            index: 4,
            time: 1,
            members,
        });
        assert_eq!(cluster.voters().len(), 3);
        assert_eq!(cluster.quorum(), 2);
    }

    #[test]
    fn stale_configuration_is_rejected() {
        let mut cluster = cluster_of_three();
        cluster.update(Configuration {
            index: 7,
            time: 2,
            members: vec![Member::new(1, addr(9001), MemberKind::Active)],
        });
        let adopted = cluster.update(Configuration {
            index: 3,
            time: 1,
            members: vec![],
        });
        assert!(!adopted);
        assert_eq!(cluster.configuration().index, 7);
    }

    #[test]
    fn uncommitted_until_commit_crosses_index() {
        let mut cluster = cluster_of_three();
        assert!(!cluster.has_uncommitted());

        let mut members = cluster.members().to_vec();
        members.push(Member::new(4, addr(9004), MemberKind::Reserve));
        cluster.update(Configuration {
            index: 10,
            time: 1,
            members,
        });
        assert!(cluster.has_uncommitted());

        cluster.commit(9);
        assert!(cluster.has_uncommitted());
        cluster.commit(10);
        assert!(!cluster.has_uncommitted());
    }

    #[test]
    fn remotes_exclude_self_and_inactive() {
        let mut cluster = cluster_of_three();
        let mut members = cluster.members().to_vec();
        members.push(Member::new(4, addr(9004), MemberKind::Inactive));
        cluster.update(Configuration {
            index: 2,
            time: 1,
            members,
        });
        let remotes = cluster.remotes(1);
        assert_eq!(remotes.len(), 2);
        assert!(remotes.iter().all(|m| m.id != 1 && m.id != 4));
    }
}
