use huck_core::error::{Error, Result};

use crate::cluster::{Cluster, Member, MemberKind};
use crate::progress::ReplicationProgress;
use crate::raft::LogIndex;

/// Add `member` to the cluster. New members always enter as reserve
/// learners regardless of the kind they ask for; promotion happens once
/// the append pipeline has caught them up.
pub fn join(cluster: &Cluster, member: Member) -> Result<Vec<Member>> {
    check_quiescent(cluster)?;
    if cluster.member(member.id).is_some() {
        return Err(Error::ConfigurationError(format!(
            "member {} is already in the cluster",
            member.id
        )));
    }
    let mut members = cluster.members().to_vec();
    members.push(Member::new(member.id, member.addr, MemberKind::Reserve));
    Ok(members)
}

/// Remove `member` from the cluster.
pub fn leave(cluster: &Cluster, member: &Member) -> Result<Vec<Member>> {
    check_quiescent(cluster)?;
    if cluster.member(member.id).is_none() {
        return Err(Error::ConfigurationError(format!(
            "member {} is not in the cluster",
            member.id
        )));
    }
    let members: Vec<Member> = cluster
        .members()
        .iter()
        .filter(|m| m.id != member.id)
        .cloned()
        .collect();
    check_voters(&members)?;
    Ok(members)
}

/// Replace the member set wholesale. The caller supplies the
/// configuration version its change was computed against; a stale version
/// is refused rather than silently merged.
pub fn reconfigure(
    cluster: &Cluster,
    index: LogIndex,
    time: u64,
    members: Vec<Member>,
) -> Result<Vec<Member>> {
    check_quiescent(cluster)?;
    let current = cluster.configuration();
    if index != current.index || time != current.time {
        return Err(Error::ConfigurationError(format!(
            "configuration changed since ({}, {}); now ({}, {})",
            index, time, current.index, current.time
        )));
    }
    check_voters(&members)?;
    Ok(members)
}

/// The next promotion the leader should propose, if any learner has
/// caught up: reserve members become passive once within `threshold`
/// entries of the commit index, and passive members become active voters
/// once they have acked the commit index itself.
pub fn promotion(
    cluster: &Cluster,
    progress: &ReplicationProgress,
    commit_index: LogIndex,
    threshold: u64,
) -> Option<Vec<Member>> {
    for member in cluster.members() {
        let caught_up_to = match progress.get(member.id) {
            Some(p) => p.match_index,
            None => continue,
        };
        let promoted = match member.kind {
            MemberKind::Reserve if commit_index.saturating_sub(caught_up_to) <= threshold => {
                MemberKind::Passive
            }
            MemberKind::Passive if caught_up_to >= commit_index && commit_index > 0 => {
                MemberKind::Active
            }
            _ => continue,
        };
        let members = cluster
            .members()
            .iter()
            .map(|m| {
                if m.id == member.id {
                    Member::new(m.id, m.addr, promoted)
                } else {
                    m.clone()
                }
            })
            .collect();
        return Some(members);
    }
    None
}

fn check_quiescent(cluster: &Cluster) -> Result<()> {
    if cluster.has_uncommitted() {
        return Err(Error::ConfigurationError(
            "a configuration change is already in progress".to_string(),
        ));
    }
    Ok(())
}

fn check_voters(members: &[Member]) -> Result<()> {
    if !members.iter().any(|m| m.kind == MemberKind::Active) {
        return Err(Error::ConfigurationError(
            "the cluster must keep at least one active member".to_string(),
        ));
    }
    Ok(())
}
