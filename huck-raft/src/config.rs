use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use huck_core::error::{Error, Result};

use crate::cluster::{Member, MemberKind};
use crate::raft::MemberId;

/// Configuration for a single server. Everything the engine tunes at
/// runtime is surfaced here so that deployments (and tests) can shrink or
/// stretch the timing envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// The identifier for this server; must appear in `members`.
    pub id: MemberId,
    /// The ip this server listens on.
    pub ip: IpAddr,
    /// The port this server listens on.
    pub port: u16,
    /// The initial cluster membership, including this server. Ignored once
    /// a configuration has been committed to the log.
    pub members: Vec<Member>,
    /// Directory for durable metadata. Metadata is kept in memory when
    /// unset, which is only suitable for tests.
    pub data_dir: Option<PathBuf>,
    /// Granularity of the protocol timer.
    pub tick_interval_ms: u64,
    /// Base election timeout; the effective timeout is randomized in
    /// [election_timeout, 2 * election_timeout).
    pub election_timeout_ms: u64,
    /// Leader heartbeat interval.
    pub heartbeat_interval_ms: u64,
    /// Upper bound on the serialized size of an append batch. A single
    /// entry larger than this is sent alone.
    pub max_batch_bytes: u64,
    /// Appends pipelined per follower before waiting for a response.
    pub max_inflight_appends: usize,
    /// Size of each snapshot transfer chunk.
    pub snapshot_chunk_bytes: usize,
    /// Entries applied between snapshots; zero disables snapshotting.
    pub snapshot_threshold: u64,
    /// Default client session timeout.
    pub session_timeout_ms: u64,
    /// A learner is promoted once its log is within this many entries of
    /// the commit index.
    pub promotion_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let port = 8555;
        RaftConfig {
            id: 1,
            ip,
            port,
            members: vec![Member::new(1, SocketAddr::new(ip, port), MemberKind::Active)],
            data_dir: None,
            tick_interval_ms: 10,
            election_timeout_ms: 300,
            heartbeat_interval_ms: 50,
            max_batch_bytes: 64 * 1024,
            max_inflight_appends: 1,
            snapshot_chunk_bytes: 32 * 1024,
            snapshot_threshold: 4096,
            session_timeout_ms: 5000,
            promotion_threshold: 64,
        }
    }
}

impl RaftConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.members.iter().any(|m| m.id == self.id) {
            return Err(Error::ConfigurationError(format!(
                "member {} is not in the configured member set",
                self.id
            )));
        }
        if self.election_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(Error::ConfigurationError(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(Error::ConfigurationError(
                "heartbeat interval must be shorter than the election timeout".to_string(),
            ));
        }
        if self.max_inflight_appends == 0 {
            return Err(Error::ConfigurationError(
                "max_inflight_appends must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load a configuration from a file, with `HUCK_`-prefixed environment
/// variables layered on top.
pub fn config<P: AsRef<std::path::Path>>(path: P) -> Result<RaftConfig> {
    let mut settings = config::Config::default();
    settings
        .merge(config::File::from(path.as_ref()))
        .map_err(|e| Error::Config(e.to_string()))?
        .merge(config::Environment::with_prefix("HUCK"))
        .map_err(|e| Error::Config(e.to_string()))?;
    let config: RaftConfig = settings
        .try_into()
        .map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        RaftConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_local_member() {
        let mut config = RaftConfig::default();
        config.id = 42;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let mut config = RaftConfig::default();
        config.heartbeat_interval_ms = config.election_timeout_ms;
        assert!(config.validate().is_err());
    }
}
