use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::raft::{LogIndex, MemberId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Expired,
    Closed,
}

/// The exact response recorded for an applied command, kept until the
/// client acknowledges it so that a retried (session, sequence) pair gets
/// an identical answer. Application failures are results too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub index: LogIndex,
    pub result: std::result::Result<Vec<u8>, String>,
}

/// Events published while applying the entry at `event_index`.
/// `previous_index` chains batches so a client can detect gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub event_index: LogIndex,
    pub previous_index: LogIndex,
    pub events: Vec<Vec<u8>>,
}

/// A client's logical presence in the cluster, anchored at the index of
/// its open-session entry. Mutated only on the state-machine context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// The member the client opened the session through.
    pub member: MemberId,
    pub name: String,
    pub kind: String,
    pub timeout_ms: u64,
    pub state: SessionState,
    /// Logical time of the last keep-alive or command.
    pub timestamp: u64,
    /// Highest command sequence received.
    pub request_sequence: u64,
    /// Highest command sequence applied.
    pub command_sequence: u64,
    /// Index of the last entry applied for this session.
    pub last_applied: LogIndex,
    /// Index at which events were last published.
    pub event_index: LogIndex,
    /// Highest event index the client has acknowledged.
    pub complete_index: LogIndex,
    results: BTreeMap<u64, CommandOutcome>,
    events: VecDeque<EventBatch>,
}

impl Session {
    fn new(
        id: SessionId,
        member: MemberId,
        name: String,
        kind: String,
        timeout_ms: u64,
        timestamp: u64,
    ) -> Session {
        Session {
            id,
            member,
            name,
            kind,
            timeout_ms,
            state: SessionState::Open,
            timestamp,
            request_sequence: 0,
            command_sequence: 0,
            last_applied: 0,
            event_index: 0,
            complete_index: 0,
            results: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// The cached outcome for an already-applied sequence, if it has not
    /// been acknowledged away.
    pub fn cached(&self, sequence: u64) -> Option<&CommandOutcome> {
        self.results.get(&sequence)
    }

    /// Record the outcome of the next command in sequence order.
    pub fn record(&mut self, sequence: u64, outcome: CommandOutcome) {
        self.request_sequence = self.request_sequence.max(sequence);
        self.command_sequence = sequence;
        self.last_applied = outcome.index;
        self.results.insert(sequence, outcome);
    }

    /// Drop cached results the client has acknowledged.
    pub fn ack_results(&mut self, ack_sequence: u64) {
        self.results = self.results.split_off(&(ack_sequence + 1));
    }

    /// Queue a batch of events produced at `index`.
    pub fn publish(&mut self, index: LogIndex, events: Vec<Vec<u8>>) -> EventBatch {
        let batch = EventBatch {
            event_index: index,
            previous_index: self.event_index,
            events,
        };
        self.event_index = index;
        self.events.push_back(batch.clone());
        batch
    }

    /// Drop event batches the client has acknowledged through `index`.
    pub fn ack_events(&mut self, index: LogIndex) {
        while self
            .events
            .front()
            .map(|b| b.event_index <= index)
            .unwrap_or(false)
        {
            self.events.pop_front();
        }
        self.complete_index = self.complete_index.max(index);
    }

    /// Batches not yet acknowledged, oldest first.
    pub fn pending_events(&self) -> impl Iterator<Item = &EventBatch> {
        self.events.iter()
    }

    /// Mark the session expired; it is closed (and forgotten) right
    /// after.
    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
    }

    pub fn keep_alive(&mut self, timestamp: u64) {
        self.timestamp = self.timestamp.max(timestamp);
    }

    pub fn expired_at(&self, now: u64) -> bool {
        now > self.timestamp + self.timeout_ms
    }
}

/// All live sessions, owned by the state-machine manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn open(
        &mut self,
        id: SessionId,
        member: MemberId,
        name: String,
        kind: String,
        timeout_ms: u64,
        timestamp: u64,
    ) -> &Session {
        self.sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, member, name, kind, timeout_ms, timestamp))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Remove a session; CLOSED is terminal, so the registry forgets it.
    pub fn close(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Sessions whose timeout elapsed before `now`.
    pub fn stale(&self, now: u64) -> Vec<SessionId> {
        let mut stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_open() && s.expired_at(now))
            .map(|s| s.id)
            .collect();
        stale.sort_unstable();
        stale
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(10, 1, "client".to_string(), "test".to_string(), 5000, 1000)
    }

    #[test]
    fn results_are_cached_until_acked() {
        let mut s = session();
        s.record(
            1,
            CommandOutcome {
                index: 11,
                result: Ok(vec![1]),
            },
        );
        s.record(
            2,
            CommandOutcome {
                index: 12,
                result: Ok(vec![2]),
            },
        );
        assert_eq!(s.command_sequence, 2);
        assert_eq!(s.cached(1).unwrap().result, Ok(vec![1]));

        s.ack_results(1);
        assert!(s.cached(1).is_none());
        assert!(s.cached(2).is_some());
    }

    #[test]
    fn event_batches_chain_previous_indices() {
        let mut s = session();
        let first = s.publish(11, vec![b"a".to_vec()]);
        assert_eq!(first.previous_index, 0);
        let second = s.publish(14, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(second.previous_index, 11);
        assert_eq!(s.pending_events().count(), 2);

        s.ack_events(11);
        assert_eq!(s.pending_events().count(), 1);
        assert_eq!(s.complete_index, 11);
        s.ack_events(14);
        assert_eq!(s.pending_events().count(), 0);
    }

    #[test]
    fn expiration_is_driven_by_logical_time() {
        let mut registry = SessionRegistry::new();
        registry.open(10, 1, "a".to_string(), "test".to_string(), 5000, 1000);
        registry.open(20, 1, "b".to_string(), "test".to_string(), 5000, 4000);

        assert!(registry.stale(6000).contains(&10));
        assert!(!registry.stale(6000).contains(&20));

        registry.get_mut(10).unwrap().keep_alive(6000);
        assert!(registry.stale(6001).is_empty());
    }

    #[test]
    fn keep_alive_never_rewinds_the_timestamp() {
        let mut s = session();
        s.keep_alive(9000);
        s.keep_alive(4000);
        assert_eq!(s.timestamp, 9000);
    }

    #[test]
    fn close_is_terminal() {
        let mut registry = SessionRegistry::new();
        registry.open(10, 1, "a".to_string(), "test".to_string(), 5000, 1000);
        assert!(registry.close(10).is_some());
        assert!(registry.get(10).is_none());
        assert!(registry.close(10).is_none());
    }
}
