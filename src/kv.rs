use std::collections::HashMap;

use huck_core::error::{Error, Result};
use huck_raft::fsm::{ApplyContext, Fsm};

/// Commands accepted by the key-value machine, bincode-encoded in command
/// payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Query payload: look up one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvQuery {
    pub key: String,
}

/// Pushed to the issuing session on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// A replicated key-value store. Writes return the previous value of the
/// key and publish a change event to the session that issued them.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore::default()
    }
}

impl Fsm for KvStore {
    fn transition(&mut self, input: Vec<u8>, ctx: &mut ApplyContext) -> Result<Vec<u8>> {
        let command: KvCommand =
            bincode::deserialize(&input).map_err(|e| Error::ApplicationError(e.to_string()))?;
        match command {
            KvCommand::Put { key, value } => {
                let old = self.data.insert(key.clone(), value.clone());
                let event = KvEvent {
                    key,
                    value: Some(value),
                };
                ctx.publish(ctx.session, bincode::serialize(&event)?);
                Ok(old.unwrap_or_default())
            }
            KvCommand::Delete { key } => {
                let old = self.data.remove(&key);
                let event = KvEvent { key, value: None };
                ctx.publish(ctx.session, bincode::serialize(&event)?);
                Ok(old.unwrap_or_default())
            }
        }
    }

    fn query(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let query: KvQuery =
            bincode::deserialize(&input).map_err(|e| Error::ApplicationError(e.to_string()))?;
        Ok(self.data.get(&query.key).cloned().unwrap_or_default())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.data).map_err(Error::from)
    }

    fn restore(&mut self, data: Vec<u8>) -> Result<()> {
        self.data = bincode::deserialize(&data)?;
        Ok(())
    }
}
