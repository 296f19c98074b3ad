use std::fs;
use std::path::PathBuf;

use huck_core::error::Result;

use crate::cluster::Configuration;
use crate::raft::{MemberId, Term};

/// Durable server metadata. A successful store returns only after the
/// value is stable against a process crash; the engine stores before it
/// acts (a vote is persisted before the reply is sent, a term before any
/// message carries it).
pub trait MetaStore: Send {
    fn load_term(&self) -> Result<Option<Term>>;
    fn store_term(&mut self, term: Term) -> Result<()>;
    fn load_vote(&self) -> Result<Option<MemberId>>;
    fn store_vote(&mut self, vote: Option<MemberId>) -> Result<()>;
    fn load_configuration(&self) -> Result<Option<Configuration>>;
    fn store_configuration(&mut self, configuration: &Configuration) -> Result<()>;
}

/// Volatile metadata for tests.
#[derive(Default)]
pub struct MemoryMetaStore {
    term: Option<Term>,
    vote: Option<MemberId>,
    configuration: Option<Configuration>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn load_term(&self) -> Result<Option<Term>> {
        Ok(self.term)
    }

    fn store_term(&mut self, term: Term) -> Result<()> {
        self.term = Some(term);
        Ok(())
    }

    fn load_vote(&self) -> Result<Option<MemberId>> {
        Ok(self.vote)
    }

    fn store_vote(&mut self, vote: Option<MemberId>) -> Result<()> {
        self.vote = vote;
        Ok(())
    }

    fn load_configuration(&self) -> Result<Option<Configuration>> {
        Ok(self.configuration.clone())
    }

    fn store_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        self.configuration = Some(configuration.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct MetaRecord {
    term: Option<Term>,
    vote: Option<MemberId>,
    configuration: Option<Configuration>,
}

/// File-backed metadata. The whole record is small; it is rewritten as a
/// unit through a temp file and an atomic rename.
pub struct FileMetaStore {
    path: PathBuf,
    record: MetaRecord,
}

impl FileMetaStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut path = dir.into();
        fs::create_dir_all(&path)?;
        path.push("meta.bin");
        let record = if path.exists() {
            bincode::deserialize(&fs::read(&path)?)?
        } else {
            MetaRecord::default()
        };
        Ok(FileMetaStore { path, record })
    }

    fn flush(&self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bincode::serialize(&self.record)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MetaStore for FileMetaStore {
    fn load_term(&self) -> Result<Option<Term>> {
        Ok(self.record.term)
    }

    fn store_term(&mut self, term: Term) -> Result<()> {
        self.record.term = Some(term);
        self.flush()
    }

    fn load_vote(&self) -> Result<Option<MemberId>> {
        Ok(self.record.vote)
    }

    fn store_vote(&mut self, vote: Option<MemberId>) -> Result<()> {
        self.record.vote = vote;
        self.flush()
    }

    fn load_configuration(&self) -> Result<Option<Configuration>> {
        Ok(self.record.configuration.clone())
    }

    fn store_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        self.record.configuration = Some(configuration.clone());
        self.flush()
    }
}
