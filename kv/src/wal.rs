//! The write-ahead log: an append-only, single-writer stream of
//! `LogRecord`s. `append` fsyncs before returning; `read_all` replays the
//! full history from the start, reusing `storage::log::Log`'s append-only
//! framing with bincode-encoded payloads in place of raw key/value bytes.

use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::CResult;
use crate::protocol::LogRecord;
use crate::storage::log::Log;

pub struct Wal {
    log: Mutex<Log>,
}

impl Wal {
    /// Opens (or creates) the log file at `path`, taking an exclusive lock
    /// for the lifetime of the process, as `storage::log::Log` does.
    pub fn open(path: PathBuf) -> CResult<Self> {
        Ok(Self { log: Mutex::new(Log::new(path)?) })
    }

    /// Appends `record`, fsyncing before returning. Concurrent callers are
    /// serialized by the internal mutex -- the lock is held across the
    /// fsync, so it plays the role of the single-writer queue that signals
    /// completion only once the write has actually hit disk.
    pub fn append(&self, record: LogRecord) -> CResult<()> {
        let bytes = bincode::serialize(&record)?;
        let mut log = self.log.lock().expect("wal mutex poisoned");
        log.write_entry(&[], Some(&bytes))?;
        log.file.sync_all()?;
        Ok(())
    }

    /// Returns the full ordered record history, empty if nothing has been
    /// appended yet.
    pub fn read_all(&self) -> CResult<Vec<LogRecord>> {
        let mut log = self.log.lock().expect("wal mutex poisoned");
        log.read_all()?
            .into_iter()
            .filter_map(|(_, value)| value)
            .map(|bytes| bincode::deserialize(&bytes).map_err(Into::into))
            .collect()
    }
}
