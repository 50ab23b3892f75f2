//! Network and on-disk layout constants, plus small helpers for deriving a
//! replica's address and data paths from its index.

use std::path::PathBuf;

/// Default coordinator host:port.
pub const MASTER_ADDR: &str = "127.0.0.1:7170";

/// Replica `k` listens on `127.0.0.1:(REPLICA_PORT_START + k)`.
pub const REPLICA_PORT_START: u16 = 7171;

/// Returns the default listen address for replica `k`.
pub fn replica_addr(index: usize) -> String {
    format!("127.0.0.1:{}", REPLICA_PORT_START as usize + index)
}

/// Root-relative paths for persistent state, matching spec section 6:
///
/// - `logs/master.txt` -- coordinator log
/// - `logs/replica<k>.txt` -- replica `k` log
/// - `data/replica<k>/committed/` -- committed KV store
/// - `data/replica<k>/temp/` -- temp KV store
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn master_log(&self) -> PathBuf {
        self.root.join("logs").join("master.txt")
    }

    pub fn replica_log(&self, index: usize) -> PathBuf {
        self.root.join("logs").join(format!("replica{}.txt", index))
    }

    pub fn replica_committed(&self, index: usize) -> PathBuf {
        self.root.join("data").join(format!("replica{}", index)).join("committed")
    }

    pub fn replica_temp(&self, index: usize) -> PathBuf {
        self.root.join("data").join(format!("replica{}", index)).join("temp")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Back-off between retried `Commit` RPCs to a replica that is still down
/// or mid-recovery, and the poll interval a recovering replica uses while
/// waiting for the coordinator to resolve an in-doubt transaction.
pub const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);
