//! The fault-injection harness: named death points that make a process
//! append a suicide marker to its log and exit, plus the `didSuicide` guard
//! that keeps the same death point from firing again on the immediate next
//! restart.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CResult;
use crate::protocol::LogRecord;
use crate::wal::Wal;

/// Process-wide: set once by recovery at startup, read at every `die_if`
/// call site. The only piece of global mutable state in the system.
static DID_SUICIDE: AtomicBool = AtomicBool::new(false);

pub fn set_did_suicide(value: bool) {
    DID_SUICIDE.store(value, Ordering::SeqCst);
}

pub fn did_suicide() -> bool {
    DID_SUICIDE.load(Ordering::SeqCst)
}

/// If `actual == expected` (the hard-coded point in the code matches the
/// point named in the inbound request) and this process has not already
/// suicided, appends the suicide marker and exits with code 1. `expected`
/// carrying the role's "don't die" variant never matches a real `actual`
/// point, so ordinary requests pass straight through.
pub fn die_if<D: PartialEq + std::fmt::Debug>(wal: &Wal, actual: D, expected: D) -> CResult<()> {
    if actual == expected && !did_suicide() {
        log::warn!("death point {:?} triggered, appending suicide marker and exiting", actual);
        wal.append(LogRecord::killed_self_marker())?;
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_suicide_defaults_to_false_and_round_trips() {
        // NB: shares process-global state with other tests in this binary;
        // only assert the set/get round trip, not a fixed initial value.
        set_did_suicide(true);
        assert!(did_suicide());
        set_did_suicide(false);
        assert!(!did_suicide());
    }

    #[test]
    fn die_if_is_a_no_op_when_points_differ() -> CResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal")).unwrap();
        die_if(&wal, 1u8, 2u8)?;
        assert!(wal.read_all()?.is_empty());
        Ok(())
    }
}
