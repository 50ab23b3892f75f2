//! Opaque, globally-unique transaction id generation. The coordinator is
//! the only party that allocates ids; replicas and the log only ever echo
//! an id handed to them.

use rand::Rng;

/// Generates a new transaction id: 16 random bytes, hex-encoded. Collisions
/// are astronomically unlikely and are not otherwise guarded against, the
/// same assumption a UUID-based id would make.
pub fn generate() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
