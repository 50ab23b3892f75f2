//! `twopc` replicates a key-value store across a fixed set of replicas with
//! two-phase commit, so every replica agrees on every put and delete or none
//! of them do. A coordinator drives prepare/commit across the replicas over
//! the wire protocol in [`protocol`]; each role keeps a write-ahead log
//! ([`wal`]) on top of the append-only storage engine in [`storage`] so it
//! can recover its in-flight transactions after a crash. [`fault`] supplies
//! the named death points used to test that recovery.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fault;
pub mod protocol;
pub mod replica;
pub mod rpc;
pub mod storage;
pub mod store;
pub mod txid;
pub mod wal;
