//! Wire types shared by the coordinator and replica RPC surfaces, and the
//! write-ahead log record schema both sides share.
//!
//! Method names are grouped by receiver, `Master.*` and `Replica.*`, the way
//! the original two-phase-commit program did it -- reflected here as two
//! enums rather than a single flat namespace.

use serde_derive::{Deserialize, Serialize};

/// The mutation an in-flight or logged transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put,
    Del,
    /// Used only for log records that carry no operation (Started/Committed/
    /// Aborted transition markers, and the suicide/first-restart sentinels).
    NoOp,
}

impl Default for Operation {
    fn default() -> Self {
        Operation::NoOp
    }
}

/// A transaction's state, shared vocabulary for both the replica and the
/// coordinator logs (the coordinator never uses `Prepared`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Started,
    Prepared,
    Committed,
    Aborted,
    /// An unrecognized state string/tag, as when log content can't be
    /// interpreted. `read_all` never actually produces this for records
    /// written by this crate; it exists so a record schema mismatch fails
    /// soft rather than hard during recovery.
    NoState,
}

impl Default for TxState {
    fn default() -> Self {
        TxState::NoState
    }
}

/// Reserved transaction identifiers for the two log sentinel record forms.
pub const KILLED_SELF_MARKER: &str = "::justkilledself::";
pub const FIRST_RESTART_AFTER_SUICIDE_MARKER: &str = "::firstrestartaftersuicide::";

/// One write-ahead log record: `(txId, state, op, key)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub tx_id: String,
    pub state: TxState,
    pub op: Operation,
    pub key: String,
}

impl LogRecord {
    pub fn transition(tx_id: impl Into<String>, state: TxState, op: Operation, key: impl Into<String>) -> Self {
        Self { tx_id: tx_id.into(), state, op, key: key.into() }
    }

    /// A terminal-state record that carries no op/key, per spec section 3
    /// ("Committed"/"Aborted" records leave op/key empty).
    pub fn terminal(tx_id: impl Into<String>, state: TxState) -> Self {
        Self { tx_id: tx_id.into(), state, op: Operation::NoOp, key: String::new() }
    }

    pub fn killed_self_marker() -> Self {
        Self::terminal(KILLED_SELF_MARKER, TxState::NoState)
    }

    pub fn first_restart_after_suicide_marker() -> Self {
        Self::terminal(FIRST_RESTART_AFTER_SUICIDE_MARKER, TxState::NoState)
    }

    pub fn is_killed_self_marker(&self) -> bool {
        self.tx_id == KILLED_SELF_MARKER
    }

    pub fn is_first_restart_marker(&self) -> bool {
        self.tx_id == FIRST_RESTART_AFTER_SUICIDE_MARKER
    }
}

/// Named death points in the replica's request-handling code paths. `None`
/// means "don't die" -- the default for every ordinary RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReplicaDeath {
    #[default]
    DontDie,
    BeforeProcessingMutateRequest,
    AfterLoggingPrepared,
    BeforeProcessingCommit,
    AfterDeletingFromTempStore,
    AfterLoggingCommitted,
}

/// Named death points in the coordinator's commit path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MasterDeath {
    #[default]
    DontDie,
    DieBeforeLoggingCommitted,
    DieAfterLoggingCommitted,
}

/// The terminal outcome of a client-facing mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOutcome {
    Ok,
    TxAborted,
}

/// The coordinator's last-known disposition for a txId, as returned by
/// `Status`. Used by a recovering replica to resolve an in-doubt Prepared
/// transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorTxState {
    NoState,
    Started,
    Committed,
    Aborted,
}

// --- Replica RPC payloads -----------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TryPutArgs {
    pub key: String,
    pub value: String,
    pub tx_id: String,
    pub die: ReplicaDeath,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TryDelArgs {
    pub key: String,
    pub tx_id: String,
    pub die: ReplicaDeath,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TryReply {
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitArgs {
    pub tx_id: String,
    pub die: ReplicaDeath,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortArgs {
    pub tx_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReply {
    pub value: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingArgs {
    pub payload: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingReply {
    pub payload: String,
}

// --- Coordinator RPC payloads --------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutTestArgs {
    pub key: String,
    pub value: String,
    pub master_death: MasterDeath,
    pub replica_deaths: Vec<ReplicaDeath>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelTestArgs {
    pub key: String,
    pub master_death: MasterDeath,
    pub replica_deaths: Vec<ReplicaDeath>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationReply {
    pub outcome: MutationOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTestArgs {
    pub key: String,
    pub replica_num: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusArgs {
    pub tx_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReply {
    pub state: CoordinatorTxState,
}

/// The reply counterpart of `ReplicaMethod`, wrapped one level further in
/// `Reply<ReplicaReply>` on the wire so a replica can return an application
/// error (unknown-tx, storage I/O) distinctly from a transport failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplicaReply {
    Try(TryReply),
    Commit(TryReply),
    Abort(TryReply),
    Get(GetReply),
    Ping(PingReply),
}

/// The reply counterpart of `MasterMethod`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterReply {
    Get(GetReply),
    Mutation(MutationReply),
    Status(StatusReply),
    Ping(PingReply),
}

/// Every method exposed by the two roles, grouped by receiver as in the
/// original program's `Master.X`/`Replica.Y` naming.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Method {
    Master(MasterMethod),
    Replica(ReplicaMethod),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterMethod {
    Get(GetArgs),
    GetTest(GetTestArgs),
    Put { key: String, value: String },
    PutTest(PutTestArgs),
    Del { key: String },
    DelTest(DelTestArgs),
    Status(StatusArgs),
    Ping(PingArgs),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplicaMethod {
    TryPut(TryPutArgs),
    TryDel(TryDelArgs),
    Commit(CommitArgs),
    Abort(AbortArgs),
    Get(GetArgs),
    Ping(PingArgs),
}

/// A generic RPC envelope: the reply is either the callee's typed payload or
/// a stringly-encoded application error (unknown-tx, storage I/O, etc. --
/// see `error::Error`'s `Display`). Transport failures never reach this
/// type; they're surfaced by the RPC client as `std::io::Error`/timeouts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply<T> {
    Ok(T),
    Err(String),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, String> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err(e) => Err(e),
        }
    }
}
