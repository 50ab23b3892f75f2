//! The replica: a stateful 2PC participant holding per-transaction state, a
//! set of locked keys, the temp store, the committed store, and its
//! write-ahead log.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::config::RETRY_BACKOFF;
use crate::error::{CResult, Error};
use crate::fault;
use crate::protocol::{
    CoordinatorTxState, GetArgs, GetReply, LogRecord, MasterMethod, MasterReply, Operation,
    PingArgs, PingReply, Reply, ReplicaDeath, ReplicaMethod, StatusArgs, TryDelArgs, TryPutArgs,
    TryReply, TxState,
};
use crate::rpc;
use crate::storage::log_cask::LogCask;
use crate::store::{temp_key, KvStore};
use crate::wal::Wal;

/// A transaction as tracked on the replica side (section 3).
#[derive(Clone, Debug)]
struct Tx {
    key: String,
    op: Operation,
    state: TxState,
}

#[derive(Default)]
struct ReplicaState {
    txs: HashMap<String, Tx>,
    locked_keys: HashSet<String>,
}

/// A snapshot of a replica's in-memory bookkeeping, for operator
/// introspection -- mirrors the shape of `storage::Status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub index: usize,
    pub in_flight_txs: usize,
    pub locked_keys: usize,
}

pub struct Replica {
    index: usize,
    state: Mutex<ReplicaState>,
    committed: Mutex<KvStore<LogCask>>,
    temp: Mutex<KvStore<LogCask>>,
    wal: Wal,
}

impl Replica {
    /// Opens a replica's committed store, temp store, and log at the given
    /// paths. Does not run recovery -- call `recover` before serving RPCs.
    pub fn open(
        index: usize,
        wal_path: PathBuf,
        committed_path: PathBuf,
        temp_path: PathBuf,
    ) -> CResult<Self> {
        Ok(Self {
            index,
            state: Mutex::new(ReplicaState::default()),
            committed: Mutex::new(KvStore::new(LogCask::new(committed_path)?)),
            temp: Mutex::new(KvStore::new(LogCask::new(temp_path)?)),
            wal: Wal::open(wal_path)?,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> ReplicaStatus {
        let state = self.state.lock().expect("replica state poisoned");
        ReplicaStatus {
            index: self.index,
            in_flight_txs: state.txs.len(),
            locked_keys: state.locked_keys.len(),
        }
    }

    /// Unified `TryPut`/`TryDel` algorithm (section 4.3).
    fn try_mutate(
        &self,
        tx_id: String,
        key: String,
        op: Operation,
        value: Option<String>,
        die: ReplicaDeath,
    ) -> CResult<bool> {
        fault::die_if(&self.wal, ReplicaDeath::BeforeProcessingMutateRequest, die)?;

        let already_locked = {
            let mut state = self.state.lock().expect("replica state poisoned");
            state.txs.insert(tx_id.clone(), Tx { key: key.clone(), op, state: TxState::Started });
            if state.locked_keys.contains(&key) {
                true
            } else {
                state.locked_keys.insert(key.clone());
                false
            }
        };

        if already_locked {
            {
                let mut state = self.state.lock().expect("replica state poisoned");
                if let Some(tx) = state.txs.get_mut(&tx_id) {
                    tx.state = TxState::Aborted;
                }
            }
            self.wal.append(LogRecord::terminal(&tx_id, TxState::Aborted))?;
            return Ok(false);
        }

        if op == Operation::Put {
            let value = value.expect("Put carries a value");
            let mut temp = self.temp.lock().expect("temp store poisoned");
            if let Err(err) = temp.put(&temp_key(&tx_id, &key), &value) {
                drop(temp);
                let mut state = self.state.lock().expect("replica state poisoned");
                state.locked_keys.remove(&key);
                if let Some(tx) = state.txs.get_mut(&tx_id) {
                    tx.state = TxState::Aborted;
                }
                drop(state);
                self.wal.append(LogRecord::terminal(&tx_id, TxState::Aborted))?;
                return Err(err);
            }
        }

        {
            let mut state = self.state.lock().expect("replica state poisoned");
            if let Some(tx) = state.txs.get_mut(&tx_id) {
                tx.state = TxState::Prepared;
            }
        }
        self.wal.append(LogRecord::transition(&tx_id, TxState::Prepared, op, &key))?;

        fault::die_if(&self.wal, ReplicaDeath::AfterLoggingPrepared, die)?;

        Ok(true)
    }

    pub fn try_put(&self, tx_id: String, key: String, value: String, die: ReplicaDeath) -> CResult<bool> {
        self.try_mutate(tx_id, key, Operation::Put, Some(value), die)
    }

    pub fn try_del(&self, tx_id: String, key: String, die: ReplicaDeath) -> CResult<bool> {
        self.try_mutate(tx_id, key, Operation::Del, None, die)
    }

    /// The `Commit` algorithm (section 4.3). Returns an error if `tx_id` is
    /// unknown, `Ok(false)` if the tx is known but not Prepared (warn and
    /// ignore), `Ok(true)` on a successful commit.
    pub fn commit(&self, tx_id: String, die: ReplicaDeath) -> CResult<bool> {
        fault::die_if(&self.wal, ReplicaDeath::BeforeProcessingCommit, die)?;

        let tx = {
            let state = self.state.lock().expect("replica state poisoned");
            state.txs.get(&tx_id).cloned()
        };
        let tx = tx.ok_or_else(|| Error::UnknownTransaction(tx_id.clone()))?;

        if tx.state != TxState::Prepared {
            log::warn!("commit({}): tx not in Prepared state ({:?}), ignoring", tx_id, tx.state);
            return Ok(false);
        }

        {
            let mut state = self.state.lock().expect("replica state poisoned");
            state.locked_keys.remove(&tx.key);
        }

        match tx.op {
            Operation::Put => {
                let value = {
                    let mut temp = self.temp.lock().expect("temp store poisoned");
                    temp.get(&temp_key(&tx_id, &tx.key))?
                };
                let mut committed = self.committed.lock().expect("committed store poisoned");
                committed.put(&tx.key, &value)?;
            }
            Operation::Del => {
                let mut committed = self.committed.lock().expect("committed store poisoned");
                committed.del(&tx.key)?;
            }
            Operation::NoOp => {}
        }

        self.wal.append(LogRecord::terminal(&tx_id, TxState::Committed))?;

        fault::die_if(&self.wal, ReplicaDeath::AfterLoggingCommitted, die)?;

        {
            let mut state = self.state.lock().expect("replica state poisoned");
            state.txs.remove(&tx_id);
        }

        if tx.op == Operation::Put {
            let mut temp = self.temp.lock().expect("temp store poisoned");
            temp.del(&temp_key(&tx_id, &tx.key))?;
        }

        fault::die_if(&self.wal, ReplicaDeath::AfterDeletingFromTempStore, die)?;

        Ok(true)
    }

    /// The `Abort` algorithm (section 4.3).
    pub fn abort(&self, tx_id: String) -> CResult<bool> {
        let tx = {
            let state = self.state.lock().expect("replica state poisoned");
            state.txs.get(&tx_id).cloned()
        };
        let tx = tx.ok_or_else(|| Error::UnknownTransaction(tx_id.clone()))?;

        if tx.state != TxState::Prepared {
            log::warn!("abort({}): tx not in Prepared state ({:?}), ignoring", tx_id, tx.state);
            return Ok(true);
        }

        {
            let mut state = self.state.lock().expect("replica state poisoned");
            state.locked_keys.remove(&tx.key);
        }

        if tx.op == Operation::Put {
            let mut temp = self.temp.lock().expect("temp store poisoned");
            temp.del(&temp_key(&tx_id, &tx.key))?;
        }

        self.wal.append(LogRecord::terminal(&tx_id, TxState::Aborted))?;

        {
            let mut state = self.state.lock().expect("replica state poisoned");
            state.txs.remove(&tx_id);
        }

        Ok(true)
    }

    /// Reads from the committed store directly -- no locking, no
    /// transaction.
    pub fn get(&self, key: &str) -> CResult<String> {
        let mut committed = self.committed.lock().expect("committed store poisoned");
        committed.get(key)
    }

    pub fn ping(payload: String) -> String {
        payload
    }

    pub fn flush(&self) -> CResult<()> {
        self.committed.lock().expect("committed store poisoned").flush()?;
        self.temp.lock().expect("temp store poisoned").flush()
    }

    /// Runs recovery against the write-ahead log, then resolves any
    /// transaction left in `Prepared` by polling the coordinator until it
    /// answers with a terminal state. Must complete before the replica
    /// starts serving RPCs (section 9's open question).
    pub async fn recover(&self, master_addr: &str) -> CResult<()> {
        let records = self.wal.read_all()?;
        let mut did_suicide = false;
        let mut rebuilt = ReplicaState::default();

        for record in &records {
            if record.is_killed_self_marker() {
                did_suicide = true;
                continue;
            }
            if record.is_first_restart_marker() {
                did_suicide = false;
                continue;
            }
            match record.state {
                TxState::Prepared => {
                    rebuilt.txs.insert(
                        record.tx_id.clone(),
                        Tx { key: record.key.clone(), op: record.op, state: TxState::Prepared },
                    );
                    rebuilt.locked_keys.insert(record.key.clone());
                }
                TxState::Committed | TxState::Aborted => {
                    rebuilt.txs.insert(
                        record.tx_id.clone(),
                        Tx { key: record.key.clone(), op: record.op, state: record.state },
                    );
                    rebuilt.locked_keys.remove(&record.key);
                }
                TxState::Started | TxState::NoState => {}
            }
        }

        fault::set_did_suicide(did_suicide);
        *self.state.lock().expect("replica state poisoned") = rebuilt;

        let in_doubt: Vec<(String, String)> = {
            let state = self.state.lock().expect("replica state poisoned");
            state
                .txs
                .iter()
                .filter(|(_, tx)| tx.state == TxState::Prepared)
                .map(|(id, tx)| (id.clone(), tx.key.clone()))
                .collect()
        };

        for (tx_id, _key) in in_doubt {
            match self.poll_coordinator_status(master_addr, &tx_id).await? {
                CoordinatorTxState::Committed => {
                    self.commit(tx_id, ReplicaDeath::DontDie)?;
                }
                CoordinatorTxState::Aborted => {
                    self.abort(tx_id)?;
                }
                CoordinatorTxState::Started | CoordinatorTxState::NoState => {
                    unreachable!("poll_coordinator_status only returns on a terminal answer")
                }
            }
        }

        self.collect_orphaned_temp_entries()?;

        if fault::did_suicide() {
            self.wal.append(LogRecord::first_restart_after_suicide_marker())?;
        }

        Ok(())
    }

    /// Polls the coordinator's `Status` RPC every `RETRY_BACKOFF` until it
    /// returns a terminal (`Committed`/`Aborted`) answer.
    async fn poll_coordinator_status(&self, master_addr: &str, tx_id: &str) -> CResult<CoordinatorTxState> {
        let request = MasterMethod::Status(StatusArgs { tx_id: tx_id.to_string() });
        loop {
            let result: CResult<Reply<MasterReply>> = rpc::call(master_addr, &request).await;
            match result {
                Ok(Reply::Ok(MasterReply::Status(reply))) => match reply.state {
                    CoordinatorTxState::Committed | CoordinatorTxState::Aborted => return Ok(reply.state),
                    CoordinatorTxState::Started | CoordinatorTxState::NoState => {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                },
                Ok(Reply::Ok(_)) => return Err(Error::Internal("unexpected reply to Status".into())),
                Ok(Reply::Err(err)) => {
                    log::warn!("Status({}) on {} returned an error: {}, retrying", tx_id, master_addr, err);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => {
                    log::warn!("poll Status({}) on {} failed: {}, retrying", tx_id, master_addr, err);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Any composite `txId__key` entry in the temp store whose `txId` is
    /// not a live Prepared transaction is garbage from an aborted or
    /// already-committed tx; remove it.
    fn collect_orphaned_temp_entries(&self) -> CResult<()> {
        let live: HashSet<String> = {
            let state = self.state.lock().expect("replica state poisoned");
            state.txs.iter().filter(|(_, tx)| tx.state == TxState::Prepared).map(|(id, _)| id.clone()).collect()
        };

        let mut temp = self.temp.lock().expect("temp store poisoned");
        let orphans: Vec<String> = temp
            .list()?
            .into_iter()
            .filter(|composite| match composite.split_once("__") {
                Some((tx_id, _)) => !live.contains(tx_id),
                None => false,
            })
            .collect();

        for composite in orphans {
            temp.del(&composite)?;
        }

        Ok(())
    }
}

/// Dispatches one inbound `ReplicaMethod` against `replica`, wrapping the
/// outcome (or an application error) in `Reply<ReplicaReply>` so it can be
/// told apart on the wire from a transport failure.
async fn dispatch(replica: &Replica, method: ReplicaMethod) -> Reply<crate::protocol::ReplicaReply> {
    use crate::protocol::ReplicaReply;

    let result: CResult<ReplicaReply> = match method {
        ReplicaMethod::TryPut(TryPutArgs { key, value, tx_id, die }) => {
            replica.try_put(tx_id, key, value, die).map(|success| ReplicaReply::Try(TryReply { success }))
        }
        ReplicaMethod::TryDel(TryDelArgs { key, tx_id, die }) => {
            replica.try_del(tx_id, key, die).map(|success| ReplicaReply::Try(TryReply { success }))
        }
        ReplicaMethod::Commit(crate::protocol::CommitArgs { tx_id, die }) => {
            replica.commit(tx_id, die).map(|success| ReplicaReply::Commit(TryReply { success }))
        }
        ReplicaMethod::Abort(crate::protocol::AbortArgs { tx_id }) => {
            replica.abort(tx_id).map(|success| ReplicaReply::Abort(TryReply { success }))
        }
        ReplicaMethod::Get(GetArgs { key }) => match replica.get(&key) {
            Ok(value) => Ok(ReplicaReply::Get(GetReply { value: Some(value) })),
            Err(Error::KeyNotFound) => Ok(ReplicaReply::Get(GetReply { value: None })),
            Err(err) => Err(err),
        },
        ReplicaMethod::Ping(PingArgs { payload }) => {
            Ok(ReplicaReply::Ping(PingReply { payload: Replica::ping(payload) }))
        }
    };

    match result {
        Ok(reply) => Reply::Ok(reply),
        Err(err) => Reply::Err(err.to_string()),
    }
}

/// Runs recovery, then serves `ReplicaMethod` RPCs on `listener` until the
/// process exits.
pub async fn serve(replica: Arc<Replica>, master_addr: String, listener: TcpListener) -> CResult<()> {
    replica.recover(&master_addr).await?;
    rpc::serve(listener, move |method: ReplicaMethod| {
        let replica = replica.clone();
        async move { dispatch(&replica, method).await }
    })
    .await
}
