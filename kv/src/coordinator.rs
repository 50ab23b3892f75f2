//! The coordinator (master): the 2PC driver. Fans prepare out to every
//! replica in parallel, decides commit or abort by unanimity, logs the
//! decision, and broadcasts the outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::error::{CResult, Error};
use crate::fault;
use crate::protocol::{
    AbortArgs, CommitArgs, CoordinatorTxState, DelTestArgs, GetArgs, GetReply, GetTestArgs,
    LogRecord, MasterDeath, MasterMethod, MasterReply, MutationOutcome, MutationReply, Operation,
    PingArgs, PingReply, PutTestArgs, Reply, ReplicaDeath, ReplicaMethod, StatusArgs, StatusReply,
    TryDelArgs, TryPutArgs, TryReply, TxState,
};
use crate::rpc;
use crate::txid;
use crate::wal::Wal;

/// A snapshot of the coordinator's in-memory bookkeeping.
#[derive(Clone, Debug, PartialEq, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct CoordinatorStatus {
    pub replica_count: usize,
    pub in_flight_txs: usize,
}

pub struct Coordinator {
    replicas: Vec<String>,
    wal: Wal,
    txs: Mutex<HashMap<String, TxState>>,
}

impl Coordinator {
    pub fn open(wal_path: PathBuf, replicas: Vec<String>) -> CResult<Self> {
        Ok(Self { replicas, wal: Wal::open(wal_path)?, txs: Mutex::new(HashMap::new()) })
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn status(&self) -> CoordinatorStatus {
        let txs = self.txs.lock().expect("coordinator txs poisoned");
        CoordinatorStatus { replica_count: self.replicas.len(), in_flight_txs: txs.len() }
    }

    /// The coordinator's last-known disposition for `tx_id`, as returned by
    /// the `Status` RPC.
    pub fn tx_status(&self, tx_id: &str) -> CoordinatorTxState {
        let txs = self.txs.lock().expect("coordinator txs poisoned");
        match txs.get(tx_id) {
            Some(TxState::Started) => CoordinatorTxState::Started,
            Some(TxState::Committed) => CoordinatorTxState::Committed,
            Some(TxState::Aborted) => CoordinatorTxState::Aborted,
            _ => CoordinatorTxState::NoState,
        }
    }

    pub fn ping(payload: String) -> String {
        payload
    }

    /// `Get`/`GetTest`: reads from a replica's committed store. A negative
    /// `replica_num` picks a uniform random replica.
    pub async fn get(&self, key: &str, replica_num: i64) -> CResult<Option<String>> {
        let index = if replica_num < 0 {
            let mut rng = rand::thread_rng();
            *(0..self.replicas.len()).collect::<Vec<_>>().choose(&mut rng).expect("at least one replica")
        } else {
            replica_num as usize
        };
        let addr = self
            .replicas
            .get(index)
            .ok_or_else(|| Error::Internal(format!("no replica at index {}", index)))?;

        let request = ReplicaMethod::Get(GetArgs { key: key.to_string() });
        let reply: Reply<crate::protocol::ReplicaReply> = rpc::call(addr, &request).await?;
        match reply.into_result() {
            Ok(crate::protocol::ReplicaReply::Get(GetReply { value })) => Ok(value),
            Ok(_) => Err(Error::Internal("unexpected reply to Get".into())),
            Err(err) => Err(Error::Internal(err)),
        }
    }

    /// The unified `Put`/`Del` mutation algorithm (section 4.4).
    pub async fn mutate(
        &self,
        key: &str,
        value: Option<&str>,
        op: Operation,
        master_death: MasterDeath,
        replica_deaths: &[ReplicaDeath],
    ) -> CResult<MutationOutcome> {
        let tx_id = txid::generate();
        self.wal.append(LogRecord::transition(&tx_id, TxState::Started, Operation::NoOp, ""))?;
        self.txs.lock().expect("coordinator txs poisoned").insert(tx_id.clone(), TxState::Started);

        let votes = self.prepare_fanout(&tx_id, key, value, op, replica_deaths).await;
        let commit = votes.iter().all(|v| matches!(v, Ok(true)));

        if !commit {
            self.wal.append(LogRecord::terminal(&tx_id, TxState::Aborted))?;
            self.txs.lock().expect("coordinator txs poisoned").insert(tx_id.clone(), TxState::Aborted);
            self.abort_broadcast(&tx_id).await;
            return Ok(MutationOutcome::TxAborted);
        }

        fault::die_if(&self.wal, MasterDeath::DieBeforeLoggingCommitted, master_death)?;
        self.wal.append(LogRecord::terminal(&tx_id, TxState::Committed))?;
        fault::die_if(&self.wal, MasterDeath::DieAfterLoggingCommitted, master_death)?;
        self.txs.lock().expect("coordinator txs poisoned").insert(tx_id.clone(), TxState::Committed);

        self.commit_broadcast(&tx_id, replica_deaths).await;

        self.txs.lock().expect("coordinator txs poisoned").remove(&tx_id);
        Ok(MutationOutcome::Ok)
    }

    async fn prepare_fanout(
        &self,
        tx_id: &str,
        key: &str,
        value: Option<&str>,
        op: Operation,
        replica_deaths: &[ReplicaDeath],
    ) -> Vec<CResult<bool>> {
        let mut set = JoinSet::new();
        for (i, addr) in self.replicas.iter().cloned().enumerate() {
            let tx_id = tx_id.to_string();
            let key = key.to_string();
            let value = value.map(str::to_string);
            let die = replica_deaths.get(i).copied().unwrap_or_default();
            set.spawn(async move {
                let request = match (op, value) {
                    (Operation::Put, Some(value)) => {
                        ReplicaMethod::TryPut(TryPutArgs { key, value, tx_id, die })
                    }
                    _ => ReplicaMethod::TryDel(TryDelArgs { key, tx_id, die }),
                };
                let reply: CResult<Reply<crate::protocol::ReplicaReply>> = rpc::call(&addr, &request).await;
                match reply {
                    Ok(Reply::Ok(crate::protocol::ReplicaReply::Try(TryReply { success }))) => Ok(success),
                    Ok(Reply::Ok(_)) => Err(Error::Internal("unexpected reply to Try".into())),
                    Ok(Reply::Err(err)) => Err(Error::Internal(err)),
                    Err(err) => Err(err),
                }
            });
        }

        let mut results = Vec::with_capacity(self.replicas.len());
        while let Some(joined) = set.join_next().await {
            results.push(joined.unwrap_or_else(|err| Err(Error::Internal(err.to_string()))));
        }
        results
    }

    /// Best-effort: errors are logged, never retried (section 4.4).
    async fn abort_broadcast(&self, tx_id: &str) {
        let mut set = JoinSet::new();
        for addr in self.replicas.iter().cloned() {
            let tx_id = tx_id.to_string();
            set.spawn(async move {
                let request = ReplicaMethod::Abort(AbortArgs { tx_id: tx_id.clone() });
                let reply: CResult<Reply<crate::protocol::ReplicaReply>> = rpc::call(&addr, &request).await;
                if let Err(err) = reply {
                    log::warn!("best-effort Abort({}) to {} failed: {}", tx_id, addr, err);
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Infinite retry with a fixed back-off per replica, until every
    /// replica's `Commit` returns no error (section 4.4). `replica_deaths`
    /// is honoured on the first attempt only; retries always pass `DontDie`
    /// so a replica that already died once during this commit isn't asked
    /// to die again on recovery.
    async fn commit_broadcast(&self, tx_id: &str, replica_deaths: &[ReplicaDeath]) {
        let mut set = JoinSet::new();
        for (i, addr) in self.replicas.iter().cloned().enumerate() {
            let tx_id = tx_id.to_string();
            let first_die = replica_deaths.get(i).copied().unwrap_or_default();
            set.spawn(async move {
                let mut die = first_die;
                loop {
                    let request = ReplicaMethod::Commit(CommitArgs { tx_id: tx_id.clone(), die });
                    let reply: CResult<Reply<crate::protocol::ReplicaReply>> = rpc::call(&addr, &request).await;
                    match reply {
                        Ok(Reply::Ok(crate::protocol::ReplicaReply::Commit(TryReply { success: true }))) => {
                            return;
                        }
                        Ok(Reply::Ok(crate::protocol::ReplicaReply::Commit(TryReply { success: false }))) => {
                            log::warn!("Commit({}) on {} returned success=false, retrying", tx_id, addr);
                        }
                        Ok(Reply::Ok(_)) => log::warn!("unexpected reply to Commit({}) on {}", tx_id, addr),
                        Ok(Reply::Err(err)) => {
                            log::warn!("Commit({}) on {} errored: {}, retrying", tx_id, addr, err)
                        }
                        Err(err) => log::warn!("Commit({}) on {} failed: {}, retrying", tx_id, addr, err),
                    }
                    die = ReplicaDeath::DontDie;
                    tokio::time::sleep(crate::config::RETRY_BACKOFF).await;
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Coordinator recovery (section 4.4).
    pub async fn recover(&self) -> CResult<()> {
        let records = self.wal.read_all()?;
        let mut did_suicide = false;
        let mut txs = HashMap::new();

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
                TxState::Started | TxState::Committed | TxState::Aborted => {
                    txs.insert(record.tx_id.clone(), record.state);
                }
                TxState::Prepared | TxState::NoState => {}
            }
        }

        fault::set_did_suicide(did_suicide);
        *self.txs.lock().expect("coordinator txs poisoned") = txs.clone();

        for (tx_id, state) in txs {
            match state {
                TxState::Started | TxState::Aborted => self.abort_broadcast(&tx_id).await,
                TxState::Committed => self.commit_broadcast(&tx_id, &[]).await,
                TxState::Prepared | TxState::NoState => {}
            }
        }

        if fault::did_suicide() {
            self.wal.append(LogRecord::first_restart_after_suicide_marker())?;
        }

        Ok(())
    }
}

/// Dispatches one inbound `MasterMethod` against `coordinator`.
async fn dispatch(coordinator: &Coordinator, method: MasterMethod) -> Reply<MasterReply> {
    let result: CResult<MasterReply> = match method {
        MasterMethod::Get(GetArgs { key }) => coordinator
            .get(&key, -1)
            .await
            .map(|value| MasterReply::Get(GetReply { value })),
        MasterMethod::GetTest(GetTestArgs { key, replica_num }) => coordinator
            .get(&key, replica_num)
            .await
            .map(|value| MasterReply::Get(GetReply { value })),
        MasterMethod::Put { key, value } => coordinator
            .mutate(&key, Some(&value), Operation::Put, MasterDeath::DontDie, &[])
            .await
            .map(|outcome| MasterReply::Mutation(MutationReply { outcome })),
        MasterMethod::PutTest(PutTestArgs { key, value, master_death, replica_deaths }) => coordinator
            .mutate(&key, Some(&value), Operation::Put, master_death, &replica_deaths)
            .await
            .map(|outcome| MasterReply::Mutation(MutationReply { outcome })),
        MasterMethod::Del { key } => coordinator
            .mutate(&key, None, Operation::Del, MasterDeath::DontDie, &[])
            .await
            .map(|outcome| MasterReply::Mutation(MutationReply { outcome })),
        MasterMethod::DelTest(DelTestArgs { key, master_death, replica_deaths }) => coordinator
            .mutate(&key, None, Operation::Del, master_death, &replica_deaths)
            .await
            .map(|outcome| MasterReply::Mutation(MutationReply { outcome })),
        MasterMethod::Status(StatusArgs { tx_id }) => {
            Ok(MasterReply::Status(StatusReply { state: coordinator.tx_status(&tx_id) }))
        }
        MasterMethod::Ping(PingArgs { payload }) => {
            Ok(MasterReply::Ping(PingReply { payload: Coordinator::ping(payload) }))
        }
    };

    match result {
        Ok(reply) => Reply::Ok(reply),
        Err(err) => Reply::Err(err.to_string()),
    }
}

/// Runs recovery, then serves `MasterMethod` RPCs on `listener`.
pub async fn serve(coordinator: Arc<Coordinator>, listener: TcpListener) -> CResult<()> {
    coordinator.recover().await?;
    rpc::serve(listener, move |method: MasterMethod| {
        let coordinator = coordinator.clone();
        async move { dispatch(&coordinator, method).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_replica_count() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::open(
            dir.path().join("wal"),
            vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()],
        )
        .unwrap();
        assert_eq!(coordinator.status().replica_count, 2);
    }

    #[test]
    fn tx_status_is_no_state_for_unknown_tx() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::open(dir.path().join("wal"), vec![]).unwrap();
        assert_eq!(coordinator.tx_status("nope"), CoordinatorTxState::NoState);
    }
}
