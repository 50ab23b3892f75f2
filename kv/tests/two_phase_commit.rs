//! End-to-end coverage of replication, locking, and crash-recovery
//! behaviour, driving real `Replica`/`Coordinator` instances over real TCP
//! connections.
//!
//! Process-level fault injection (`fault::die_if`'s `std::process::exit(1)`)
//! cannot be exercised from within a test binary without killing the test
//! runner itself. Crash scenarios are instead simulated by directly
//! manipulating on-disk/in-memory state the way a real crash would leave it
//! (a dangling `Prepared` log record, a coordinator log that ends
//! mid-decision), then constructing a fresh `Replica`/`Coordinator` over
//! that state the way a restarted process would.

use std::sync::Arc;

use tokio::net::TcpListener;

use twopc::coordinator::Coordinator;
use twopc::error::{CResult, Error};
use twopc::protocol::{
    LogRecord, MasterMethod, MasterReply, MutationOutcome, Operation, Reply, StatusReply, TxState,
};
use twopc::replica::{self, Replica};
use twopc::wal::Wal;

async fn bind_ephemeral() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Opens a fresh replica over a tempdir and serves it on an ephemeral port.
/// A fresh store has nothing to recover, so `master_addr` is never dialed.
async fn spawn_fresh_replica(index: usize, dir: &std::path::Path) -> (Arc<Replica>, String) {
    let replica = Arc::new(
        Replica::open(
            index,
            dir.join("wal"),
            dir.join("committed"),
            dir.join("temp"),
        )
        .unwrap(),
    );
    let (listener, addr) = bind_ephemeral().await;
    tokio::spawn(replica::serve(replica.clone(), "127.0.0.1:1".to_string(), listener));
    // Give the spawned task a chance to finish its (trivial) recovery pass
    // and start accepting connections.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    (replica, addr)
}

#[tokio::test]
async fn put_then_get_from_every_replica_then_delete() -> CResult<()> {
    const N: usize = 4;
    let dirs: Vec<_> = (0..N).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut addrs = Vec::with_capacity(N);
    for (i, dir) in dirs.iter().enumerate() {
        let (_replica, addr) = spawn_fresh_replica(i, dir.path()).await;
        addrs.push(addr);
    }

    let coordinator_dir = tempfile::tempdir()?;
    let coordinator = Coordinator::open(coordinator_dir.path().join("wal"), addrs)?;

    let outcome = coordinator
        .mutate("foo", Some("bar"), Operation::Put, Default::default(), &[])
        .await?;
    assert_eq!(outcome, MutationOutcome::Ok);

    for i in 0..N {
        assert_eq!(coordinator.get("foo", i as i64).await?, Some("bar".to_string()));
    }

    let outcome = coordinator.mutate("foo", None, Operation::Del, Default::default(), &[]).await?;
    assert_eq!(outcome, MutationOutcome::Ok);

    for i in 0..N {
        assert_eq!(coordinator.get("foo", i as i64).await?, None);
    }

    Ok(())
}

#[tokio::test]
async fn mutation_aborts_by_unanimity_when_a_replica_already_holds_the_lock() -> CResult<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let (replica_a, addr_a) = spawn_fresh_replica(0, dir_a.path()).await;
    let (_replica_b, addr_b) = spawn_fresh_replica(1, dir_b.path()).await;

    // Simulate an already in-flight prepared transaction on replica A for
    // the same key the coordinator is about to target.
    assert!(replica_a.try_put(
        "pre-existing-tx".into(),
        "contested".into(),
        "first".into(),
        Default::default(),
    )?);

    let coordinator_dir = tempfile::tempdir()?;
    let coordinator = Coordinator::open(coordinator_dir.path().join("wal"), vec![addr_a, addr_b])?;

    let outcome = coordinator
        .mutate("contested", Some("second"), Operation::Put, Default::default(), &[])
        .await?;
    assert_eq!(outcome, MutationOutcome::TxAborted);

    // Neither the pre-existing prepared value nor the aborted one ever
    // lands in the committed store.
    assert!(matches!(replica_a.get("contested"), Err(Error::KeyNotFound)));

    Ok(())
}

#[tokio::test]
async fn coordinator_recovery_aborts_a_dangling_started_transaction() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let wal_path = dir.path().join("master-wal");

    {
        let wal = Wal::open(wal_path.clone())?;
        wal.append(LogRecord::transition("dangling-tx", TxState::Started, Operation::NoOp, ""))?;
    }

    let coordinator = Coordinator::open(wal_path, vec![])?;
    coordinator.recover().await?;

    assert_eq!(
        coordinator.tx_status("dangling-tx"),
        twopc::protocol::CoordinatorTxState::Aborted
    );

    Ok(())
}

#[tokio::test]
async fn coordinator_recovery_rebroadcasts_commit_for_a_dangling_committed_transaction() -> CResult<()> {
    let replica_dir = tempfile::tempdir()?;
    let (replica, replica_addr) = spawn_fresh_replica(0, replica_dir.path()).await;

    // Simulate the replica having already voted yes and prepared the
    // mutation, over the wire, the way the coordinator's own prepare fanout
    // would have.
    let request = twopc::protocol::ReplicaMethod::TryPut(twopc::protocol::TryPutArgs {
        key: "foo".into(),
        value: "bar".into(),
        tx_id: "committed-tx".into(),
        die: Default::default(),
    });
    let reply: Reply<twopc::protocol::ReplicaReply> = twopc::rpc::call(&replica_addr, &request).await?;
    assert!(matches!(
        reply,
        Reply::Ok(twopc::protocol::ReplicaReply::Try(twopc::protocol::TryReply { success: true }))
    ));

    // Simulate a coordinator that logged Committed for this tx and then
    // crashed before its commit broadcast ever reached the replica.
    let coordinator_dir = tempfile::tempdir()?;
    let wal_path = coordinator_dir.path().join("master-wal");
    {
        let wal = Wal::open(wal_path.clone())?;
        wal.append(LogRecord::transition("committed-tx", TxState::Started, Operation::NoOp, ""))?;
        wal.append(LogRecord::terminal("committed-tx", TxState::Committed))?;
    }

    let coordinator = Coordinator::open(wal_path, vec![replica_addr])?;
    coordinator.recover().await?;

    assert_eq!(replica.get("foo")?, "bar");

    Ok(())
}

#[tokio::test]
async fn replica_recovery_resolves_dangling_prepared_tx_to_commit_via_coordinator_status() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let wal_path = dir.path().join("wal");
    let committed_path = dir.path().join("committed");
    let temp_path = dir.path().join("temp");

    {
        // Models a replica that logged Prepared for "recovering-tx" and then
        // crashed before ever hearing back from the coordinator.
        let replica = Replica::open(0, wal_path.clone(), committed_path.clone(), temp_path.clone())?;
        assert!(replica.try_put(
            "recovering-tx".into(),
            "foo".into(),
            "bar".into(),
            Default::default(),
        )?);
    }

    let (listener, coordinator_addr) = bind_ephemeral().await;
    tokio::spawn(twopc::rpc::serve(listener, |method: MasterMethod| async move {
        match method {
            MasterMethod::Status(_) => Reply::Ok(MasterReply::Status(StatusReply {
                state: twopc::protocol::CoordinatorTxState::Committed,
            })),
            _ => unreachable!("this stub only answers Status"),
        }
    }));

    // Simulates the process restart: a fresh Replica over the same files.
    let replica = Replica::open(0, wal_path, committed_path, temp_path)?;
    replica.recover(&coordinator_addr).await?;

    assert_eq!(replica.get("foo")?, "bar");
    let status = replica.status();
    assert_eq!(status.in_flight_txs, 0);
    assert_eq!(status.locked_keys, 0);

    Ok(())
}

#[tokio::test]
async fn replica_recovery_resolves_dangling_prepared_tx_to_abort_via_coordinator_status() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let wal_path = dir.path().join("wal");
    let committed_path = dir.path().join("committed");
    let temp_path = dir.path().join("temp");

    {
        let replica = Replica::open(0, wal_path.clone(), committed_path.clone(), temp_path.clone())?;
        assert!(replica.try_put(
            "doomed-tx".into(),
            "foo".into(),
            "bar".into(),
            Default::default(),
        )?);
    }

    let (listener, coordinator_addr) = bind_ephemeral().await;
    tokio::spawn(twopc::rpc::serve(listener, |method: MasterMethod| async move {
        match method {
            MasterMethod::Status(_) => Reply::Ok(MasterReply::Status(StatusReply {
                state: twopc::protocol::CoordinatorTxState::Aborted,
            })),
            _ => unreachable!("this stub only answers Status"),
        }
    }));

    let replica = Replica::open(0, wal_path, committed_path, temp_path)?;
    replica.recover(&coordinator_addr).await?;

    assert!(matches!(replica.get("foo"), Err(Error::KeyNotFound)));
    let status = replica.status();
    assert_eq!(status.in_flight_txs, 0);
    assert_eq!(status.locked_keys, 0);

    Ok(())
}

#[tokio::test]
async fn repeated_abort_after_a_terminal_commit_is_idempotent() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let (replica, addr) = spawn_fresh_replica(0, dir.path()).await;

    let coordinator_dir = tempfile::tempdir()?;
    let coordinator = Coordinator::open(coordinator_dir.path().join("wal"), vec![addr.clone()])?;
    let outcome = coordinator
        .mutate("k", Some("v"), Operation::Put, Default::default(), &[])
        .await?;
    assert_eq!(outcome, MutationOutcome::Ok);
    assert_eq!(replica.get("k")?, "v");

    // A best-effort Abort racing the coordinator's own decision (e.g. a
    // retransmit of an Abort issued before the commit vote came back) must
    // be a harmless no-op once the tx is gone from the replica's in-memory
    // map, not a panic or a corrupted committed value.
    let retried_abort = twopc::protocol::ReplicaMethod::Abort(twopc::protocol::AbortArgs {
        tx_id: "some-other-unrelated-tx".into(),
    });
    let reply: Reply<twopc::protocol::ReplicaReply> = twopc::rpc::call(&addr, &retried_abort).await?;
    assert!(matches!(reply, Reply::Err(_)));
    assert_eq!(replica.get("k")?, "v");

    Ok(())
}
