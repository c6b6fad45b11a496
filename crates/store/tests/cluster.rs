//! Multi-node tests over real Raft RPC on loopback.

use std::path::Path;
use std::time::Duration;
use store::{NodeConfig, NodeId, QueryResult, Store, StoreError};
use tempfile::TempDir;

fn config(dir: &Path, id: NodeId) -> NodeConfig {
    NodeConfig::new(id, dir.to_path_buf())
        .with_raft_addr("127.0.0.1:0")
        .with_client_addr(format!("node-{}.test:9301", id))
        .with_election_timeout(300, 600)
        .with_heartbeat_interval(100)
}

async fn open(dir: &Path, id: NodeId) -> Store {
    Store::open(dir, config(dir, id)).await.unwrap()
}

async fn open_leader(dir: &Path) -> Store {
    let store = open(dir, 1).await;
    store.bootstrap().await.unwrap();
    let leader = store.wait_for_leader(Duration::from_secs(10)).await.unwrap();
    assert_eq!(leader, 1);
    store
}

/// Poll `sql` on `store` until it succeeds with at least `rows` rows.
async fn wait_for_rows(store: &Store, sql: &str, rows: usize) -> QueryResult {
    for _ in 0..200 {
        if let Ok(result) = store.query(sql).await {
            if result.row_count() >= rows {
                return result;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("node {} never returned {} rows for {}", store.node_id(), rows, sql);
}

async fn wait_for_known_leader(store: &Store) -> String {
    for _ in 0..200 {
        if let Some(leader) = store.leader() {
            return leader;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("node {} never learned the leader", store.node_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_converge_and_followers_redirect() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let a = open_leader(dirs[0].path()).await;
    let b = open(dirs[1].path(), 2).await;
    let c = open(dirs[2].path(), 3).await;

    a.join(2, b.node().clone()).await.unwrap();
    a.join(3, c.node().clone()).await.unwrap();

    a.execute("CREATE TABLE t (id INT)").await.unwrap();
    let empty = wait_for_rows(&b, "SELECT * FROM t", 0).await;
    assert_eq!(empty.columns, vec!["id"]);
    assert_eq!(empty.row_count(), 0);

    a.execute("INSERT INTO t VALUES (1)").await.unwrap();
    a.execute("INSERT INTO t VALUES (2)").await.unwrap();
    let rows = wait_for_rows(&c, "SELECT id FROM t ORDER BY id", 2).await;
    assert_eq!(
        rows.values,
        vec![vec![serde_json::json!(1)], vec![serde_json::json!(2)]]
    );

    // Followers refuse writes and point at the leader.
    let leader = wait_for_known_leader(&b).await;
    assert_eq!(leader, "node-1.test:9301");
    let err = b.execute("INSERT INTO t VALUES (3)").await.unwrap_err();
    assert!(matches!(err, StoreError::NotLeader { .. }));
    assert_eq!(err.leader(), Some("node-1.test:9301"));
    assert_eq!(b.query("SELECT * FROM t").await.unwrap().row_count(), 2);

    // Re-joining with an identical record changes nothing.
    a.join(2, b.node().clone()).await.unwrap();
    let stats = a.stats().await.unwrap();
    assert_eq!(stats.consensus.voters, 3);
    assert_eq!(stats.consensus.learners, 0);
    assert_eq!(stats.leader.as_deref(), Some("node-1.test:9301"));

    // A bad statement fails on its own; the next one goes through.
    let err = a.execute("INSRT INTO t VALUES (4)").await.unwrap_err();
    assert!(matches!(err, StoreError::Execution(_)));
    a.execute("INSERT INTO t VALUES (4)").await.unwrap();
    wait_for_rows(&b, "SELECT * FROM t", 3).await;

    for store in [&c, &b, &a] {
        store.close().await.unwrap();
        store.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_apply_in_one_order_everywhere() {
    const WRITERS: usize = 20;

    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let a = open_leader(dirs[0].path()).await;
    let b = open(dirs[1].path(), 2).await;
    let c = open(dirs[2].path(), 3).await;
    a.join(2, b.node().clone()).await.unwrap();
    a.join(3, c.node().clone()).await.unwrap();

    a.execute("CREATE TABLE log (seq INTEGER PRIMARY KEY AUTOINCREMENT, writer INTEGER)")
        .await
        .unwrap();

    let statements: Vec<String> = (0..WRITERS)
        .map(|writer| format!("INSERT INTO log (writer) VALUES ({})", writer))
        .collect();
    let results = futures::future::join_all(statements.iter().map(|sql| a.execute(sql))).await;
    for result in results {
        assert_eq!(result.unwrap().rows_affected, 1);
    }

    let sql = "SELECT seq, writer FROM log ORDER BY seq";
    let on_a = wait_for_rows(&a, sql, WRITERS).await;
    let on_b = wait_for_rows(&b, sql, WRITERS).await;
    let on_c = wait_for_rows(&c, sql, WRITERS).await;
    assert_eq!(on_a.row_count(), WRITERS);
    assert_eq!(on_a.values, on_b.values);
    assert_eq!(on_a.values, on_c.values);

    // Every writer landed exactly once.
    let mut writers: Vec<i64> = on_a
        .values
        .iter()
        .map(|row| row[1].as_i64().unwrap())
        .collect();
    writers.sort_unstable();
    assert_eq!(writers, (0..WRITERS as i64).collect::<Vec<_>>());

    for store in [&c, &b, &a] {
        store.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejoin_with_same_id_replaces_old_address() {
    let dirs: Vec<TempDir> = (0..4).map(|_| TempDir::new().unwrap()).collect();
    let a = open_leader(dirs[0].path()).await;
    let b = open(dirs[1].path(), 2).await;
    let c = open(dirs[2].path(), 3).await;
    a.join(2, b.node().clone()).await.unwrap();
    a.join(3, c.node().clone()).await.unwrap();
    a.execute("CREATE TABLE t (id INT)").await.unwrap();

    // Node 3 comes back from a fresh directory on a new port.
    let old_addr = c.node().raft_addr.clone();
    c.close().await.unwrap();
    let c2 = open(dirs[3].path(), 3).await;
    assert_ne!(c2.node().raft_addr, old_addr);
    a.join(3, c2.node().clone()).await.unwrap();

    let members = a.consensus().raft().metrics().borrow().clone();
    let nodes: Vec<_> = members
        .membership_config
        .membership()
        .nodes()
        .filter(|(id, _)| **id == 3)
        .map(|(_, node)| node.raft_addr.clone())
        .collect();
    assert_eq!(nodes, vec![c2.node().raft_addr.clone()]);

    a.execute("INSERT INTO t VALUES (7)").await.unwrap();
    wait_for_rows(&c2, "SELECT * FROM t", 1).await;

    for store in [&c2, &b, &a] {
        store.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_member_catches_up_from_snapshot() {
    let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
    let a = Store::open(
        dirs[0].path(),
        config(dirs[0].path(), 1).with_snapshot_threshold(10, 0),
    )
    .await
    .unwrap();
    a.bootstrap().await.unwrap();
    a.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    a.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .await
        .unwrap();
    for i in 0..30 {
        a.execute(&format!("INSERT INTO t (v) VALUES ('row {}')", i))
            .await
            .unwrap();
    }

    for _ in 0..200 {
        if a.stats().await.unwrap().consensus.snapshot_index.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(a.stats().await.unwrap().consensus.snapshot_index.is_some());

    let b = open(dirs[1].path(), 2).await;
    a.join(2, b.node().clone()).await.unwrap();

    let rows = wait_for_rows(&b, "SELECT v FROM t ORDER BY id", 30).await;
    assert_eq!(rows.values[0], vec![serde_json::json!("row 0")]);
    assert_eq!(rows.values[29], vec![serde_json::json!("row 29")]);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_rebuilds_database_from_log() {
    let dir = TempDir::new().unwrap();
    {
        let a = open_leader(dir.path()).await;
        a.execute("CREATE TABLE t (id INT)").await.unwrap();
        a.execute("INSERT INTO t VALUES (1), (2)").await.unwrap();
        a.close().await.unwrap();
    }

    let a = open_leader(dir.path()).await;
    let rows = wait_for_rows(&a, "SELECT * FROM t", 2).await;
    assert_eq!(rows.row_count(), 2);
    assert!(dir.path().join("sqlite").join("database.db").exists());
    assert!(dir.path().join("raft").join("raft.log").exists());
    a.close().await.unwrap();
}
