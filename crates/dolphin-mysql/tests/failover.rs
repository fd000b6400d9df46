//! Host selection, reconnect budget and transaction replay.

mod support;

use std::sync::Arc;

use dolphin_core::{ErrorClass, Value};
use dolphin_mysql::{AuthRegistry, FailoverConnection, FailoverState, HostDescriptor, MySqlConfig};

use support::{FakeCluster, FakeServer};

struct Topology {
    cluster: Arc<FakeCluster>,
    servers: Vec<Arc<FakeServer>>,
    hosts: Vec<HostDescriptor>,
}

fn topology(count: usize) -> Topology {
    let cluster = FakeCluster::new();
    let mut servers = Vec::new();
    let mut hosts = Vec::new();
    for i in 1..=count {
        let server = FakeServer::new();
        hosts.push(cluster.add(&format!("db{i}"), Arc::clone(&server)));
        servers.push(server);
    }
    Topology {
        cluster,
        servers,
        hosts,
    }
}

fn open(topo: &Topology, config: MySqlConfig) -> Result<FailoverConnection, dolphin_core::Error> {
    FailoverConnection::connect_with(
        Arc::clone(&topo.cluster) as Arc<dyn dolphin_mysql::Connector>,
        Arc::new(AuthRegistry::with_builtins()),
        config,
    )
}

#[test]
fn connects_to_first_live_host() {
    let topo = topology(3);
    topo.servers[0].kill();
    let conn = open(&topo, support::ha_config(&topo.hosts)).unwrap();
    assert_eq!(conn.state(), FailoverState::Connected);
    assert_eq!(conn.current().unwrap().host(), &topo.hosts[1]);
    assert!(conn.is_blacklisted(&topo.hosts[0]));
    assert_eq!(topo.cluster.attempts(), ["db1", "db2"]);
}

#[test]
fn budget_bounds_attempts_across_sweeps() {
    let topo = topology(3);
    let mut conn = open(&topo, support::ha_config(&topo.hosts).retries_all_down(5)).unwrap();
    let before = topo.cluster.attempts().len();
    for server in &topo.servers {
        server.kill();
    }

    let err = conn.execute_raw("SELECT 1").unwrap_err();
    assert_eq!(err.class(), ErrorClass::FailoverExhausted);
    assert_eq!(conn.state(), FailoverState::ExhaustedFailed);
    assert_eq!(topo.cluster.attempts().len() - before, 5);
    assert!(conn.current().is_none());

    // Terminal: no further attempts and no reuse of the dead link
    for server in &topo.servers {
        server.revive();
    }
    let err = conn.execute_raw("SELECT 1").unwrap_err();
    assert_eq!(err.class(), ErrorClass::FailoverExhausted);
    assert_eq!(topo.cluster.attempts().len() - before, 5);
}

#[test]
fn initial_connect_respects_budget() {
    let topo = topology(3);
    for server in &topo.servers {
        server.kill();
    }
    let err = open(&topo, support::ha_config(&topo.hosts).retries_all_down(4)).unwrap_err();
    assert_eq!(err.class(), ErrorClass::FailoverExhausted);
    assert_eq!(topo.cluster.attempts(), ["db1", "db2", "db3", "db1"]);
}

#[test]
fn statement_outside_transaction_is_retried_on_next_host() {
    let topo = topology(2);
    let mut conn = open(&topo, support::ha_config(&topo.hosts)).unwrap();
    topo.servers[0].kill();

    let results = conn.execute_raw("SELECT 7").unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(conn.current().unwrap().host(), &topo.hosts[1]);
    assert!(conn.is_blacklisted(&topo.hosts[0]));
    assert_eq!(topo.servers[1].queries(), ["SELECT 7"]);
}

#[test]
fn prepared_handles_survive_failover() {
    let topo = topology(2);
    let mut conn = open(&topo, support::ha_config(&topo.hosts)).unwrap();
    let mut stmt = conn.prepare("SELECT ? + ?").unwrap();
    topo.servers[0].kill();

    let result = conn.execute(&mut stmt, &[Value::Int(2), Value::Int(3)]).unwrap();
    let value = result.rows().and_then(|rs| rs.scalar()).cloned();
    assert_eq!(value, Some(Value::BigInt(5)));
    assert_eq!(topo.servers[1].log().prepared, ["SELECT ? + ?"]);
}

#[test]
fn transaction_is_replayed_in_order() {
    let topo = topology(2);
    let config = support::ha_config(&topo.hosts).transaction_replay(true);
    let mut conn = open(&topo, config).unwrap();

    conn.begin().unwrap();
    for i in 1..=3 {
        conn.execute_raw(&format!("INSERT INTO t VALUES ({i})")).unwrap();
    }
    assert_eq!(conn.replay_log().len(), 4);
    topo.servers[0].kill();

    conn.execute_raw("INSERT INTO t VALUES (4)").unwrap();
    assert_eq!(
        topo.servers[1].queries(),
        [
            "START TRANSACTION",
            "INSERT INTO t VALUES (1)",
            "INSERT INTO t VALUES (2)",
            "INSERT INTO t VALUES (3)",
            "INSERT INTO t VALUES (4)",
        ]
    );
    assert_eq!(conn.replay_log().len(), 5);

    conn.commit().unwrap();
    assert!(conn.replay_log().is_empty());
}

#[test]
fn implicit_begin_inside_transaction_adds_nothing_to_replay() {
    let topo = topology(2);
    let config = support::ha_config(&topo.hosts).transaction_replay(true);
    let mut conn = open(&topo, config).unwrap();

    conn.begin().unwrap();
    conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
    conn.begin_implicit_transaction_if_needed().unwrap();
    conn.execute_raw("INSERT INTO t VALUES (2)").unwrap();
    assert_eq!(conn.replay_log().len(), 3);
    topo.servers[0].kill();

    conn.execute_raw("INSERT INTO t VALUES (3)").unwrap();
    assert_eq!(
        topo.servers[1].queries(),
        [
            "START TRANSACTION",
            "INSERT INTO t VALUES (1)",
            "INSERT INTO t VALUES (2)",
            "INSERT INTO t VALUES (3)",
        ]
    );
}

#[test]
fn implicit_begin_is_replayed_when_it_opened_the_transaction() {
    let topo = topology(2);
    let config = support::ha_config(&topo.hosts).transaction_replay(true);
    let mut conn = open(&topo, config).unwrap();
    conn.set_autocommit(false).unwrap();

    conn.begin_implicit_transaction_if_needed().unwrap();
    conn.begin_implicit_transaction_if_needed().unwrap();
    conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
    assert_eq!(conn.replay_log().len(), 2);
    topo.servers[0].kill();

    conn.execute_raw("INSERT INTO t VALUES (2)").unwrap();
    let queries = topo.servers[1].queries();
    let replayed: Vec<&str> = queries
        .iter()
        .map(String::as_str)
        .filter(|q| !q.to_ascii_uppercase().starts_with("SET "))
        .collect();
    assert_eq!(
        replayed,
        [
            "START TRANSACTION",
            "INSERT INTO t VALUES (1)",
            "INSERT INTO t VALUES (2)",
        ]
    );
}

#[test]
fn generated_savepoint_names_stay_unique_after_failover() {
    let topo = topology(2);
    let config = support::ha_config(&topo.hosts).transaction_replay(true);
    let mut conn = open(&topo, config).unwrap();

    conn.begin().unwrap();
    let first = conn.set_savepoint(None).unwrap();
    assert_eq!(first.name(), "dolphin_sp_1");
    topo.servers[0].kill();

    conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
    let second = conn.set_savepoint(None).unwrap();
    assert_ne!(second.name(), first.name());
    assert_eq!(
        topo.servers[1].queries(),
        [
            "START TRANSACTION",
            "SAVEPOINT dolphin_sp_1",
            "INSERT INTO t VALUES (1)",
            "SAVEPOINT dolphin_sp_2",
        ]
    );

    // Both savepoints exist on the new session and can be targeted
    conn.rollback_to(&first).unwrap();
}

#[test]
fn replay_overflow_is_terminal_for_the_transaction() {
    let topo = topology(2);
    let config = support::ha_config(&topo.hosts)
        .transaction_replay(true)
        .transaction_replay_size(2);
    let mut conn = open(&topo, config).unwrap();

    conn.begin().unwrap();
    conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
    conn.execute_raw("INSERT INTO t VALUES (2)").unwrap();
    assert!(conn.replay_log().overflowed());
    topo.servers[0].kill();

    let err = conn.execute_raw("INSERT INTO t VALUES (3)").unwrap_err();
    assert_eq!(err.class(), ErrorClass::ReplayOverflow);
    assert!(topo.servers[1].queries().is_empty());

    // The logical connection itself is usable again
    assert_eq!(conn.state(), FailoverState::Connected);
    conn.execute_raw("SELECT 1").unwrap();
}

#[test]
fn transaction_without_replay_is_lost() {
    let topo = topology(2);
    let mut conn = open(&topo, support::ha_config(&topo.hosts)).unwrap();
    conn.begin().unwrap();
    topo.servers[0].kill();

    let err = conn.execute_raw("INSERT INTO t VALUES (1)").unwrap_err();
    assert_eq!(err.class(), ErrorClass::ConnectionLost);
    assert!(matches!(err, dolphin_core::Error::Transaction(_)));
}

#[test]
fn commit_on_lost_link_reports_unknown_outcome() {
    let topo = topology(2);
    let config = support::ha_config(&topo.hosts).transaction_replay(true);
    let mut conn = open(&topo, config).unwrap();
    conn.begin().unwrap();
    conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
    topo.servers[0].kill();

    let err = conn.commit().unwrap_err();
    assert_eq!(err.class(), ErrorClass::ConnectionLost);
    assert!(topo.servers[1].queries().is_empty());
    assert!(conn.replay_log().is_empty());
}

#[test]
fn rollback_on_lost_link_succeeds() {
    let topo = topology(2);
    let config = support::ha_config(&topo.hosts).transaction_replay(true);
    let mut conn = open(&topo, config).unwrap();
    conn.begin().unwrap();
    conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
    topo.servers[0].kill();

    conn.rollback().unwrap();
    assert!(conn.replay_log().is_empty());
    assert!(!conn.current().unwrap().in_transaction());
}

#[test]
fn session_is_restored_after_failover() {
    let topo = topology(2);
    let mut conn = open(&topo, support::ha_config(&topo.hosts)).unwrap();
    conn.set_database("analytics").unwrap();
    topo.servers[0].kill();

    conn.execute_raw("SELECT 1").unwrap();
    assert_eq!(topo.servers[1].log().databases, ["analytics"]);
    assert_eq!(
        conn.current().unwrap().session_snapshot().database.as_deref(),
        Some("analytics")
    );
}

#[test]
fn without_ha_mode_link_loss_surfaces() {
    let topo = topology(2);
    let mut conn = open(&topo, support::config(&topo.hosts)).unwrap();
    topo.servers[0].kill();

    let err = conn.execute_raw("SELECT 1").unwrap_err();
    assert_eq!(err.class(), ErrorClass::ConnectionLost);
    assert_eq!(conn.state(), FailoverState::Degraded);
    assert_eq!(topo.cluster.attempts(), ["db1"]);
}
