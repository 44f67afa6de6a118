mod common;

use std::sync::Arc;

use s2wire::{Client, Config, HostRegistry, Value};
use s2wire_core::{ConnectionErrorKind, Error};

use common::MockServer;

fn pair() -> (MockServer, MockServer) {
    // Distinct id ranges make re-prepared statements visible.
    (
        MockServer::start_with_statement_base(1),
        MockServer::start_with_statement_base(500),
    )
}

fn config(primary: &MockServer, secondary: &MockServer) -> Config {
    primary
        .config()
        .hosts([primary.host(), secondary.host()])
        .retries_all_down(0)
}

fn connection_kind(err: &Error) -> Option<ConnectionErrorKind> {
    match err {
        Error::Connection(c) => Some(c.kind),
        _ => None,
    }
}

const INSERT: &str = "INSERT INTO t VALUES (?,?)";

#[test]
fn replays_open_transaction_on_next_host() {
    let (a, b) = pair();
    let registry = Arc::new(HostRegistry::new());
    let mut client =
        Client::connect_with_registry(config(&a, &b).transaction_replay(true), Arc::clone(&registry)).unwrap();
    assert_eq!(client.current_host(), Some(&a.host()));

    client.begin().unwrap();
    client.execute(INSERT, &[Value::Int(1), Value::Int(1)]).unwrap();
    client.execute(INSERT, &[Value::Int(2), Value::Int(2)]).unwrap();
    assert_eq!(client.replay_log().len(), 3);

    a.drop_connection_on("(3,3)");
    let update = client.execute(INSERT, &[Value::Int(3), Value::Int(3)]).unwrap();
    assert_eq!(update.affected_rows(), 1);
    drop(update);
    client.commit().unwrap();

    assert_eq!(client.current_host(), Some(&b.host()));
    assert!(registry.is_denied(&a.host()));
    assert_eq!(b.rows(), vec![(1, 1), (2, 2), (3, 3)]);
    assert_eq!(
        b.statements(),
        vec![
            "BEGIN".to_string(),
            format!("PREPARE {}", INSERT),
            "EXECUTE 500 INSERT INTO t VALUES (1,1)".to_string(),
            "EXECUTE 500 INSERT INTO t VALUES (2,2)".to_string(),
            "EXECUTE 500 INSERT INTO t VALUES (3,3)".to_string(),
            "COMMIT".to_string(),
        ]
    );
    assert!(client.replay_log().is_empty());
}

#[test]
fn transaction_lost_without_replay() {
    let (a, b) = pair();
    let mut client = Client::connect_with_registry(config(&a, &b), Arc::new(HostRegistry::new())).unwrap();

    client.begin().unwrap();
    client.query("INSERT INTO t VALUES (1, 1)").unwrap();
    a.drop_connection_on("(2, 2)");
    let err = client.query("INSERT INTO t VALUES (2, 2)").unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::TransactionLost));
    assert!(err.is_transient());
    assert!(!err.requires_reconnect());

    assert_eq!(client.current_host(), Some(&b.host()));
    assert!(b.rows().is_empty());
    assert!(!client.in_transaction());
    client.query("SELECT 1").unwrap();
}

#[test]
fn oversized_transaction_is_not_replayed() {
    let (a, b) = pair();
    let config = config(&a, &b).transaction_replay(true).transaction_replay_size(2);
    let mut client = Client::connect_with_registry(config, Arc::new(HostRegistry::new())).unwrap();

    client.begin().unwrap();
    for i in 0..3 {
        client.query(&format!("INSERT INTO t VALUES ({}, {})", i, i)).unwrap();
    }
    assert!(client.replay_log().is_dirty());

    a.drop_connection_on("(9, 9)");
    let err = client.query("INSERT INTO t VALUES (9, 9)").unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::TransactionLost));
    assert!(b.statements().is_empty());
}

#[test]
fn failed_commit_is_never_retried() {
    let (a, b) = pair();
    let mut client =
        Client::connect_with_registry(config(&a, &b).transaction_replay(true), Arc::new(HostRegistry::new())).unwrap();

    client.begin().unwrap();
    client.query("INSERT INTO t VALUES (1, 1)").unwrap();
    a.drop_connection_on("COMMIT");
    let err = client.commit().unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::TransientReconnected));

    assert_eq!(client.current_host(), Some(&b.host()));
    assert!(b.statements().is_empty(), "{:?}", b.statements());
    assert!(client.replay_log().is_empty());
}

#[test]
fn failed_rollback_succeeds_on_new_host() {
    let (a, b) = pair();
    let mut client =
        Client::connect_with_registry(config(&a, &b).transaction_replay(true), Arc::new(HostRegistry::new())).unwrap();

    client.begin().unwrap();
    client.query("INSERT INTO t VALUES (1, 1)").unwrap();
    a.drop_connection_on("ROLLBACK");
    client.rollback().unwrap();
    assert!(b.rows().is_empty());
    assert!(!client.in_transaction());
}

#[test]
fn failure_outside_transaction_reconnects_without_retry() {
    let (a, b) = pair();
    let mut client = Client::connect_with_registry(config(&a, &b), Arc::new(HostRegistry::new())).unwrap();

    a.drop_connection_on("(4, 4)");
    let err = client.query("INSERT INTO t VALUES (4, 4)").unwrap_err();
    assert_eq!(connection_kind(&err), Some(ConnectionErrorKind::TransientReconnected));
    assert!(b.rows().is_empty());

    client.query("INSERT INTO t VALUES (4, 4)").unwrap();
    assert_eq!(b.rows(), vec![(4, 4)]);
}

#[test]
fn changed_session_state_follows_failover() {
    let (a, b) = pair();
    let mut client = Client::connect_with_registry(config(&a, &b), Arc::new(HostRegistry::new())).unwrap();

    client.set_database("inventory").unwrap();
    a.drop_connection_on("SELECT 1");
    let err = client.query("SELECT 1").unwrap_err();
    assert!(err.is_transient());

    assert!(b.log().contains(&"INIT_DB inventory".to_string()));
    let ctx = client.context().unwrap();
    assert_eq!(ctx.database(), Some("inventory"));
    assert!(!b.log().iter().any(|l| l.starts_with("SET autocommit")));
}

#[test]
fn denied_host_is_skipped_until_it_expires() {
    let (a, b) = pair();
    let registry = Arc::new(HostRegistry::new());
    registry.deny(&a.host(), std::time::Duration::from_secs(60));

    let client = Client::connect_with_registry(config(&a, &b), Arc::clone(&registry)).unwrap();
    assert_eq!(client.current_host(), Some(&b.host()));
    assert_eq!(a.connections(), 0);
    assert_eq!(registry.load(&b.host()), 1);
    assert!(registry.last_connected(&b.host()).is_some());
    assert_eq!(registry.last_connected(&a.host()), None);
    drop(client);
    assert_eq!(registry.load(&b.host()), 0);

    registry.deny(&a.host(), std::time::Duration::ZERO);
    let client = Client::connect_with_registry(config(&a, &b), Arc::clone(&registry)).unwrap();
    assert_eq!(client.current_host(), Some(&a.host()));
}

#[test]
fn all_denied_hosts_are_still_tried() {
    let (a, b) = pair();
    let registry = Arc::new(HostRegistry::new());
    registry.deny(&a.host(), std::time::Duration::from_secs(60));
    registry.deny(&b.host(), std::time::Duration::from_secs(30));

    let client = Client::connect_with_registry(config(&a, &b), Arc::clone(&registry)).unwrap();
    assert_eq!(client.current_host(), Some(&b.host()), "earliest expiry first");
    assert!(!registry.is_denied(&b.host()));
}
