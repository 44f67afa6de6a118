//! Tests against a real server, skipped unless `S2WIRE_TEST_URL` is set,
//! e.g. `s2://root:pw@127.0.0.1:3306/test`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use s2wire::{Client, Config, CursorType, QueryOptions, Value};
use s2wire_core::error::QueryErrorKind;
use s2wire_core::Error;

const URL_ENV: &str = "S2WIRE_TEST_URL";

fn live_config() -> Option<Config> {
    let raw = std::env::var(URL_ENV).ok()?;
    let config = match Config::from_url(raw.trim()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("skipping live tests: cannot parse {URL_ENV}: {e}");
            return None;
        }
    };
    if config.database.is_none() {
        eprintln!("skipping live tests: {URL_ENV} must include a database name");
        return None;
    }
    Some(config.connect_timeout(Duration::from_secs(10)))
}

fn unique_table(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("{}_{}", prefix, nanos)
}

#[test]
fn live_round_trip() {
    let Some(config) = live_config() else {
        eprintln!("skipping live tests: set {URL_ENV}");
        return;
    };
    let mut client = Client::connect(config).unwrap();
    let table = unique_table("s2wire_live");

    client
        .query(&format!("CREATE TABLE {} (a BIGINT, b BIGINT)", table))
        .unwrap();
    let insert = format!("INSERT INTO {} VALUES (?, ?)", table);
    client.execute(&insert, &[Value::Int(5), Value::Int(10)]).unwrap();
    client.execute(&insert, &[Value::Int(7), Value::Int(12)]).unwrap();

    {
        let options = QueryOptions::new().fetch_size(1).cursor_type(CursorType::Scrollable);
        let mut rows = client
            .query_with(&format!("SELECT a, b FROM {} ORDER BY a", table), options)
            .unwrap()
            .into_rows()
            .unwrap();
        assert!(rows.absolute(2).unwrap());
        assert_eq!(rows.row().unwrap().get::<i64>(1).unwrap(), Some(12));
        assert!(rows.relative(-1).unwrap());
        assert_eq!(rows.row().unwrap().get::<i64>(1).unwrap(), Some(10));
    }

    let err = client.query("SELEC 1").unwrap_err();
    assert!(matches!(&err, Error::Query(q) if q.kind == QueryErrorKind::Syntax));

    client.query(&format!("DROP TABLE {}", table)).unwrap();
    client.close().unwrap();
}
